//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors raised by the wire layer itself. Server reply codes are not
/// errors at this level; commands return a [`crate::Response`] and the
/// caller decides what a 4xx or 5xx means.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO failure during connect, read or write.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection mid-session.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// The server sent something that does not parse as an SMTP reply.
    #[error("failed to parse SMTP reply: {0}")]
    Parse(String),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A reply contained non-UTF-8 bytes.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Whether a retry on a fresh connection could plausibly succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Io(_) | Self::ConnectionClosed)
    }

    /// Whether this is a protocol-level fault rather than a transport one.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Utf8(_))
    }
}

/// Specialized `Result` for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
