//! SMTP client connection with STARTTLS support.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::{ClientError, Result};
use crate::response::Response;

/// Initial read buffer size.
const BUFFER_SIZE: usize = 4096;

/// Cap on buffer growth; a reply larger than this is a protocol fault.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, server_name: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::Tls("connection is already TLS".to_string()));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("failed to add root certificate: {e}")))?;
        }
        if !certs.errors.is_empty() {
            tracing::warn!(?certs.errors, "some native root certificates failed to load");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

/// Certificate verifier that accepts everything. Gated behind an explicit
/// opt-in; a verifier probing arbitrary MX hosts usually cannot insist on
/// valid chains.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// An SMTP client session over a single connection.
///
/// Every command returns the server [`Response`]; reply codes are data, not
/// errors. Timeouts are the caller's concern: each method suspends only on
/// socket IO, so wrapping a call in `tokio::time::timeout` bounds it.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Connect to `addr` (`host:port`). `server_name` is used for TLS SNI
    /// and certificate validation if the session is later upgraded.
    ///
    /// # Errors
    ///
    /// Returns an error when the TCP connection fails.
    pub async fn connect(addr: &str, server_name: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_name: server_name.into(),
            accept_invalid_certs: false,
        })
    }

    /// Accept invalid TLS certificates on STARTTLS upgrade.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Whether the session has been upgraded to TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    /// Read the 220 greeting banner.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or parsing fails.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Send one command line and read the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the read fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        let data = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await?;
        self.read_response().await
    }

    /// `EHLO <hostname>`
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn ehlo(&mut self, hostname: &str) -> Result<Response> {
        self.command(&format!("EHLO {hostname}")).await
    }

    /// `MAIL FROM:<return-path>`
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn mail_from(&mut self, return_path: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{return_path}>")).await
    }

    /// `RCPT TO:<forward-path>`, the verb whose reply carries the verdict.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn rcpt_to(&mut self, forward_path: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{forward_path}>")).await
    }

    /// `RSET`
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// `QUIT`
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Send `STARTTLS` and, on a 2xx reply, upgrade the connection.
    ///
    /// A non-2xx reply leaves the plaintext connection usable and is
    /// returned as-is. A failed handshake consumes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                connection
                    .upgrade_to_tls(&self.server_name, self.accept_invalid_certs)
                    .await?,
            );
            // Pre-upgrade pipelined bytes must not leak into the TLS session.
            self.buffer_pos = 0;
        }

        Ok(response)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
