#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Client-side SMTP wire layer.
//!
//! This crate speaks just enough SMTP to verify a recipient: connection
//! establishment, STARTTLS upgrade, the envelope commands, and reply
//! parsing. There is deliberately no DATA support; a verifier announces a
//! recipient and hangs up, it never transmits message content.

mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
