//! The SMTP prober.
//!
//! Drives the RCPT TO handshake against one MX as an explicit state
//! machine:
//!
//! ```text
//! Connect → Banner → Ehlo → [StartTls → EhloTls] → MailFrom → Rcpt
//! ```
//!
//! Each transition consumes exactly one SMTP reply and is individually
//! bounded by the configured timeouts. QUIT is sent best-effort on every
//! terminal path. The reply recorded at RCPT carries the verdict; a failure
//! at an earlier stage records the code and the stage it failed in.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace};

use verity_smtp::{ClientError, Response, SmtpClient};

use crate::classify::is_deterministic_rcpt;
use crate::config::{RetryConfig, SmtpConfig};
use crate::dns::MxRecord;

/// The stage of the handshake a reply or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    Connect,
    Banner,
    Ehlo,
    StartTls,
    EhloTls,
    MailFrom,
    Rcpt,
}

impl ProbeStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Banner => "banner",
            Self::Ehlo => "ehlo",
            Self::StartTls => "starttls",
            Self::EhloTls => "ehlo_tls",
            Self::MailFrom => "mail_from",
            Self::Rcpt => "rcpt",
        }
    }
}

impl std::fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal SMTP reply observed by the prober.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    pub stage: ProbeStage,
    pub code: u16,
    pub response: String,
    pub mx_host: String,
}

impl ProbeReply {
    /// Whether this reply decides the verdict outright (250/251 or
    /// 550/551/553 at RCPT). Anything else lets the caller fall over to
    /// the next MX.
    #[must_use]
    pub fn is_deterministic(&self) -> bool {
        self.stage == ProbeStage::Rcpt && is_deterministic_rcpt(self.code)
    }
}

/// Failures that produced no usable SMTP reply.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection to {mx_host} failed: {message}")]
    Connect { mx_host: String, message: String },

    #[error("timed out at {stage} with {mx_host}")]
    Timeout { mx_host: String, stage: ProbeStage },

    #[error("transport failure at {stage} with {mx_host}: {message}")]
    Transport {
        mx_host: String,
        stage: ProbeStage,
        message: String,
    },

    #[error("TLS handshake with {mx_host} failed: {message}")]
    TlsHandshake { mx_host: String, message: String },

    #[error("protocol fault at {stage} with {mx_host}: {message}")]
    Protocol {
        mx_host: String,
        stage: ProbeStage,
        message: String,
    },

    /// The server answered 421 somewhere; the whole attempt ends and the
    /// Rate Gate is told to back off.
    #[error("rate limited by {mx_host}: {message}")]
    RateLimited { mx_host: String, message: String },
}

impl ProbeError {
    /// Network-level failures worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }

    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

enum State {
    Connect,
    Banner(SmtpClient),
    Ehlo(SmtpClient),
    StartTls(SmtpClient),
    EhloTls(SmtpClient),
    MailFrom(SmtpClient),
    Rcpt(SmtpClient),
}

/// Runs RCPT TO probes with the configured retry discipline.
pub struct SmtpProber {
    smtp: SmtpConfig,
    retry: RetryConfig,
}

impl SmtpProber {
    #[must_use]
    pub const fn new(smtp: SmtpConfig, retry: RetryConfig) -> Self {
        Self { smtp, retry }
    }

    /// Probe one MX with retries: network errors, 4xx replies and STARTTLS
    /// handshake faults are retried with exponential backoff; a failed TLS
    /// handshake additionally earns one reconnect without STARTTLS; 5xx
    /// replies and 421 are terminal.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] when every attempt failed without an SMTP
    /// reply to report.
    pub async fn probe_mx(
        &self,
        forward_path: &str,
        mx: &MxRecord,
    ) -> Result<ProbeReply, ProbeError> {
        let mut allow_starttls = true;
        let mut protocol_retried = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt(forward_path, mx, allow_starttls).await {
                Ok(reply)
                    if reply.code >= 400
                        && reply.code < 500
                        && attempt < self.retry.max_attempts =>
                {
                    debug!(
                        mx = %mx.exchange,
                        code = reply.code,
                        stage = %reply.stage,
                        attempt,
                        "transient reply, backing off"
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Ok(reply) => return Ok(reply),
                Err(ProbeError::TlsHandshake { mx_host, message }) => {
                    if allow_starttls {
                        debug!(mx = %mx_host, error = %message, "TLS handshake failed, reconnecting without STARTTLS");
                        allow_starttls = false;
                    } else if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    } else {
                        return Err(ProbeError::TlsHandshake { mx_host, message });
                    }
                }
                Err(err) if err.is_protocol() => {
                    if protocol_retried || attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    protocol_retried = true;
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    debug!(mx = %mx.exchange, error = %err, attempt, "probe attempt failed, backing off");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A single handshake without the retry discipline; catch-all probes
    /// use this so one random local-part costs one session. The STARTTLS
    /// plaintext fallback still applies.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] when the attempt produced no SMTP reply.
    pub async fn probe_once(
        &self,
        forward_path: &str,
        mx: &MxRecord,
    ) -> Result<ProbeReply, ProbeError> {
        match self.attempt(forward_path, mx, true).await {
            Err(ProbeError::TlsHandshake { .. }) => self.attempt(forward_path, mx, false).await,
            other => other,
        }
    }

    /// One pass through the state machine.
    async fn attempt(
        &self,
        forward_path: &str,
        mx: &MxRecord,
        allow_starttls: bool,
    ) -> Result<ProbeReply, ProbeError> {
        let mx_host = mx.exchange.clone();
        let mut state = State::Connect;

        loop {
            state = match state {
                State::Connect => {
                    trace!(mx = %mx_host, "connecting");
                    let client = timeout(
                        self.smtp.connect_timeout(),
                        SmtpClient::connect(&mx.address(), &mx.exchange),
                    )
                    .await
                    .map_err(|_| ProbeError::Timeout {
                        mx_host: mx_host.clone(),
                        stage: ProbeStage::Connect,
                    })?
                    .map_err(|e| ProbeError::Connect {
                        mx_host: mx_host.clone(),
                        message: e.to_string(),
                    })?
                    .accept_invalid_certs(self.smtp.tls_insecure_skip_verify);
                    State::Banner(client)
                }

                State::Banner(mut client) => {
                    let reply = self
                        .step(client.read_greeting(), &mx_host, ProbeStage::Banner)
                        .await?;
                    match self
                        .gatekeep(client, ProbeStage::Banner, reply, &mx_host)
                        .await?
                    {
                        Step::Terminal(reply) => return Ok(reply),
                        Step::Continue(client) => State::Ehlo(client),
                    }
                }

                State::Ehlo(mut client) => {
                    let reply = self
                        .step(
                            client.ehlo(&self.smtp.ehlo_hostname),
                            &mx_host,
                            ProbeStage::Ehlo,
                        )
                        .await?;
                    let starttls = allow_starttls && reply.advertises("STARTTLS");
                    match self.gatekeep(client, ProbeStage::Ehlo, reply, &mx_host).await? {
                        Step::Terminal(reply) => return Ok(reply),
                        Step::Continue(client) if starttls => State::StartTls(client),
                        Step::Continue(client) => State::MailFrom(client),
                    }
                }

                State::StartTls(mut client) => {
                    match timeout(self.smtp.read_timeout(), client.starttls()).await {
                        Err(_) => {
                            return Err(ProbeError::Timeout {
                                mx_host,
                                stage: ProbeStage::StartTls,
                            });
                        }
                        Ok(Err(err)) => {
                            return Err(map_client_err(&mx_host, ProbeStage::StartTls, err));
                        }
                        Ok(Ok(reply)) if reply.code == 421 => {
                            self.quit_quietly(&mut client).await;
                            return Err(ProbeError::RateLimited {
                                mx_host,
                                message: reply.message(),
                            });
                        }
                        // A polite refusal leaves the plaintext session usable.
                        Ok(Ok(reply)) if !reply.is_success() => State::MailFrom(client),
                        Ok(Ok(_)) => State::EhloTls(client),
                    }
                }

                State::EhloTls(mut client) => {
                    let reply = self
                        .step(
                            client.ehlo(&self.smtp.ehlo_hostname),
                            &mx_host,
                            ProbeStage::EhloTls,
                        )
                        .await?;
                    match self
                        .gatekeep(client, ProbeStage::EhloTls, reply, &mx_host)
                        .await?
                    {
                        Step::Terminal(reply) => return Ok(reply),
                        Step::Continue(client) => State::MailFrom(client),
                    }
                }

                State::MailFrom(mut client) => {
                    let reply = self
                        .step(
                            client.mail_from(&self.smtp.mail_from),
                            &mx_host,
                            ProbeStage::MailFrom,
                        )
                        .await?;
                    match self
                        .gatekeep(client, ProbeStage::MailFrom, reply, &mx_host)
                        .await?
                    {
                        Step::Terminal(reply) => return Ok(reply),
                        Step::Continue(client) => State::Rcpt(client),
                    }
                }

                State::Rcpt(mut client) => {
                    let reply = self
                        .step(client.rcpt_to(forward_path), &mx_host, ProbeStage::Rcpt)
                        .await?;
                    self.quit_quietly(&mut client).await;
                    if reply.code == 421 {
                        return Err(ProbeError::RateLimited {
                            mx_host,
                            message: reply.message(),
                        });
                    }
                    return Ok(ProbeReply {
                        stage: ProbeStage::Rcpt,
                        code: reply.code,
                        response: reply.message(),
                        mx_host,
                    });
                }
            };
        }
    }

    /// Common reply handling for the stages that must see 2xx to proceed.
    async fn gatekeep(
        &self,
        mut client: SmtpClient,
        stage: ProbeStage,
        reply: Response,
        mx_host: &str,
    ) -> Result<Step, ProbeError> {
        if reply.code == 421 {
            self.quit_quietly(&mut client).await;
            return Err(ProbeError::RateLimited {
                mx_host: mx_host.to_string(),
                message: reply.message(),
            });
        }
        if reply.is_success() {
            return Ok(Step::Continue(client));
        }
        self.quit_quietly(&mut client).await;
        Ok(Step::Terminal(ProbeReply {
            stage,
            code: reply.code,
            response: reply.message(),
            mx_host: mx_host.to_string(),
        }))
    }

    async fn step<F>(
        &self,
        exchange: F,
        mx_host: &str,
        stage: ProbeStage,
    ) -> Result<Response, ProbeError>
    where
        F: Future<Output = verity_smtp::Result<Response>>,
    {
        match timeout(self.smtp.read_timeout(), exchange).await {
            Err(_) => Err(ProbeError::Timeout {
                mx_host: mx_host.to_string(),
                stage,
            }),
            Ok(Err(err)) => Err(map_client_err(mx_host, stage, err)),
            Ok(Ok(reply)) => {
                trace!(mx = %mx_host, stage = %stage, code = reply.code, "reply");
                Ok(reply)
            }
        }
    }

    async fn quit_quietly(&self, client: &mut SmtpClient) {
        let _ = timeout(self.smtp.write_timeout(), client.quit()).await;
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.backoff(attempt);
        let jitter =
            1.0 + self.retry.jitter_factor * (rand::rng().random::<f64>() * 2.0 - 1.0);
        base.mul_f64(jitter.max(0.0))
    }
}

enum Step {
    Continue(SmtpClient),
    Terminal(ProbeReply),
}

fn map_client_err(mx_host: &str, stage: ProbeStage, err: ClientError) -> ProbeError {
    match err {
        ClientError::Tls(message) => ProbeError::TlsHandshake {
            mx_host: mx_host.to_string(),
            message,
        },
        ClientError::Parse(_) | ClientError::Utf8(_) => ProbeError::Protocol {
            mx_host: mx_host.to_string(),
            stage,
            message: err.to_string(),
        },
        ClientError::Io(_) | ClientError::ConnectionClosed => ProbeError::Transport {
            mx_host: mx_host.to_string(),
            stage,
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal scripted SMTP listener: answers the envelope commands and
    /// replies to RCPT with the configured code, which can change between
    /// connections.
    async fn spawn_server(rcpt_codes: Vec<u16>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let codes = Arc::new((AtomicU16::new(0), rcpt_codes));

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let codes = Arc::clone(&codes);
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.split();
                    let mut reader = BufReader::new(reader);
                    let mut line = String::new();

                    let index = codes.0.fetch_add(1, Ordering::SeqCst) as usize;
                    let rcpt_code = *codes
                        .1
                        .get(index.min(codes.1.len().saturating_sub(1)))
                        .unwrap_or(&250);

                    writer.write_all(b"220 mock ESMTP\r\n").await.ok();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let upper = line.to_ascii_uppercase();
                        let reply: String = if upper.starts_with("EHLO") {
                            "250-mock\r\n250 SIZE 35882577\r\n".to_string()
                        } else if upper.starts_with("MAIL") {
                            "250 OK\r\n".to_string()
                        } else if upper.starts_with("RCPT") {
                            format!("{rcpt_code} scripted\r\n")
                        } else if upper.starts_with("QUIT") {
                            writer.write_all(b"221 bye\r\n").await.ok();
                            return;
                        } else {
                            "500 unknown\r\n".to_string()
                        };
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    fn prober() -> SmtpProber {
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff_ms: 10,
            factor: 2.0,
            jitter_factor: 0.0,
        };
        SmtpProber::new(SmtpConfig::new("verify.test", "probe@verify.test"), retry)
    }

    fn mx_for(addr: SocketAddr) -> MxRecord {
        MxRecord::new("127.0.0.1", 10).with_port(addr.port())
    }

    #[tokio::test]
    async fn acceptance_is_reported_at_rcpt() {
        let addr = spawn_server(vec![250]).await;
        let reply = prober()
            .probe_mx("user@example.com", &mx_for(addr))
            .await
            .unwrap();
        assert_eq!(reply.stage, ProbeStage::Rcpt);
        assert_eq!(reply.code, 250);
        assert!(reply.is_deterministic());
    }

    #[tokio::test]
    async fn rejection_is_reported_at_rcpt() {
        let addr = spawn_server(vec![550]).await;
        let reply = prober()
            .probe_mx("nobody@example.com", &mx_for(addr))
            .await
            .unwrap();
        assert_eq!(reply.code, 550);
        assert!(reply.is_deterministic());
    }

    #[tokio::test]
    async fn transient_rcpt_is_retried() {
        let addr = spawn_server(vec![451, 451, 250]).await;
        let reply = prober()
            .probe_mx("slow@example.com", &mx_for(addr))
            .await
            .unwrap();
        assert_eq!(reply.code, 250);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_transient_reply() {
        let addr = spawn_server(vec![451, 451, 451]).await;
        let reply = prober()
            .probe_mx("slow@example.com", &mx_for(addr))
            .await
            .unwrap();
        assert_eq!(reply.code, 451);
        assert!(!reply.is_deterministic());
    }

    #[tokio::test]
    async fn rate_limit_is_not_retried() {
        let addr = spawn_server(vec![421]).await;
        let err = prober()
            .probe_mx("burst@example.com", &mx_for(addr))
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = prober()
            .probe_mx("user@example.com", &mx_for(addr))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
