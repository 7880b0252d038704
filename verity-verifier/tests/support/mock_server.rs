//! Scripted mock SMTP server.
#![allow(dead_code)] // test fixture; not every test uses every knob
//!
//! Simulates a recipient MX for the end-to-end tests: per-recipient RCPT
//! replies, per-connection behavior switches, response delays, command
//! hangs, and a full command/connection log for asserting on traffic.

use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use verity_verifier::dns::MxRecord;

type RcptHandler = dyn Fn(&str, usize) -> (u16, String) + Send + Sync;

/// One command observed by the server.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub connection: usize,
    pub verb: String,
    pub argument: String,
    pub at: Instant,
}

struct Config {
    greeting: (u16, String),
    capabilities: Vec<String>,
    advertise_starttls: bool,
    starttls_response: (u16, String),
    mail_from_response: (u16, String),
    rcpt: Arc<RcptHandler>,
    response_delay: Option<Duration>,
    hang_on_verb: Option<String>,
    hang_on_connection: Option<usize>,
}

#[derive(Default)]
struct Telemetry {
    commands: Mutex<Vec<CommandRecord>>,
    connections: AtomicUsize,
    connection_times: Mutex<Vec<Instant>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// A mock MX listening on an ephemeral local port.
pub struct MockMailServer {
    addr: SocketAddr,
    telemetry: Arc<Telemetry>,
}

impl MockMailServer {
    pub fn builder() -> MockMailServerBuilder {
        MockMailServerBuilder::new()
    }

    /// A server that answers every RCPT with the given code.
    pub async fn accepting_with(code: u16) -> Self {
        Self::builder()
            .rcpt(move |_, _| (code, "scripted".to_string()))
            .start()
            .await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// An MX record pointing at this server.
    pub fn mx_record(&self, priority: u16) -> MxRecord {
        MxRecord::new("127.0.0.1", priority).with_port(self.addr.port())
    }

    pub fn connection_count(&self) -> usize {
        self.telemetry.connections.load(Ordering::SeqCst)
    }

    pub fn connection_times(&self) -> Vec<Instant> {
        self.telemetry.connection_times.lock().clone()
    }

    /// Most connections ever open at once.
    pub fn peak_active_connections(&self) -> usize {
        self.telemetry.peak_active.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.telemetry.commands.lock().clone()
    }

    /// The RCPT commands seen, in order.
    pub fn rcpt_commands(&self) -> Vec<CommandRecord> {
        self.commands()
            .into_iter()
            .filter(|record| record.verb == "RCPT")
            .collect()
    }
}

pub struct MockMailServerBuilder {
    config: Config,
}

impl MockMailServerBuilder {
    fn new() -> Self {
        Self {
            config: Config {
                greeting: (220, "mock ESMTP ready".to_string()),
                capabilities: vec!["PIPELINING".to_string(), "SIZE 35882577".to_string()],
                advertise_starttls: false,
                starttls_response: (454, "TLS not available".to_string()),
                mail_from_response: (250, "OK".to_string()),
                rcpt: Arc::new(|_, _| (250, "Recipient OK".to_string())),
                response_delay: None,
                hang_on_verb: None,
                hang_on_connection: None,
            },
        }
    }

    pub fn greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = (code, message.into());
        self
    }

    /// Reply to RCPT based on the recipient and the connection index.
    pub fn rcpt<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, usize) -> (u16, String) + Send + Sync + 'static,
    {
        self.config.rcpt = Arc::new(handler);
        self
    }

    pub fn mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = (code, message.into());
        self
    }

    /// Advertise STARTTLS in EHLO (the upgrade itself is refused with the
    /// configured response).
    pub fn advertise_starttls(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.advertise_starttls = true;
        self.config.starttls_response = (code, message.into());
        self
    }

    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Hang (never reply) when the given verb arrives, optionally only on
    /// one connection index.
    pub fn hang_on(mut self, verb: impl Into<String>, connection: Option<usize>) -> Self {
        self.config.hang_on_verb = Some(verb.into().to_ascii_uppercase());
        self.config.hang_on_connection = connection;
        self
    }

    pub async fn start(self) -> MockMailServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");

        let config = Arc::new(self.config);
        let telemetry = Arc::new(Telemetry::default());
        let telemetry_handle = Arc::clone(&telemetry);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    return;
                };
                let config = Arc::clone(&config);
                let telemetry = Arc::clone(&telemetry_handle);
                tokio::spawn(async move {
                    let index = telemetry.connections.fetch_add(1, Ordering::SeqCst);
                    telemetry.connection_times.lock().push(Instant::now());

                    let active = telemetry.active.fetch_add(1, Ordering::SeqCst) + 1;
                    telemetry.peak_active.fetch_max(active, Ordering::SeqCst);

                    let _ = handle_client(stream, index, &config, &telemetry).await;

                    telemetry.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        MockMailServer { addr, telemetry }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    connection: usize,
    config: &Config,
    telemetry: &Telemetry,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let (code, message) = &config.greeting;
    writer
        .write_all(format!("{code} {message}\r\n").as_bytes())
        .await?;
    writer.flush().await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let trimmed = line.trim();
        let (verb, argument) = trimmed
            .split_once(' ')
            .map_or((trimmed, ""), |(v, rest)| (v, rest));
        let verb = verb.to_ascii_uppercase();

        telemetry.commands.lock().push(CommandRecord {
            connection,
            verb: verb.clone(),
            argument: argument.to_string(),
            at: Instant::now(),
        });

        let hang = config.hang_on_verb.as_deref() == Some(verb.as_str())
            && config
                .hang_on_connection
                .is_none_or(|only| only == connection);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Ok(());
        }

        if let Some(delay) = config.response_delay {
            tokio::time::sleep(delay).await;
        }

        let reply = match verb.as_str() {
            "EHLO" | "HELO" => {
                let mut lines = vec!["mock.local".to_string()];
                lines.extend(config.capabilities.iter().cloned());
                if config.advertise_starttls {
                    lines.push("STARTTLS".to_string());
                }
                let count = lines.len();
                lines
                    .iter()
                    .enumerate()
                    .map(|(i, cap)| {
                        if i + 1 < count {
                            format!("250-{cap}\r\n")
                        } else {
                            format!("250 {cap}\r\n")
                        }
                    })
                    .collect::<String>()
            }
            "MAIL" => {
                let (code, message) = &config.mail_from_response;
                format!("{code} {message}\r\n")
            }
            "RCPT" => {
                let recipient = argument
                    .trim_start_matches("TO:")
                    .trim_start_matches("to:")
                    .trim_matches(['<', '>'].as_slice());
                let (code, message) = (config.rcpt)(recipient, connection);
                format!("{code} {message}\r\n")
            }
            "STARTTLS" => {
                let (code, message) = &config.starttls_response;
                format!("{code} {message}\r\n")
            }
            "RSET" => "250 OK\r\n".to_string(),
            "QUIT" => {
                writer.write_all(b"221 bye\r\n").await?;
                writer.flush().await?;
                return Ok(());
            }
            _ => "500 unrecognized command\r\n".to_string(),
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }
}
