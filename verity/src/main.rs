//! Command-line front end: verify addresses and print JSON verdicts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use verity_verifier::{Verifier, VerifierConfig, VerifyOptions};

#[derive(Parser, Debug)]
#[command(
    name = "verity",
    version,
    about = "Verify email deliverability via SMTP RCPT TO probing"
)]
struct Args {
    /// Addresses to verify.
    #[arg(required = true)]
    emails: Vec<String>,

    /// TOML configuration file.
    #[arg(long, short, env = "VERITY_CONFIG")]
    config: Option<PathBuf>,

    /// Hostname announced in EHLO (overrides the config file).
    #[arg(long)]
    ehlo_hostname: Option<String>,

    /// Return-path for MAIL FROM (overrides the config file).
    #[arg(long)]
    mail_from: Option<String>,

    /// Bypass the result cache read.
    #[arg(long)]
    skip_cache: bool,

    /// Per-address deadline in milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Pretty-print the verdicts.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    verity_common::logging::init();
    let args = Args::parse();

    let config = load_config(&args)?;
    let verifier = Verifier::new(config)?;

    let options = VerifyOptions {
        skip_cache: args.skip_cache,
        deadline: args.deadline_ms.map(Duration::from_millis),
    };

    let verdicts = verifier.verify_batch(&args.emails, options).await?;
    for verdict in &verdicts {
        let line = if args.pretty {
            serde_json::to_string_pretty(verdict)?
        } else {
            serde_json::to_string(verdict)?
        };
        println!("{line}");
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<VerifierConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => read_config(path)?,
        None => {
            let (Some(ehlo), Some(mail_from)) = (&args.ehlo_hostname, &args.mail_from) else {
                anyhow::bail!(
                    "no config file given: --ehlo-hostname and --mail-from are required"
                );
            };
            VerifierConfig::new(ehlo.clone(), mail_from.clone())
        }
    };

    if let Some(ehlo) = &args.ehlo_hostname {
        config.smtp.ehlo_hostname.clone_from(ehlo);
    }
    if let Some(mail_from) = &args.mail_from {
        config.smtp.mail_from.clone_from(mail_from);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> anyhow::Result<VerifierConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}
