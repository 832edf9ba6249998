//! CLI commands for uagents using clap.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{get_settings_path, load_settings_or_default};
use crate::identity::Identity;
use crate::protocol::{unix_now, Envelope, ENVELOPE_VERSION};

/// uagents - signed typed messaging between autonomous agents.
#[derive(Parser)]
#[command(name = "uagents")]
#[command(version = "0.1.0")]
#[command(about = "Agent identities, envelopes and protocols", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the address derived from a seed phrase
    Address {
        /// Seed phrase
        #[arg(long, env = "UAGENTS_SEED", hide_env_values = true)]
        seed: String,

        /// Key index under the seed
        #[arg(long, default_value_t = 0)]
        index: u32,
    },

    /// Check an envelope file: signature, expiry and payload
    Verify {
        /// Path to the envelope JSON
        path: PathBuf,
    },

    /// Show the settings in effect
    Config,
}

impl Commands {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Address { seed, index } => cmd_address(seed, *index),
            Command::Verify { path } => cmd_verify(path),
            Command::Config => cmd_config(),
        }
    }
}

fn cmd_address(seed: &str, index: u32) -> Result<()> {
    let identity = Identity::from_seed(seed, index)?;
    println!("{}", identity.address());
    Ok(())
}

fn cmd_verify(path: &Path) -> Result<()> {
    let report = EnvelopeReport::from_file(path)?;
    print!("{}", report);
    if !report.is_acceptable() {
        anyhow::bail!("envelope {} would be rejected", path.display());
    }
    Ok(())
}

fn cmd_config() -> Result<()> {
    let path = get_settings_path()?;
    let settings = load_settings_or_default();
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

/// What an inbound endpoint would make of an envelope.
#[derive(Debug)]
struct EnvelopeReport {
    envelope: Envelope,
    signed: bool,
    signature_valid: bool,
    expired: bool,
    payload: std::result::Result<Option<String>, String>,
}

impl EnvelopeReport {
    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let envelope: Envelope = serde_json::from_str(&content)
            .with_context(|| format!("{} is not an envelope", path.display()))?;
        Ok(Self::new(envelope, unix_now()))
    }

    fn new(envelope: Envelope, now: u64) -> Self {
        Self {
            signed: envelope.signature.is_some(),
            signature_valid: envelope.verify(),
            expired: envelope.is_expired(now),
            payload: envelope.decode_payload().map_err(|e| e.to_string()),
            envelope,
        }
    }

    fn is_acceptable(&self) -> bool {
        self.envelope.version == ENVELOPE_VERSION
            && self.signature_valid
            && !self.expired
            && self.payload.is_ok()
    }
}

impl fmt::Display for EnvelopeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.envelope;
        writeln!(f, "version:   {}", e.version)?;
        writeln!(f, "sender:    {}", e.sender)?;
        writeln!(f, "target:    {}", e.target)?;
        writeln!(f, "session:   {}", e.session)?;
        writeln!(f, "schema:    {}", e.schema_digest)?;
        if let Some(protocol) = &e.protocol_digest {
            writeln!(f, "protocol:  {}", protocol)?;
        }
        let signature = match (self.signed, self.signature_valid) {
            (false, _) => "missing",
            (true, true) => "valid",
            (true, false) => "INVALID",
        };
        writeln!(f, "signature: {}", signature)?;
        match e.expires {
            Some(expires) if self.expired => writeln!(f, "expires:   {} (EXPIRED)", expires)?,
            Some(expires) => writeln!(f, "expires:   {}", expires)?,
            None => writeln!(f, "expires:   never")?,
        }
        match &self.payload {
            Ok(Some(json)) => writeln!(f, "payload:   {}", json),
            Ok(None) => writeln!(f, "payload:   (empty)"),
            Err(err) => writeln!(f, "payload:   undecodable ({})", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeBuilder;

    fn signed_envelope(sender: &Identity) -> Envelope {
        EnvelopeBuilder::from(sender.address())
            .to(Identity::generate().address())
            .schema_digest("model:abc")
            .payload_json(r#"{"text":"hello"}"#)
            .ttl(60)
            .sign(sender)
            .unwrap()
    }

    #[test]
    fn test_parse_address_command() {
        let cli = Commands::try_parse_from(["uagents", "address", "--seed", "alice", "--index", "2"])
            .unwrap();
        match cli.command {
            Command::Address { seed, index } => {
                assert_eq!(seed, "alice");
                assert_eq!(index, 2);
            }
            _ => panic!("expected address command"),
        }
    }

    #[test]
    fn test_parse_verify_command() {
        let cli = Commands::try_parse_from(["uagents", "verify", "msg.json"]).unwrap();
        assert!(matches!(cli.command, Command::Verify { path } if path == PathBuf::from("msg.json")));
    }

    #[tokio::test]
    async fn test_address_command_runs() {
        let cli = Commands::try_parse_from(["uagents", "address", "--seed", "cli seed"]).unwrap();
        cli.run().await.unwrap();
    }

    #[test]
    fn test_report_for_signed_envelope() {
        let sender = Identity::from_seed("cli sender", 0).unwrap();
        let report = EnvelopeReport::new(signed_envelope(&sender), unix_now());

        assert!(report.signature_valid);
        assert!(!report.expired);
        assert!(report.is_acceptable());

        let text = report.to_string();
        assert!(text.contains("signature: valid"));
        assert!(text.contains(r#"payload:   {"text":"hello"}"#));
    }

    #[test]
    fn test_report_flags_tampering_and_expiry() {
        let sender = Identity::generate();
        let mut envelope = signed_envelope(&sender);
        envelope.set_payload_json(r#"{"text":"goodbye"}"#);

        let report = EnvelopeReport::new(envelope.clone(), unix_now() + 3600);
        assert!(!report.signature_valid);
        assert!(report.expired);
        assert!(!report.is_acceptable());
        assert!(report.to_string().contains("INVALID"));
        assert!(report.to_string().contains("EXPIRED"));

        envelope.signature = None;
        let report = EnvelopeReport::new(envelope, unix_now());
        assert!(report.to_string().contains("signature: missing"));
    }

    #[test]
    fn test_verify_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let sender = Identity::generate();
        std::fs::write(&good, serde_json::to_string(&signed_envelope(&sender)).unwrap()).unwrap();
        assert!(cmd_verify(&good).is_ok());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{\"not\": \"an envelope\"}").unwrap();
        assert!(cmd_verify(&bad).is_err());
        assert!(cmd_verify(&dir.path().join("missing.json")).is_err());
    }
}
