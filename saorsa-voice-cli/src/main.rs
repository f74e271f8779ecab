//! Saorsa Voice CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use saorsa_voice_core::prelude::*;
use scenario::Scenario;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod scenario;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Four-word identity (e.g., "alpha-bravo-charlie-delta")
    #[arg(short, long, env = "SAORSA_IDENTITY")]
    identity: Option<String>,

    /// JSON call configuration file
    #[arg(short, long, env = "SAORSA_VOICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a call between two in-process participants
    Demo {
        /// What the callee does
        #[arg(long, value_enum, default_value = "accept")]
        scenario: Scenario,

        /// Callee identity (random when omitted)
        #[arg(long)]
        peer: Option<String>,

        /// Connect timeout in seconds, overriding the configuration
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print the signaling topic shared with a peer
    Topic {
        /// Peer identity
        peer: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("saorsa_voice=info,saorsa_voice_core=info")),
        )
        .init();

    let cli = Cli::parse();

    let identity = cli.identity.unwrap_or_else(generate_random_identity);
    let timeout = match &cli.command {
        Commands::Demo { timeout, .. } => *timeout,
        _ => None,
    };
    let config = load_config(cli.config.as_ref(), timeout)?;

    println!("🔗 Using identity: {}", identity);

    match cli.command {
        Commands::Demo { scenario, peer, .. } => {
            let peer = peer.unwrap_or_else(generate_random_identity);
            handle_demo(scenario, &identity, &peer, config).await?;
        }
        Commands::Topic { peer } => {
            handle_topic(&identity, &peer)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Configuration file (or defaults) with command-line overrides applied
fn load_config(path: Option<&PathBuf>, timeout_secs: Option<u64>) -> Result<CallConfig> {
    let mut config = match path {
        Some(path) => CallConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CallConfig::default(),
    };
    if let Some(secs) = timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    config.validate().context("invalid call configuration")?;
    Ok(config)
}

async fn handle_demo(scenario: Scenario, identity: &str, peer: &str, config: CallConfig) -> Result<()> {
    println!("📞 {} calls {} ({:?})", identity, peer, scenario);
    let report = scenario::run(scenario, identity, peer, config).await?;
    report.print();
    if report.connected {
        println!("✅ Call connected");
    } else {
        println!("❌ Call did not connect");
    }
    Ok(())
}

fn handle_topic(identity: &str, peer: &str) -> Result<()> {
    let local = PeerIdentityString::from_string_repr(identity)?;
    let remote = PeerIdentityString::from_string_repr(peer)?;
    if local == remote {
        anyhow::bail!("cannot share a topic with yourself");
    }
    println!("{}", Topic::between(&local, &remote));
    Ok(())
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let words: Vec<&str> = (0..4).map(|_| WORDS[rng.gen_range(0..WORDS.len())]).collect();
    words.join("-")
}
