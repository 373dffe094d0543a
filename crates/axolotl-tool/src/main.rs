use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use axolotl_protocol::ProtocolAddress;
use tracing::info;
use zeroize::Zeroizing;

mod commands;
mod config;
mod simulate;

use config::ToolConfig;

/// Environment variable read when `--password` is not given.
const PASSWORD_ENV: &str = "AXOLOTL_STORE_PASSWORD";

#[derive(Parser)]
#[command(name = "axolotl-tool", about = "Axolotl session store operator tool")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Sealed store file, overrides config
    #[arg(long)]
    store: Option<PathBuf>,

    /// Store password (falls back to AXOLOTL_STORE_PASSWORD)
    #[arg(long)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new identity with a signed pre-key and one-time pre-keys
    Init {
        /// Number of one-time pre-keys to generate
        #[arg(long, default_value_t = axolotl_crypto::prekey::INITIAL_PREKEY_COUNT)]
        prekeys: u32,

        /// Device id, overrides config
        #[arg(long)]
        device_id: Option<u32>,

        /// Overwrite an existing store
        #[arg(long)]
        force: bool,
    },

    /// Print the public pre-key bundle as JSON
    Bundle {
        /// Top up one-time pre-keys first if the supply is low
        #[arg(long)]
        replenish: bool,

        /// Device id, overrides config
        #[arg(long)]
        device_id: Option<u32>,
    },

    /// List stored sessions
    Inspect,

    /// Start a session from a peer's bundle (JSON as printed by `bundle`)
    Establish {
        #[command(flatten)]
        peer: PeerArgs,

        /// Bundle file
        bundle: PathBuf,
    },

    /// Encrypt a message to a peer and write the framed envelope to a file
    Encrypt {
        #[command(flatten)]
        peer: PeerArgs,

        /// Message text
        #[arg(long)]
        message: String,

        /// Where to write the envelope
        #[arg(long)]
        out: PathBuf,
    },

    /// Decrypt an envelope file from a peer and print the plaintext
    Decrypt {
        #[command(flatten)]
        peer: PeerArgs,

        /// Envelope file
        input: PathBuf,
    },

    /// Run a two-party conversation in memory
    Simulate {
        #[arg(long, default_value_t = 3)]
        rounds: u32,

        #[arg(long, default_value_t = 5)]
        messages: u32,

        /// Deliver each batch in random order
        #[arg(long)]
        shuffle: bool,

        /// Re-deliver one message per batch and expect it to be rejected
        #[arg(long)]
        replay: bool,

        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(clap::Args)]
struct PeerArgs {
    /// Peer name
    #[arg(long)]
    peer: String,

    /// Peer device id
    #[arg(long, default_value_t = 1)]
    peer_device: u32,
}

impl PeerArgs {
    fn address(&self) -> ProtocolAddress {
        ProtocolAddress::new(self.peer.as_str(), self.peer_device)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ToolConfig::default()
    };

    // CLI overrides
    if let Some(store) = args.store {
        config.store_path = store;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    config.session.validate()?;

    match args.command {
        Command::Init {
            prekeys,
            device_id,
            force,
        } => {
            let password = password(args.password)?;
            let device_id = device_id.unwrap_or(config.device_id);
            commands::init(&config.store_path, &password, device_id, prekeys, force)
        }
        Command::Bundle {
            replenish,
            device_id,
        } => {
            let password = password(args.password)?;
            let device_id = device_id.unwrap_or(config.device_id);
            let bundle = commands::bundle(&config.store_path, &password, device_id, replenish)?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            Ok(())
        }
        Command::Inspect => {
            let password = password(args.password)?;
            for line in commands::inspect(&config.store_path, &password)? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Establish { peer, bundle } => {
            let password = password(args.password)?;
            commands::establish(&config.store_path, &password, &peer.address(), &bundle, &config.session)
        }
        Command::Encrypt { peer, message, out } => {
            let password = password(args.password)?;
            let framed = commands::encrypt(
                &config.store_path,
                &password,
                &peer.address(),
                message.as_bytes(),
                &config.session,
            )?;
            fs::write(&out, &framed).with_context(|| format!("failed to write {}", out.display()))?;
            info!(path = %out.display(), bytes = framed.len(), "wrote envelope");
            Ok(())
        }
        Command::Decrypt { peer, input } => {
            let password = password(args.password)?;
            let framed = fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            let plaintext = Zeroizing::new(commands::decrypt(
                &config.store_path,
                &password,
                &peer.address(),
                &framed,
                &config.session,
            )?);
            println!("{}", String::from_utf8_lossy(&plaintext));
            Ok(())
        }
        Command::Simulate {
            rounds,
            messages,
            shuffle,
            replay,
            seed,
        } => {
            let options = simulate::SimulationOptions {
                rounds,
                messages_per_round: messages,
                shuffle,
                replay,
                seed,
            };
            let report = simulate::run(&options, &config.session)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                bail!("simulation reported {} failures", report.failures.len());
            }
            info!("simulation clean");
            Ok(())
        }
    }
}

fn password(flag: Option<String>) -> Result<Zeroizing<String>> {
    match flag.or_else(|| std::env::var(PASSWORD_ENV).ok()) {
        Some(password) if !password.is_empty() => Ok(Zeroizing::new(password)),
        _ => bail!("no store password: pass --password or set {PASSWORD_ENV}"),
    }
}
