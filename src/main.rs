//! PicoClaw terminal client.
//!
//! ```bash
//! # Interactive mode
//! picoclaw
//!
//! # One message, then exit
//! picoclaw -m "summarise my last conversation"
//!
//! # Account id for a principal
//! picoclaw account-id rrkah-fqaaa-aaaaa-aaaaq-cai
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use picoclaw::config::LogFormat;
use picoclaw::identity::DelegationStore;
use picoclaw::logging::{self, LogTarget};
use picoclaw::principal::Principal;
use picoclaw::settings::Settings;
use picoclaw::{AppContext, Config, repl};

#[derive(Parser, Debug)]
#[command(name = "picoclaw", version, about = "Terminal client for the PicoClaw agent")]
struct Cli {
    /// Path to a TOML config file (defaults to ~/.picoclaw/config.toml)
    #[arg(long, global = true, env = "PICOCLAW_CONFIG")]
    config: Option<PathBuf>,

    /// Send a single message and exit
    #[arg(short = 'm', long)]
    message: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the interactive REPL (default)
    Repl,

    /// Print the default ledger account id of a principal
    AccountId {
        /// Principal in text form
        principal: String,
    },

    /// Probe configuration, backend, wallet bridge and stored identity
    Doctor {
        /// Exit non-zero when any check fails
        #[arg(long)]
        strict: bool,
    },

    /// Forget the stored delegated identity
    Logout,

    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    load_config_from(cli, cli.config.as_deref())
}

fn load_config_from(cli: &Cli, path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    if cli.log_json {
        config.logging.format = LogFormat::Json;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::AccountId { principal }) => {
            let principal = Principal::from_text(principal)
                .with_context(|| format!("'{principal}' is not a valid principal"))?;
            println!("{}", principal.account_id());
            Ok(())
        }
        Some(Command::Doctor { strict }) => {
            picoclaw::doctor::run_doctor_command(cli.config.as_deref(), *strict).await
        }
        Some(Command::Logout) => {
            let config = load_config(&cli)?;
            logging::init(&config.logging, LogTarget::Stderr)?;
            let store = DelegationStore::new(&config.identity.session_path);
            store.clear().await?;
            println!("Removed {}", store.path().display());
            Ok(())
        }
        Some(Command::Config { command }) => run_config_command(&cli, command),
        Some(Command::Repl) | None => {
            let config = load_config(&cli)?;
            picoclaw::bootstrap::ensure_picoclaw_home()
                .context("failed to create the picoclaw home directory")?;

            match cli.message.as_deref() {
                Some(message) => {
                    logging::init(&config.logging, LogTarget::Stderr)?;
                    let (ctx, events) = AppContext::new(config);
                    repl::run_single(ctx, events, message).await?;
                }
                None => {
                    logging::init(&config.logging, LogTarget::File)?;
                    tracing::info!(backend = %config.backend.url, "Starting REPL");
                    let (ctx, events) = AppContext::new(config);
                    repl::run(ctx, events).await?;
                }
            }
            Ok(())
        }
    }
}

fn run_config_command(cli: &Cli, command: &ConfigCommand) -> anyhow::Result<()> {
    // `init` may target a file that does not exist yet.
    let source = match command {
        ConfigCommand::Init { .. } => cli.config.as_deref().filter(|path| path.exists()),
        ConfigCommand::Show => cli.config.as_deref(),
    };
    let settings = load_config_from(cli, source)?.to_settings();

    match command {
        ConfigCommand::Init { force } => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(Settings::default_toml_path);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            settings.save_toml(&path).map_err(anyhow::Error::msg)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}
