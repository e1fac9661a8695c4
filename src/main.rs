/*!
 * Tether CLI
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tether::{logging, LogLevel, Tether, TetherConfig};

#[derive(Parser)]
#[command(name = "tether")]
#[command(
    version,
    about = "Resilience and coordination layer: circuit breakers, locks, discovery and resources",
    long_about = None
)]
struct Cli {
    /// Override the configured log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Debug logging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration file helpers
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Start every component and print a JSON status snapshot
    Status {
        /// Configuration file; defaults apply when omitted
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate a configuration file
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print the default configuration as TOML
    Default {
        /// Write to this file instead of stdout
        #[arg(short = 'o', long = "output", value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(ConfigCommand::Check { file }) => {
            let config = TetherConfig::from_file(&file)
                .with_context(|| format!("failed to load {}", file.display()))?;
            config
                .validate()
                .with_context(|| format!("{} is not a valid configuration", file.display()))?;
            println!("{}: ok", file.display());
        }

        Commands::Config(ConfigCommand::Default { output }) => {
            let config = TetherConfig::default();
            match output {
                Some(path) => {
                    config
                        .to_file(&path)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => print!("{}", config.to_toml()?),
            }
        }

        Commands::Status { config } => {
            let mut config = match config {
                Some(path) => TetherConfig::from_file(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => TetherConfig::default(),
            };
            if let Some(level) = cli.log_level {
                config.logging.level = level.into();
            }
            config.logging.verbose |= cli.verbose;

            if let Err(e) = logging::init_logging(&config.logging) {
                eprintln!("Warning: Failed to initialize logging: {}", e);
            }

            let tether = Tether::start(config).await.context("failed to start tether")?;
            let status = tether.status().await;
            tether.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
