use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across binaries
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the service (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Default filter directive derived from the verbosity flags.
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging; `RUST_LOG` wins over the CLI flags when set.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));

        // a subscriber may already be installed by an embedding test harness
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("Strata Configuration:");
            println!("=====================");
            println!("Context: {}", config.service.context);
            println!("Listen: {}:{}", config.service.bind, config.service.port);
            println!("Max frame bytes: {}", config.service.max_frame_bytes);
            println!(
                "Catalog: {}@{}:{}/{} (schema {})",
                config.database.user,
                config.database.host,
                config.database.port,
                config.database.name,
                config.database.schema
            );
            println!("Connect timeout: {:?}", config.database.connect_timeout);
            println!("Schedule timezone: {}", config.schedule.timezone);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate().map_err(anyhow::Error::msg)?;
        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle common CLI commands that don't require starting services
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
