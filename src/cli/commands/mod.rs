// Commands module
/// Queue management commands
pub mod queue;
/// Start command implementation
pub mod start;

use anyhow::Context;

use crate::cli::output::print_error;
use crate::cli::{Cli, Commands, StoreArgs};
use crate::config::{NexqConfig, StoreConfig};

impl Cli {
    /// Store selection of the chosen command.
    pub fn store_args(&self) -> &StoreArgs {
        match &self.command {
            Commands::Start { store } | Commands::Config { store } => store,
            Commands::Queue(command) => command.store_args(),
        }
    }
}

/// Build the effective configuration: file, then command-line overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<NexqConfig> {
    let mut config = match &cli.config {
        Some(path) => NexqConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => NexqConfig::default(),
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    let store = cli.store_args();
    if let Some(database_url) = &store.database_url {
        config.store = StoreConfig::from_database_url(database_url)?;
    }
    if let Some(poll_interval_ms) = store.poll_interval_ms {
        config.store.set_poll_interval_ms(poll_interval_ms);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Execute a CLI command
pub async fn execute_command(command: Commands, config: NexqConfig) -> anyhow::Result<()> {
    let result = match command {
        Commands::Start { .. } => start::execute(config).await,
        Commands::Queue(command) => queue::execute(command, config).await,
        Commands::Config { .. } => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    };

    if let Err(e) = &result {
        print_error(&format!("{:#}", e));
    }
    result
}
