// CLI module for nexq
/// Command execution handlers
pub mod commands;
/// Output formatting utilities
pub mod output;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::LogFormat;

/// Command-line interface for nexq
#[derive(Parser)]
#[command(name = "nexq")]
#[command(author, version, about = "Priority message queue engine with topics, long polling and dead lettering", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, env = "NEXQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level or tracing filter directive
    #[arg(long, global = true, env = "NEXQ_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, global = true, env = "NEXQ_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Store selection shared by commands that open a store
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// Database URL (sqlite:... or postgres://...); overrides the configured store
    #[arg(long, env = "NEXQ_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Sweep interval in milliseconds
    #[arg(long, env = "NEXQ_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the store until SIGINT or SIGTERM
    Start {
        /// Store selection
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Queue management commands
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Show current configuration
    Config {
        /// Store selection
        #[command(flatten)]
        store: StoreArgs,
    },
}

/// Queue management subcommands
#[derive(Subcommand)]
pub enum QueueCommands {
    /// List all queues
    List {
        /// Store selection
        #[command(flatten)]
        store: StoreArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Create a new queue
    Create {
        /// Queue name
        name: String,

        /// Store selection
        #[command(flatten)]
        store: StoreArgs,

        /// Default delivery delay in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Default visibility timeout in milliseconds
        #[arg(long)]
        visibility_timeout_ms: Option<u64>,

        /// Maximum receives before dead lettering
        #[arg(long)]
        max_receive_count: Option<u32>,

        /// Dead letter queue name
        #[arg(long)]
        dead_letter_queue: Option<String>,

        /// Update the queue when it already exists
        #[arg(long)]
        upsert: bool,
    },

    /// Delete a queue
    Delete {
        /// Queue name
        name: String,

        /// Store selection
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Purge all messages from a queue
    Purge {
        /// Queue name
        name: String,

        /// Store selection
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Stop delivering messages from a queue
    Pause {
        /// Queue name
        name: String,

        /// Store selection
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Resume delivering messages from a queue
    Resume {
        /// Queue name
        name: String,

        /// Store selection
        #[command(flatten)]
        store: StoreArgs,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
