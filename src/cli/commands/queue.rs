// Queue management commands
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tabled::Tabled;

use crate::cli::output::{print_list, print_success, OutputFormat};
use crate::cli::{QueueCommands, StoreArgs};
use crate::config::{NexqConfig, StoreConfig};
use crate::core::time::SystemClock;
use crate::storage::{self, Store};
use crate::types::{CreateQueueOptions, QueueInfo};

/// Queue summary for list
#[derive(Debug, Serialize, Tabled)]
pub struct QueueSummary {
    name: String,
    available: u64,
    delayed: u64,
    in_flight: u64,
    paused: bool,
    #[tabled(display_with = "display_option")]
    dead_letter_queue: Option<String>,
}

impl From<QueueInfo> for QueueSummary {
    fn from(info: QueueInfo) -> Self {
        Self {
            name: info.name,
            available: info.number_of_messages,
            delayed: info.number_of_messages_delayed,
            in_flight: info.number_of_messages_not_visible,
            paused: info.paused,
            dead_letter_queue: info.dead_letter_queue_name,
        }
    }
}

/// Display function for Option types in tables
fn display_option<T: std::fmt::Display>(option: &Option<T>) -> String {
    option
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl QueueCommands {
    /// Store selection of the subcommand.
    pub fn store_args(&self) -> &StoreArgs {
        match self {
            QueueCommands::List { store, .. }
            | QueueCommands::Create { store, .. }
            | QueueCommands::Delete { store, .. }
            | QueueCommands::Purge { store, .. }
            | QueueCommands::Pause { store, .. }
            | QueueCommands::Resume { store, .. } => store,
        }
    }
}

/// Open the configured SQL store without starting its sweep.
async fn open_store(config: &NexqConfig) -> Result<Arc<dyn Store>> {
    if matches!(config.store, StoreConfig::Memory { .. }) {
        anyhow::bail!(
            "queue commands need a SQL database; pass --database-url or configure a sqlite or postgres store"
        );
    }
    storage::connect(&config.store, Arc::new(SystemClock))
        .await
        .context("Failed to open store")
}

/// Execute a queue subcommand
pub async fn execute(command: QueueCommands, config: NexqConfig) -> Result<()> {
    let store = open_store(&config).await?;
    let result = run(store.as_ref(), command).await;
    store.shutdown().await.context("Failed to close store")?;
    result
}

async fn run(store: &dyn Store, command: QueueCommands) -> Result<()> {
    match command {
        QueueCommands::List { format, .. } => {
            let format = OutputFormat::parse(&format)?;
            let queues: Vec<QueueSummary> = store
                .get_queue_infos()
                .await?
                .into_iter()
                .map(QueueSummary::from)
                .collect();
            print_list(&queues, format, "No queues found")?;
        }
        QueueCommands::Create {
            name,
            delay_ms,
            visibility_timeout_ms,
            max_receive_count,
            dead_letter_queue,
            upsert,
            ..
        } => {
            let options = CreateQueueOptions {
                delay_ms,
                visibility_timeout_ms,
                max_receive_count,
                dead_letter_queue_name: dead_letter_queue,
                upsert,
                ..Default::default()
            };
            store
                .create_queue(&name, options)
                .await
                .with_context(|| format!("Failed to create queue {}", name))?;
            print_success(&format!("Queue '{}' created", name));
        }
        QueueCommands::Delete { name, .. } => {
            store
                .delete_queue(&name)
                .await
                .with_context(|| format!("Failed to delete queue {}", name))?;
            print_success(&format!("Queue '{}' deleted", name));
        }
        QueueCommands::Purge { name, .. } => {
            store
                .purge_queue(&name)
                .await
                .with_context(|| format!("Failed to purge queue {}", name))?;
            print_success(&format!("Queue '{}' purged", name));
        }
        QueueCommands::Pause { name, .. } => {
            store
                .pause_queue(&name)
                .await
                .with_context(|| format!("Failed to pause queue {}", name))?;
            print_success(&format!("Queue '{}' paused", name));
        }
        QueueCommands::Resume { name, .. } => {
            store
                .resume_queue(&name)
                .await
                .with_context(|| format!("Failed to resume queue {}", name))?;
            print_success(&format!("Queue '{}' resumed", name));
        }
    }
    Ok(())
}
