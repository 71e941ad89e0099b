//! NATS message handlers

pub mod import;
pub mod ping;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use sqlx::PgPool;
use tokio::select;
use tracing::{error, info};

use crate::config::{PipelineConfig, StorageConfig};
use crate::services::import_processor::ImportProcessor;

/// Start all message handlers
pub async fn start_handlers(
    client: Client,
    pool: PgPool,
    storage: &StorageConfig,
    pipeline_config: PipelineConfig,
) -> Result<()> {
    info!("Starting message handlers...");

    let processor = Arc::new(ImportProcessor::new(client.clone(), pool, storage, pipeline_config).await?);

    let ping_sub = client.subscribe("ledger.ping").await?;
    let import_process_sub = client.subscribe("ledger.import.process").await?;
    let import_cancel_sub = client.subscribe("ledger.import.cancel").await?;

    info!("Subscribed to NATS subjects");

    let ping_handle = tokio::spawn(ping::handle_ping(client.clone(), ping_sub));
    let import_process_handle = tokio::spawn(import::handle_process(
        client.clone(),
        import_process_sub,
        Arc::clone(&processor),
    ));
    let import_cancel_handle = tokio::spawn(import::handle_cancel(
        client.clone(),
        import_cancel_sub,
        Arc::clone(&processor),
    ));
    let chunk_worker_handle = tokio::spawn(Arc::clone(&processor).start_processing());

    info!("All handlers started, waiting for messages...");

    select! {
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = import_process_handle => {
            error!("Import process handler finished: {:?}", result);
        }
        result = import_cancel_handle => {
            error!("Import cancel handler finished: {:?}", result);
        }
        result = chunk_worker_handle => {
            error!("Import chunk worker finished: {:?}", result);
        }
    }

    Ok(())
}
