//! Import invocation and cancellation handlers

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::services::import_processor::{cancel_import, describe, CancelOutcome, ImportProcessor};
use crate::services::ledger::Invocation;
use crate::types::{
    CancelImportRequest, CancelImportResponse, ChunkTask, ErrorResponse, InvocationReply,
    ProcessImportRequest, Request, SuccessResponse,
};

/// Serialize the reply body for an invocation outcome
fn invocation_reply(request_id: Uuid, outcome: &Invocation) -> Result<Vec<u8>> {
    let counts = match outcome {
        Invocation::NotFound => {
            let error = ErrorResponse::new(request_id, "NOT_FOUND", "Import job not found");
            return Ok(serde_json::to_vec(&error)?);
        }
        Invocation::Failed { error } => {
            let error = ErrorResponse::new(request_id, "PROCESSING_ERROR", error.clone());
            return Ok(serde_json::to_vec(&error)?);
        }
        Invocation::Continued { counts }
        | Invocation::Completed { counts }
        | Invocation::Retrying { counts, .. } => counts.clone(),
        Invocation::Skipped { .. } | Invocation::Cancelled | Invocation::Superseded => {
            Default::default()
        }
    };

    let reply = InvocationReply {
        success: true,
        message: describe(outcome),
        counts,
    };
    Ok(serde_json::to_vec(&SuccessResponse::new(request_id, reply))?)
}

/// Handle ledger.import.process
///
/// Each request runs in its own task; an invocation can take the whole
/// chunk budget and must not hold up the subscription.
pub async fn handle_process(
    client: Client,
    mut subscriber: Subscriber,
    processor: Arc<ImportProcessor>,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<ProcessImportRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import process request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let client = client.clone();
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            let job_id = request.payload.job_id;
            info!("Import invocation requested for job {}", job_id);

            let body = match processor.invoke(ChunkTask::new(job_id)).await {
                Ok(outcome) => invocation_reply(request.id, &outcome),
                Err(e) => {
                    error!("Import invocation for job {} errored: {:#}", job_id, e);
                    let error = ErrorResponse::new(request.id, "PROCESSING_ERROR", format!("{:#}", e));
                    serde_json::to_vec(&error).map_err(Into::into)
                }
            };

            match body {
                Ok(body) => {
                    if let Err(e) = client.publish(reply, body.into()).await {
                        warn!("Failed to reply to import request for job {}: {}", job_id, e);
                    }
                }
                Err(e) => error!("Failed to serialize import reply for job {}: {}", job_id, e),
            }
        });
    }

    Ok(())
}

/// Handle ledger.import.cancel
pub async fn handle_cancel(
    client: Client,
    mut subscriber: Subscriber,
    processor: Arc<ImportProcessor>,
) -> Result<()> {
    let jobs = processor.jobs();
    let pipeline = processor.pipeline();

    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<CancelImportRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import cancel request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let job_id = request.payload.job_id;
        let outcome = cancel_import(jobs.as_ref(), pipeline.cancellation(), job_id, request.user_id).await;

        let body = match outcome {
            Ok(CancelOutcome::NotFound) => {
                serde_json::to_vec(&ErrorResponse::new(request.id, "NOT_FOUND", "Import job not found"))?
            }
            Ok(CancelOutcome::Forbidden) => serde_json::to_vec(&ErrorResponse::new(
                request.id,
                "FORBIDDEN",
                "Import job belongs to another user",
            ))?,
            Ok(CancelOutcome::Cancelled) => serde_json::to_vec(&SuccessResponse::new(
                request.id,
                CancelImportResponse {
                    job_id,
                    cancelled: true,
                    message: "Import cancelled".to_string(),
                },
            ))?,
            Ok(CancelOutcome::AlreadyFinished(status)) => serde_json::to_vec(&SuccessResponse::new(
                request.id,
                CancelImportResponse {
                    job_id,
                    cancelled: false,
                    message: format!("Import already {}", status),
                },
            ))?,
            Err(e) => {
                error!("Failed to cancel import job {}: {}", job_id, e);
                serde_json::to_vec(&ErrorResponse::new(request.id, "DATABASE_ERROR", e.to_string()))?
            }
        };
        let _ = client.publish(reply, body.into()).await;
    }

    Ok(())
}
