//! NATS message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Generic request wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Caller identity, set by the gateway
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub payload: T,
}

impl<T> Request<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: None,
            payload,
        }
    }
}

/// Generic success response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(request_id: Uuid, payload: T) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    /// HTTP-equivalent status for gateways that proxy the reply
    pub status: u16,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(request_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let status = status_for_code(&code);
        Self {
            id: request_id,
            timestamp: Utc::now(),
            error: ErrorDetail {
                code,
                status,
                message: message.into(),
            },
        }
    }
}

fn status_for_code(code: &str) -> u16 {
    match code {
        "INVALID_REQUEST" => 400,
        "FORBIDDEN" => 403,
        "NOT_FOUND" => 404,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_maps_codes_to_status() {
        assert_eq!(ErrorResponse::new(Uuid::nil(), "NOT_FOUND", "x").error.status, 404);
        assert_eq!(ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", "x").error.status, 400);
        assert_eq!(ErrorResponse::new(Uuid::nil(), "PROCESSING_ERROR", "x").error.status, 500);
    }

    #[test]
    fn test_request_deserializes_without_user_id() {
        let json = r#"{"id":"00000000-0000-0000-0000-000000000000","timestamp":"2024-03-01T00:00:00Z","payload":{"jobId":"00000000-0000-0000-0000-000000000001"}}"#;
        let request: Request<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert!(request.user_id.is_none());
        assert_eq!(request.payload["jobId"], "00000000-0000-0000-0000-000000000001");
    }
}
