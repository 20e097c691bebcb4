//! Lock service wire contract
//!
//! Request/response messages for remote callers reaching the lock service
//! over the node's messaging transport. Duplicate releases for an
//! already-expired lock are acknowledged, not errored.

use crate::lock::{LockError, LockService};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Inbound lock request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LockRequest {
    Acquire { lock_name: String, ttl_ms: Option<u64> },
    Release { lock_name: String, token: String },
}

/// Outbound lock response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LockResponse {
    Acquired { token: String },
    Released,
    Error { kind: String, message: String },
}

impl LockResponse {
    fn from_error(err: &LockError) -> Self {
        let kind = match err {
            LockError::QueueFull(_) => "LOCK_QUEUE_FULL",
            LockError::Timeout { .. } => "LOCK_TIMEOUT",
            LockError::Store(_) => "LOCK_STORE_FAILURE",
        };
        Self::Error {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

/// Handle one wire request against the lock service.
pub async fn handle_lock_request(service: &LockService, request: LockRequest) -> LockResponse {
    match request {
        LockRequest::Acquire { lock_name, ttl_ms } => {
            debug!("Wire: acquire lock {}", lock_name);
            match service
                .acquire(&lock_name, ttl_ms.map(Duration::from_millis))
                .await
            {
                Ok(token) => LockResponse::Acquired { token },
                Err(e) => LockResponse::from_error(&e),
            }
        }
        LockRequest::Release { lock_name, token } => {
            debug!("Wire: release lock {}", lock_name);
            match service.release(&lock_name, &token).await {
                Ok(()) => LockResponse::Released,
                Err(e) => LockResponse::from_error(&e),
            }
        }
    }
}
