//! Request/response endpoints
//!
//! JSON handlers for the transfer engine's client-facing operations and the
//! lock service wire contract. Transport (messaging subject routing, auth)
//! is a collaborator's concern; these handlers take parsed JSON params and
//! return JSON values.

use crate::lock::wire::{handle_lock_request, LockRequest};
use crate::lock::LockService;
use crate::transfer::{ConditionalTransferEngine, TransferClaim, TransferError};
use crate::types::Bytes32;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// A missing correlation key or malformed claim is the client's error, not
/// a server fault.
fn invalid_params(message: &str) -> TransferError {
    TransferError::InvalidClaim {
        payment_id: String::new(),
        reason: message.to_string(),
    }
}

/// Transfer endpoint handler.
#[derive(Clone)]
pub struct TransferRpc {
    engine: Arc<ConditionalTransferEngine>,
}

impl TransferRpc {
    pub fn new(engine: Arc<ConditionalTransferEngine>) -> Self {
        Self { engine }
    }

    fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, TransferError> {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid_params(&format!("missing '{}' parameter", key)))
    }

    fn parse_claim(params: &Value) -> Result<TransferClaim, TransferError> {
        if let Some(preimage) = params.get("preimage").and_then(|v| v.as_str()) {
            return Ok(TransferClaim::Preimage(Bytes32(preimage.to_string())));
        }
        if let (Some(data), Some(signature)) = (
            params.get("data").and_then(|v| v.as_str()),
            params.get("signature").and_then(|v| v.as_str()),
        ) {
            return Ok(TransferClaim::SignedSecret {
                data: Bytes32(data.to_string()),
                signature: signature.to_string(),
            });
        }
        Err(invalid_params(
            "claim requires 'preimage' or 'data'+'signature'",
        ))
    }

    /// Fetch a transfer's derived status by payment id.
    ///
    /// Params: {"payment_id": "..."}
    pub async fn get_transfer(&self, params: &Value) -> Result<Value, TransferError> {
        debug!("RPC: gettransfer");
        let payment_id = Self::require_str(params, "payment_id")?;
        let view = self.engine.get_transfer(payment_id).await?;
        Ok(serde_json::to_value(view).map_err(|e| anyhow::anyhow!(e))?)
    }

    /// Resolve a transfer toward its receiver.
    ///
    /// Params: {"payment_id": "...", "user": "...", "preimage": "..."} or
    /// {"payment_id": "...", "user": "...", "data": "...", "signature": "..."}
    pub async fn resolve_transfer(&self, params: &Value) -> Result<Value, TransferError> {
        debug!("RPC: resolvetransfer");
        let payment_id = Self::require_str(params, "payment_id")?;
        let user = Self::require_str(params, "user")?;
        let claim = Self::parse_claim(params)?;
        let resolution = self.engine.resolve(payment_id, claim, user).await?;
        Ok(serde_json::to_value(resolution).map_err(|e| anyhow::anyhow!(e))?)
    }

    /// Transfers waiting for a recipient to claim.
    ///
    /// Params: {"user": "..."}
    pub async fn get_pending_transfers(&self, params: &Value) -> Result<Value, TransferError> {
        debug!("RPC: getpendingtransfers");
        let user = Self::require_str(params, "user")?;
        let pending = self.engine.get_pending_for_recipient(user).await?;
        Ok(json!({
            "payment_ids": pending.iter().map(|r| r.payment_id.clone()).collect::<Vec<_>>(),
        }))
    }

    /// Client reconnect sweep.
    ///
    /// Params: {"user": "..."}
    pub async fn client_check_in(&self, params: &Value) -> Result<Value, TransferError> {
        debug!("RPC: clientcheckin");
        let user = Self::require_str(params, "user")?;
        let report = self.engine.check_in(user).await?;
        Ok(serde_json::to_value(report).map_err(|e| anyhow::anyhow!(e))?)
    }
}

/// Lock endpoint handler over the wire contract.
#[derive(Clone)]
pub struct LockRpc {
    service: Arc<LockService>,
}

impl LockRpc {
    pub fn new(service: Arc<LockService>) -> Self {
        Self { service }
    }

    /// Handle a wire-format lock request.
    pub async fn handle(&self, params: &Value) -> Value {
        let request: LockRequest = match serde_json::from_value(params.clone()) {
            Ok(request) => request,
            Err(e) => {
                return json!({
                    "result": "error",
                    "kind": "INVALID_REQUEST",
                    "message": e.to_string(),
                });
            }
        };
        let response = handle_lock_request(&self.service, request).await;
        serde_json::to_value(response).unwrap_or_else(|e| {
            json!({
                "result": "error",
                "kind": "INTERNAL",
                "message": e.to_string(),
            })
        })
    }
}
