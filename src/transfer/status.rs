//! Transfer status derivation
//!
//! Pure read path: given the lifecycle types of the sender app and the
//! optional receiver app, derive one externally visible status. The function
//! is total over reachable pairs; anything outside the enumeration is a data
//! invariant violation and fails loudly instead of guessing.

use crate::protocol::AppType;
use serde::{Deserialize, Serialize};

/// Externally visible status of a hub-mediated transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Receiver absent, or both sides mid-flight
    Pending,
    /// Either side uninstalled with its condition satisfied
    Completed,
    /// Either side rejected
    Failed,
    /// Timelocked variant lapsed before completion
    Expired,
}

/// What status derivation needs to know about one side of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct SideView {
    pub app_type: AppType,
    /// Unlock action already taken (secret recorded on the latest state)
    pub unlocked: bool,
    /// Recorded block-height expiry, timelocked variant only
    pub expiry: Option<u64>,
}

impl SideView {
    fn expired_at(&self, block_height: u64) -> bool {
        self.expiry.is_some_and(|expiry| block_height > expiry)
    }
}

/// Derive the transfer status from both sides' lifecycle types.
///
/// Returns the reason string for an invariant violation as `Err`, which the
/// engine wraps into `InconsistentTransferState`.
pub fn derive_transfer_status(
    sender: SideView,
    receiver: Option<SideView>,
    block_height: u64,
) -> Result<TransferStatus, String> {
    // A free-balance app can never be a transfer leg.
    if sender.app_type == AppType::FreeBalance
        || receiver.is_some_and(|r| r.app_type == AppType::FreeBalance)
    {
        return Err("free-balance app appeared as a transfer leg".to_string());
    }

    let sides = [Some(sender), receiver];
    let any = |predicate: fn(&SideView) -> bool| sides.iter().flatten().any(predicate);

    if any(|s| s.app_type == AppType::Rejected) {
        return Ok(TransferStatus::Failed);
    }
    if any(|s| s.app_type == AppType::Uninstalled && s.unlocked) {
        return Ok(TransferStatus::Completed);
    }
    if sides
        .iter()
        .flatten()
        .any(|s| s.expired_at(block_height))
    {
        return Ok(TransferStatus::Expired);
    }
    // an uninstall whose condition was never satisfied, with no lapsed
    // timelock to explain it, is not a reachable state
    if any(|s| s.app_type == AppType::Uninstalled && !s.unlocked) {
        return Err(
            "app uninstalled without a satisfied condition or lapsed expiry".to_string(),
        );
    }

    // remaining combinations are Proposal/Instance on each present side
    Ok(TransferStatus::Pending)
}
