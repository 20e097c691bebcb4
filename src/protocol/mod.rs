//! Protocol client seam
//!
//! The state-channel protocol engine (install/update/uninstall handshakes,
//! signed commitments, free-balance bookkeeping) is an external collaborator.
//! This module specifies the interface the hub coordination core drives it
//! through, plus the application-instance data model the engines consume
//! read-only.

use crate::types::{
    Amount, AppIdentityHash, AssetId, Bytes32, MultisigAddress, PaymentId, UserIdentifier,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle type of an application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppType {
    /// Proposed, not yet counter-signed
    Proposal,
    /// Installed and live
    Instance,
    /// The channel's free-balance app (never a transfer app)
    FreeBalance,
    /// Uninstalled after running to completion
    Uninstalled,
    /// Proposal rejected by either party
    Rejected,
}

/// One leg of a transfer app's locked coin-transfer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinTransfer {
    pub to: UserIdentifier,
    pub amount: Amount,
}

/// Locked state of a conditional transfer application.
///
/// `coin_transfers[0]` is the funding party (full amount while locked),
/// `coin_transfers[1]` the receiving party (zero until the condition is
/// satisfied). The protocol engine swaps the amounts when the unlock action
/// is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub payment_id: PaymentId,
    pub coin_transfers: [CoinTransfer; 2],
    /// Hash the unlock secret must satisfy
    pub lock_hash: Bytes32,
    /// Revealed secret; zero until the unlock action has been taken
    pub preimage: Bytes32,
    /// Block height after which the lock lapses (hash-lock variant only)
    pub expiry: Option<u64>,
    /// Expected signer of the detached-signature variant
    pub signer: Option<UserIdentifier>,
}

impl TransferState {
    /// Whether the unlock action has already been taken on this app.
    pub fn unlocked(&self) -> bool {
        !self.preimage.is_zero()
    }
}

/// Application instance record, owned by the protocol engine and its
/// repository; the transfer engine only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInstance {
    pub identity_hash: AppIdentityHash,
    pub app_type: AppType,
    pub latest_state: TransferState,
    /// Opaque application metadata (recipient routing info, client blobs)
    #[serde(default)]
    pub meta: Value,
    pub initiator_deposit_asset_id: AssetId,
    pub multisig_address: MultisigAddress,
}

impl AppInstance {
    /// The party funds flow away from while the transfer is locked.
    pub fn funding_party(&self) -> &UserIdentifier {
        &self.latest_state.coin_transfers[0].to
    }

    /// The party funds flow toward once the condition is satisfied.
    pub fn receiving_party(&self) -> &UserIdentifier {
        &self.latest_state.coin_transfers[1].to
    }

    /// Locked amount carried by this app.
    pub fn locked_amount(&self) -> Amount {
        self.latest_state.coin_transfers[0]
            .amount
            .max(self.latest_state.coin_transfers[1].amount)
    }
}

/// Action submitted against a live transfer app to reveal its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockAction {
    pub preimage: Bytes32,
    /// Detached signature, hex, for the signed-secret variant
    pub signature: Option<String>,
}

/// Request to install a new transfer application.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub multisig_address: MultisigAddress,
    pub asset_id: AssetId,
    pub initial_state: TransferState,
    pub meta: Value,
}

/// Operations the hub drives the protocol engine through.
///
/// All protocol-level guarantees (signatures, commitments, handshake
/// ordering) are the implementation's responsibility. Every method is
/// invoked under the owning channel's lock and with an explicit timeout at
/// the call site.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Install a transfer app; returns the new app's identity hash.
    async fn install(&self, request: InstallRequest) -> anyhow::Result<AppIdentityHash>;

    /// Take the unlock action on a live app.
    async fn take_action(&self, identity_hash: &str, action: UnlockAction) -> anyhow::Result<()>;

    /// Uninstall an app, folding its resolved balances into the free balance.
    async fn uninstall(&self, identity_hash: &str) -> anyhow::Result<()>;

    /// Deposit hub funds into a channel's free balance.
    async fn deposit(
        &self,
        multisig_address: &str,
        asset_id: &str,
        amount: Amount,
    ) -> anyhow::Result<()>;

    /// Withdraw hub funds from a channel's free balance back to the hub.
    async fn withdraw(
        &self,
        multisig_address: &str,
        asset_id: &str,
        amount: Amount,
    ) -> anyhow::Result<()>;

    /// The hub's current free balance in a channel for an asset.
    async fn free_balance(
        &self,
        multisig_address: &str,
        asset_id: &str,
        party: &str,
    ) -> anyhow::Result<Amount>;

    /// Current block height on the channel's chain, for expiry checks.
    async fn current_block_height(&self, chain_id: u64) -> anyhow::Result<u64>;
}
