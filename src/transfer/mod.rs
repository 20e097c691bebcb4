//! Conditional transfer engine
//!
//! One generalized state machine for hub-mediated transfers. A payment from
//! user A to user B becomes two linked transfer apps: A→hub (sender side)
//! and hub→B (receiver side), correlated by payment id and resolved
//! atomically once the shared secret is revealed. The unlock mechanism
//! (preimage, timelocked hash, detached signature) is a strategy consulted
//! by this engine, never a separate code path.
//!
//! Lifecycle: PROPOSED → INSTALLED (sender) → [RECEIVER_INSTALLED] →
//! RESOLVED → RECLAIMED, with REJECTED/FAILED reachable from any
//! pre-RESOLVED state.

pub mod condition;
pub mod status;

pub use condition::{TransferClaim, UnlockCondition};
pub use status::{derive_transfer_status, SideView, TransferStatus};

use crate::channel::{
    AppRepository, Channel, ChannelRepository, TransferRecord, TransferRecordStatus,
    TransferRepository,
};
use crate::collateral::{CollateralEngine, CollateralError, RebalanceDirection, RebalanceOutcome};
use crate::config::TransferConfig;
use crate::lock::{ordered_pair, LockError, LockService};
use crate::protocol::{
    AppInstance, AppType, CoinTransfer, InstallRequest, ProtocolClient, TransferState,
    UnlockAction,
};
use crate::types::{Amount, AppIdentityHash, AssetId, Bytes32, PaymentId, UserIdentifier};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Transfer engine error types
#[derive(Debug, Error)]
pub enum TransferError {
    /// No pending transfer for the correlation key.
    #[error("transfer not found: {0}")]
    TransferNotFound(PaymentId),

    /// Claim does not satisfy the transfer's unlock condition.
    #[error("invalid claim for payment {payment_id}: {reason}")]
    InvalidClaim { payment_id: PaymentId, reason: String },

    /// Collateralization failed or is mid-flight; the receiver app was NOT
    /// installed and the sender row stays PENDING. Retryable shortly.
    #[error("insufficient collateral for payment {payment_id}: {reason}")]
    InsufficientCollateral { payment_id: PaymentId, reason: String },

    /// Data invariant violation; logged at error severity, never papered
    /// over with a guessed status.
    #[error("inconsistent transfer state for payment {payment_id}: {reason}")]
    InconsistentTransferState { payment_id: PaymentId, reason: String },

    /// Asset is not on the hub's supported list.
    #[error("unsupported asset: {0}")]
    UnsupportedAsset(AssetId),

    /// No channel on record for the party.
    #[error("no channel for {0}")]
    ChannelNotFound(String),

    /// Protocol engine round-trip failed or timed out.
    #[error("protocol dispatch failed: {0}")]
    Protocol(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Collateral(#[from] CollateralError),

    #[error("transfer store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Result of resolving a transfer toward its receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub payment_id: PaymentId,
    pub receiver_app_id: AppIdentityHash,
    pub asset_id: AssetId,
    pub amount: Amount,
}

/// Read-path view of a transfer, derived without side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferView {
    pub payment_id: PaymentId,
    pub status: TransferStatus,
    pub asset_id: AssetId,
    pub amount: Amount,
    pub sender_app_id: AppIdentityHash,
    pub receiver_app_id: Option<AppIdentityHash>,
}

/// Outcome of a client check-in sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckInReport {
    /// Transfers waiting for this user to claim as receiver
    pub resolvable: Vec<PaymentId>,
    /// Sender-side transfers whose unlock was driven by this sweep
    pub unlocked: Vec<PaymentId>,
}

/// Generalized conditional-transfer state machine.
pub struct ConditionalTransferEngine {
    lock: Arc<LockService>,
    collateral: Arc<CollateralEngine>,
    protocol: Arc<dyn ProtocolClient>,
    channel_repo: Arc<dyn ChannelRepository>,
    transfer_repo: Arc<dyn TransferRepository>,
    app_repo: Arc<dyn AppRepository>,
    node_identifier: UserIdentifier,
    config: TransferConfig,
}

impl ConditionalTransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lock: Arc<LockService>,
        collateral: Arc<CollateralEngine>,
        protocol: Arc<dyn ProtocolClient>,
        channel_repo: Arc<dyn ChannelRepository>,
        transfer_repo: Arc<dyn TransferRepository>,
        app_repo: Arc<dyn AppRepository>,
        node_identifier: UserIdentifier,
        config: TransferConfig,
    ) -> Self {
        Self {
            lock,
            collateral,
            protocol,
            channel_repo,
            transfer_repo,
            app_repo,
            node_identifier,
            config,
        }
    }

    fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.config.protocol_timeout_ms)
    }

    fn asset_supported(&self, asset_id: &str) -> bool {
        self.config.supported_assets.is_empty()
            || self.config.supported_assets.iter().any(|a| a == asset_id)
    }

    /// Sender-side install: the hub observed a proposal from a paying user.
    ///
    /// Validates the proposal, then persists the PENDING transfer row and
    /// the sender app under the sender channel's lock. No receiver action
    /// happens here.
    pub async fn handle_sender_proposal(
        &self,
        app: &AppInstance,
    ) -> Result<TransferRecord, TransferError> {
        let payment_id = app.latest_state.payment_id.clone();

        if app.receiving_party() != &self.node_identifier {
            return Err(TransferError::InconsistentTransferState {
                payment_id,
                reason: "hub is not the receiving party of a sender-side proposal".to_string(),
            });
        }
        if !self.asset_supported(&app.initiator_deposit_asset_id) {
            return Err(TransferError::UnsupportedAsset(
                app.initiator_deposit_asset_id.clone(),
            ));
        }

        // the eventual receiver travels in the proposal metadata; without it
        // the row could never be offered to anyone
        let receiver = app
            .meta
            .get("recipient")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TransferError::InconsistentTransferState {
                payment_id: payment_id.clone(),
                reason: "proposal metadata names no recipient".to_string(),
            })?
            .to_string();

        let record = self
            .lock
            .with_lock(&app.multisig_address, None, || async {
                let record = TransferRecord {
                    payment_id: payment_id.clone(),
                    asset_id: app.initiator_deposit_asset_id.clone(),
                    amount: app.locked_amount(),
                    sender_identifier: app.funding_party().clone(),
                    receiver_identifier: receiver,
                    sender_app_id: app.identity_hash.clone(),
                    receiver_app_id: None,
                    unlock_signature: None,
                    status: TransferRecordStatus::Pending,
                };
                self.transfer_repo.create(record.clone()).await?;
                self.app_repo.upsert(app.clone()).await?;
                Ok::<_, TransferError>(record)
            })
            .await??;

        info!(
            "Sender-side transfer {} installed: {} {} from {}",
            payment_id, record.amount, record.asset_id, record.sender_identifier
        );
        Ok(record)
    }

    /// Resolve a transfer toward its receiver, given a claim.
    ///
    /// Locks the receiver's channel, confirms hub liquidity through the
    /// collateral engine (depositing if needed), and only then installs the
    /// receiver app. If collateralization fails nothing is installed and the
    /// sender row stays PENDING: the hub never promises funds it does not
    /// have.
    pub async fn resolve(
        &self,
        payment_id: &str,
        claim: TransferClaim,
        claiming_user: &str,
    ) -> Result<Resolution, TransferError> {
        let sender_app = self
            .app_repo
            .find_by_payment_id_and_receiver(payment_id, &self.node_identifier)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(payment_id.to_string()))?;

        let record = self
            .transfer_repo
            .get_by_payment_id(payment_id)
            .await?
            .filter(|r| r.status == TransferRecordStatus::Pending)
            .ok_or_else(|| TransferError::TransferNotFound(payment_id.to_string()))?;

        let condition = UnlockCondition::from_state(&sender_app.latest_state);
        if !condition.validate(&claim) {
            return Err(TransferError::InvalidClaim {
                payment_id: payment_id.to_string(),
                reason: "claim does not satisfy the unlock condition".to_string(),
            });
        }
        // kept on the row: the sender-side unlock must replay it for the
        // signed-secret variant
        let unlock_signature = claim.signature().map(str::to_string);

        // amount and asset come from the sender app's locked state, not the
        // claim
        let amount = sender_app.locked_amount();
        let asset_id = sender_app.initiator_deposit_asset_id.clone();

        let receiver_channel = self
            .channel_repo
            .get_by_user(claiming_user)
            .await?
            .ok_or_else(|| TransferError::ChannelNotFound(claiming_user.to_string()))?;

        debug!(
            "Resolving transfer {} toward {} ({} {})",
            payment_id, claiming_user, amount, asset_id
        );

        // resolution touches both channels (the sender-linked row and the
        // receiver-side install); lexicographic acquisition order so two
        // resolvers can never nest the same pair in opposite orders
        let sender_multisig = sender_app.multisig_address.clone();
        let receiver_multisig = receiver_channel.multisig_address.clone();
        let resolution = if sender_multisig == receiver_multisig {
            self.lock
                .with_lock(&receiver_multisig, None, || {
                    self.install_receiver_side(
                        payment_id,
                        &sender_app,
                        &record,
                        &receiver_channel,
                        &asset_id,
                        amount,
                        claiming_user,
                        unlock_signature,
                    )
                })
                .await??
        } else {
            let (first, second) = ordered_pair(&sender_multisig, &receiver_multisig);
            self.lock
                .with_lock(first, None, || async {
                    self.lock
                        .with_lock(second, None, || {
                            self.install_receiver_side(
                                payment_id,
                                &sender_app,
                                &record,
                                &receiver_channel,
                                &asset_id,
                                amount,
                                claiming_user,
                                unlock_signature,
                            )
                        })
                        .await?
                })
                .await??
        };

        info!(
            "Transfer {} resolved toward receiver {}: app {}",
            payment_id, claiming_user, resolution.receiver_app_id
        );
        Ok(resolution)
    }

    #[allow(clippy::too_many_arguments)]
    async fn install_receiver_side(
        &self,
        payment_id: &str,
        sender_app: &AppInstance,
        record: &TransferRecord,
        receiver_channel: &Channel,
        asset_id: &AssetId,
        amount: Amount,
        claiming_user: &str,
        unlock_signature: Option<String>,
    ) -> Result<Resolution, TransferError> {
        // liquidity first; a deposit may run under this same channel lock
        match self
            .collateral
            .rebalance(
                receiver_channel,
                asset_id,
                RebalanceDirection::Collateralize,
                Some(amount),
            )
            .await
        {
            Ok(RebalanceOutcome::AlreadyInFlight) => {
                return Err(TransferError::InsufficientCollateral {
                    payment_id: payment_id.to_string(),
                    reason: "collateralization in flight, try again shortly".to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Collateralization failed resolving transfer {}: {}",
                    payment_id, e
                );
                return Err(TransferError::InsufficientCollateral {
                    payment_id: payment_id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        // receiver app mirrors the sender's amount, asset, and condition
        let initial_state = TransferState {
            payment_id: payment_id.to_string(),
            coin_transfers: [
                CoinTransfer {
                    to: self.node_identifier.clone(),
                    amount,
                },
                CoinTransfer {
                    to: claiming_user.to_string(),
                    amount: Amount::zero(),
                },
            ],
            lock_hash: sender_app.latest_state.lock_hash.clone(),
            preimage: Bytes32::zero(),
            expiry: sender_app.latest_state.expiry,
            signer: sender_app.latest_state.signer.clone(),
        };
        let install = InstallRequest {
            multisig_address: receiver_channel.multisig_address.clone(),
            asset_id: asset_id.clone(),
            initial_state: initial_state.clone(),
            meta: json!({
                "sender_app": sender_app.identity_hash,
                "resolved_by": self.node_identifier,
                "recipient": record.receiver_identifier,
            }),
        };

        let receiver_app_id =
            tokio::time::timeout(self.protocol_timeout(), self.protocol.install(install))
                .await
                .map_err(|_| TransferError::Protocol("install timed out".to_string()))?
                .map_err(|e| TransferError::Protocol(e.to_string()))?;

        self.app_repo
            .upsert(AppInstance {
                identity_hash: receiver_app_id.clone(),
                app_type: AppType::Instance,
                latest_state: initial_state,
                meta: json!({ "recipient": claiming_user }),
                initiator_deposit_asset_id: asset_id.clone(),
                multisig_address: receiver_channel.multisig_address.clone(),
            })
            .await?;
        self.transfer_repo
            .mark_redeemed(payment_id, &receiver_app_id, unlock_signature)
            .await?;

        Ok(Resolution {
            payment_id: payment_id.to_string(),
            receiver_app_id,
            asset_id: asset_id.clone(),
            amount,
        })
    }

    /// Unlock the sender side once the receiver app is observed uninstalled
    /// with its condition satisfied (the secret is now known).
    ///
    /// Idempotent: if the sender app's unlock action was already taken the
    /// uninstall proceeds directly; if it is already uninstalled nothing
    /// happens.
    pub async fn handle_receiver_uninstalled(
        &self,
        receiver_app: &AppInstance,
    ) -> Result<(), TransferError> {
        let payment_id = receiver_app.latest_state.payment_id.clone();

        if receiver_app.funding_party() != &self.node_identifier {
            // not a receiver app of ours
            return Ok(());
        }
        if !receiver_app.latest_state.unlocked() {
            debug!(
                "Receiver app {} uninstalled without a revealed secret, nothing to unlock",
                receiver_app.identity_hash
            );
            return Ok(());
        }

        let secret = receiver_app.latest_state.preimage.clone();
        let sender_app = self
            .app_repo
            .find_by_payment_id_and_receiver(&payment_id, &self.node_identifier)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(payment_id.clone()))?;
        let sender_channel = self
            .channel_repo
            .get_by_multisig(&sender_app.multisig_address)
            .await?
            .ok_or_else(|| TransferError::ChannelNotFound(sender_app.multisig_address.clone()))?;

        // the signed-secret variant needs the claim's signature replayed
        let unlock_signature = self
            .transfer_repo
            .get_by_payment_id(&payment_id)
            .await?
            .and_then(|r| r.unlock_signature);

        self.lock
            .with_lock(&sender_channel.multisig_address, None, || {
                self.unlock_sender_side(
                    &payment_id,
                    &sender_app.identity_hash,
                    &secret,
                    unlock_signature,
                )
            })
            .await??;

        // Collateral recovery is decoupled from unlocking so a reclaim storm
        // never blocks other pending transfers.
        self.schedule_reclaim(
            payment_id,
            sender_channel,
            sender_app.initiator_deposit_asset_id.clone(),
        );
        Ok(())
    }

    async fn unlock_sender_side(
        &self,
        payment_id: &str,
        sender_app_id: &AppIdentityHash,
        secret: &Bytes32,
        unlock_signature: Option<String>,
    ) -> Result<(), TransferError> {
        // re-read under the lock; another handler may have won the race
        let current = self
            .app_repo
            .get(sender_app_id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(payment_id.to_string()))?;

        if current.app_type == AppType::Uninstalled {
            debug!("Sender app {} already uninstalled", sender_app_id);
            return Ok(());
        }

        if !current.latest_state.unlocked() {
            let action = UnlockAction {
                preimage: secret.clone(),
                signature: unlock_signature,
            };
            tokio::time::timeout(
                self.protocol_timeout(),
                self.protocol.take_action(sender_app_id, action),
            )
            .await
            .map_err(|_| TransferError::Protocol("take_action timed out".to_string()))?
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
            self.app_repo
                .set_preimage(sender_app_id, secret.clone())
                .await?;
        }

        tokio::time::timeout(
            self.protocol_timeout(),
            self.protocol.uninstall(sender_app_id),
        )
        .await
        .map_err(|_| TransferError::Protocol("uninstall timed out".to_string()))?
        .map_err(|e| TransferError::Protocol(e.to_string()))?;
        self.app_repo
            .set_type(sender_app_id, AppType::Uninstalled)
            .await?;

        info!("Sender app {} unlocked and uninstalled", sender_app_id);
        Ok(())
    }

    /// Fire-and-forget reclaim on the sender channel. A successful
    /// withdrawal closes out the row as RECLAIMED.
    fn schedule_reclaim(&self, payment_id: PaymentId, channel: Channel, asset_id: AssetId) {
        let lock = Arc::clone(&self.lock);
        let collateral = Arc::clone(&self.collateral);
        let transfer_repo = Arc::clone(&self.transfer_repo);
        tokio::spawn(async move {
            let multisig = channel.multisig_address.clone();
            let outcome = lock
                .with_lock(&multisig, None, || {
                    collateral.rebalance(&channel, &asset_id, RebalanceDirection::Reclaim, None)
                })
                .await;
            match outcome {
                Ok(Ok(result)) => {
                    debug!("Reclaim on channel {}: {:?}", multisig, result);
                    if matches!(result, RebalanceOutcome::Withdrawn { .. }) {
                        if let Err(e) = transfer_repo.mark_reclaimed(&payment_id).await {
                            warn!("Failed to mark transfer {} reclaimed: {}", payment_id, e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Reclaim failed on channel {}: {}", multisig, e);
                }
                Err(e) => {
                    warn!("Reclaim could not lock channel {}: {}", multisig, e);
                }
            }
        });
    }

    /// Mark a transfer failed after a rejection event.
    pub async fn handle_rejected(&self, payment_id: &str) -> Result<(), TransferError> {
        if let Some(record) = self.transfer_repo.get_by_payment_id(payment_id).await? {
            if record.status == TransferRecordStatus::Pending {
                self.transfer_repo.mark_failed(payment_id).await?;
                warn!("Transfer {} marked failed after rejection", payment_id);
            }
        }
        Ok(())
    }

    /// Read path: derive the transfer's externally visible status. No side
    /// effects.
    pub async fn get_transfer(&self, payment_id: &str) -> Result<TransferView, TransferError> {
        let sender_app = self
            .app_repo
            .find_by_payment_id_and_receiver(payment_id, &self.node_identifier)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(payment_id.to_string()))?;
        let receiver_app = self
            .app_repo
            .find_by_payment_id_and_funder(payment_id, &self.node_identifier)
            .await?;

        let channel = self
            .channel_repo
            .get_by_multisig(&sender_app.multisig_address)
            .await?
            .ok_or_else(|| TransferError::ChannelNotFound(sender_app.multisig_address.clone()))?;
        let block_height = self
            .protocol
            .current_block_height(channel.chain_id)
            .await
            .map_err(|e| TransferError::Protocol(e.to_string()))?;

        let sender_view = SideView {
            app_type: sender_app.app_type,
            unlocked: sender_app.latest_state.unlocked(),
            expiry: sender_app.latest_state.expiry,
        };
        let receiver_view = receiver_app.as_ref().map(|app| SideView {
            app_type: app.app_type,
            unlocked: app.latest_state.unlocked(),
            expiry: app.latest_state.expiry,
        });

        let status = derive_transfer_status(sender_view, receiver_view, block_height)
            .map_err(|reason| {
                error!(
                    "Inconsistent transfer state for payment {}: {}",
                    payment_id, reason
                );
                TransferError::InconsistentTransferState {
                    payment_id: payment_id.to_string(),
                    reason,
                }
            })?;

        Ok(TransferView {
            payment_id: payment_id.to_string(),
            status,
            asset_id: sender_app.initiator_deposit_asset_id.clone(),
            amount: sender_app.locked_amount(),
            sender_app_id: sender_app.identity_hash,
            receiver_app_id: receiver_app.map(|app| app.identity_hash),
        })
    }

    /// Transfers waiting for `recipient` to claim.
    pub async fn get_pending_for_recipient(
        &self,
        recipient: &str,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        Ok(self.transfer_repo.pending_for_recipient(recipient).await?)
    }

    /// Check-in sweep on a client reconnect signal.
    ///
    /// Recovers transfers that could not complete while the counterpart was
    /// offline: reports unclaimed transfers toward this user, and drives the
    /// unlock step for this user's sender-side transfers whose receiver app
    /// already completed.
    pub async fn check_in(&self, user: &str) -> Result<CheckInReport, TransferError> {
        let mut report = CheckInReport::default();

        for record in self.transfer_repo.pending_for_recipient(user).await? {
            report.resolvable.push(record.payment_id);
        }

        for record in self.transfer_repo.open_from_sender(user).await? {
            let receiver_app = self
                .app_repo
                .find_by_payment_id_and_funder(&record.payment_id, &self.node_identifier)
                .await?;
            let Some(receiver_app) = receiver_app else {
                continue;
            };
            if receiver_app.app_type == AppType::Uninstalled
                && receiver_app.latest_state.unlocked()
            {
                match self.handle_receiver_uninstalled(&receiver_app).await {
                    Ok(()) => report.unlocked.push(record.payment_id),
                    Err(e) => {
                        // one stuck transfer must not abort the sweep
                        warn!(
                            "Check-in unlock failed for payment {}: {}",
                            record.payment_id, e
                        );
                    }
                }
            }
        }

        info!(
            "Check-in for {}: {} resolvable, {} unlocked",
            user,
            report.resolvable.len(),
            report.unlocked.len()
        );
        Ok(report)
    }
}
