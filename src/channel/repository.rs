//! Repository seams for channels, app instances, and transfer records
//!
//! Durable persistence is an external collaborator (a relational store in
//! production). These traits capture the operations the coordination core
//! needs, including the atomic check-and-set the in-flight collateralization
//! flag depends on. In-memory backends are provided for single-instance
//! deployments and tests.

use crate::channel::{Channel, RebalanceProfile};
use crate::protocol::{AppInstance, AppType};
use crate::types::{Amount, AppIdentityHash, AssetId, PaymentId, UserIdentifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Lifecycle status of a persisted transfer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferRecordStatus {
    Pending,
    Redeemed,
    Failed,
    Reclaimed,
}

/// Persisted transfer record, one row per payment id. Rows are never
/// deleted; the table is the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub payment_id: PaymentId,
    pub asset_id: AssetId,
    pub amount: Amount,
    pub sender_identifier: UserIdentifier,
    pub receiver_identifier: UserIdentifier,
    pub sender_app_id: AppIdentityHash,
    /// Set once the receiver-side app is installed
    pub receiver_app_id: Option<AppIdentityHash>,
    /// Detached signature presented with the winning claim (signed-secret
    /// variant); replayed on the sender-side unlock action
    #[serde(default)]
    pub unlock_signature: Option<String>,
    pub status: TransferRecordStatus,
}

/// Channel persistence operations.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn get_by_multisig(&self, multisig_address: &str) -> anyhow::Result<Option<Channel>>;

    async fn get_by_user(&self, user_identifier: &str) -> anyhow::Result<Option<Channel>>;

    async fn save(&self, channel: Channel) -> anyhow::Result<()>;

    /// Atomically set the in-flight collateralization flag for an asset and
    /// return its previous value. Check and set must be one store operation
    /// so two hub instances racing on the same channel+asset cannot both
    /// observe `false`.
    async fn set_collateralization_in_flight(
        &self,
        multisig_address: &str,
        asset_id: &str,
    ) -> anyhow::Result<bool>;

    /// Clear the in-flight flag. Always called on the cleanup path,
    /// regardless of deposit success.
    async fn clear_collateralization_in_flight(
        &self,
        multisig_address: &str,
        asset_id: &str,
    ) -> anyhow::Result<()>;

    /// Attach or replace a channel-level rebalance profile for the profile's
    /// asset.
    async fn attach_rebalance_profile(
        &self,
        multisig_address: &str,
        profile: RebalanceProfile,
    ) -> anyhow::Result<()>;
}

/// Transfer-row persistence operations.
#[async_trait]
pub trait TransferRepository: Send + Sync {
    async fn create(&self, record: TransferRecord) -> anyhow::Result<()>;

    async fn get_by_payment_id(&self, payment_id: &str)
        -> anyhow::Result<Option<TransferRecord>>;

    /// Record the installed receiver app and the claim's secret material,
    /// and move the row toward REDEEMED.
    async fn mark_redeemed(
        &self,
        payment_id: &str,
        receiver_app_id: &AppIdentityHash,
        unlock_signature: Option<String>,
    ) -> anyhow::Result<()>;

    async fn mark_failed(&self, payment_id: &str) -> anyhow::Result<()>;

    async fn mark_reclaimed(&self, payment_id: &str) -> anyhow::Result<()>;

    /// Pending rows whose receiver is the given user.
    async fn pending_for_recipient(
        &self,
        receiver_identifier: &str,
    ) -> anyhow::Result<Vec<TransferRecord>>;

    /// Rows whose sender is the given user and whose sender-side app may
    /// still need unlocking (PENDING or REDEEMED).
    async fn open_from_sender(
        &self,
        sender_identifier: &str,
    ) -> anyhow::Result<Vec<TransferRecord>>;

    /// Full table scan for operators; audit reads only.
    async fn list(&self) -> anyhow::Result<Vec<TransferRecord>>;
}

/// App-instance read/update operations.
///
/// The protocol engine owns these rows; the coordination core reads them by
/// correlation key and records lifecycle changes driven by protocol events.
#[async_trait]
pub trait AppRepository: Send + Sync {
    async fn get(&self, identity_hash: &str) -> anyhow::Result<Option<AppInstance>>;

    /// Transfer app for a payment id where the given party receives the
    /// funds (for sender-side apps the hub is the receiving party).
    async fn find_by_payment_id_and_receiver(
        &self,
        payment_id: &str,
        receiving_party: &str,
    ) -> anyhow::Result<Option<AppInstance>>;

    /// Transfer app for a payment id where the given party funds the
    /// transfer (for receiver-side apps the hub is the funding party).
    async fn find_by_payment_id_and_funder(
        &self,
        payment_id: &str,
        funding_party: &str,
    ) -> anyhow::Result<Option<AppInstance>>;

    async fn upsert(&self, app: AppInstance) -> anyhow::Result<()>;

    async fn set_type(&self, identity_hash: &str, app_type: AppType) -> anyhow::Result<()>;

    /// Record the revealed secret on an app's latest state.
    async fn set_preimage(
        &self,
        identity_hash: &str,
        preimage: crate::types::Bytes32,
    ) -> anyhow::Result<()>;
}

/// In-memory channel repository.
#[derive(Default)]
pub struct MemoryChannelRepository {
    channels: RwLock<HashMap<String, Channel>>,
}

impl MemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelRepository for MemoryChannelRepository {
    async fn get_by_multisig(&self, multisig_address: &str) -> anyhow::Result<Option<Channel>> {
        Ok(self.channels.read().await.get(multisig_address).cloned())
    }

    async fn get_by_user(&self, user_identifier: &str) -> anyhow::Result<Option<Channel>> {
        Ok(self
            .channels
            .read()
            .await
            .values()
            .find(|c| c.user_identifier == user_identifier)
            .cloned())
    }

    async fn save(&self, channel: Channel) -> anyhow::Result<()> {
        self.channels
            .write()
            .await
            .insert(channel.multisig_address.clone(), channel);
        Ok(())
    }

    async fn set_collateralization_in_flight(
        &self,
        multisig_address: &str,
        asset_id: &str,
    ) -> anyhow::Result<bool> {
        // single write-lock section = the atomic check-and-set
        let mut channels = self.channels.write().await;
        let channel = channels
            .get_mut(multisig_address)
            .ok_or_else(|| anyhow::anyhow!("no channel for multisig {}", multisig_address))?;
        let previous = channel
            .active_collateralizations
            .insert(asset_id.to_string(), true)
            .unwrap_or(false);
        Ok(previous)
    }

    async fn clear_collateralization_in_flight(
        &self,
        multisig_address: &str,
        asset_id: &str,
    ) -> anyhow::Result<()> {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(multisig_address) {
            channel
                .active_collateralizations
                .insert(asset_id.to_string(), false);
        }
        Ok(())
    }

    async fn attach_rebalance_profile(
        &self,
        multisig_address: &str,
        profile: RebalanceProfile,
    ) -> anyhow::Result<()> {
        let mut channels = self.channels.write().await;
        let channel = channels
            .get_mut(multisig_address)
            .ok_or_else(|| anyhow::anyhow!("no channel for multisig {}", multisig_address))?;
        channel
            .rebalance_profiles
            .retain(|p| p.asset_id != profile.asset_id);
        channel.rebalance_profiles.push(profile);
        Ok(())
    }
}

/// In-memory transfer repository.
#[derive(Default)]
pub struct MemoryTransferRepository {
    records: RwLock<HashMap<String, TransferRecord>>,
}

impl MemoryTransferRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update_status(
        &self,
        payment_id: &str,
        status: TransferRecordStatus,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(payment_id)
            .ok_or_else(|| anyhow::anyhow!("no transfer row for payment {}", payment_id))?;
        record.status = status;
        Ok(())
    }
}

#[async_trait]
impl TransferRepository for MemoryTransferRepository {
    async fn create(&self, record: TransferRecord) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.payment_id) {
            anyhow::bail!("transfer row already exists for payment {}", record.payment_id);
        }
        records.insert(record.payment_id.clone(), record);
        Ok(())
    }

    async fn get_by_payment_id(
        &self,
        payment_id: &str,
    ) -> anyhow::Result<Option<TransferRecord>> {
        Ok(self.records.read().await.get(payment_id).cloned())
    }

    async fn mark_redeemed(
        &self,
        payment_id: &str,
        receiver_app_id: &AppIdentityHash,
        unlock_signature: Option<String>,
    ) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(payment_id)
            .ok_or_else(|| anyhow::anyhow!("no transfer row for payment {}", payment_id))?;
        record.receiver_app_id = Some(receiver_app_id.clone());
        record.unlock_signature = unlock_signature;
        record.status = TransferRecordStatus::Redeemed;
        Ok(())
    }

    async fn mark_failed(&self, payment_id: &str) -> anyhow::Result<()> {
        self.update_status(payment_id, TransferRecordStatus::Failed)
            .await
    }

    async fn mark_reclaimed(&self, payment_id: &str) -> anyhow::Result<()> {
        self.update_status(payment_id, TransferRecordStatus::Reclaimed)
            .await
    }

    async fn pending_for_recipient(
        &self,
        receiver_identifier: &str,
    ) -> anyhow::Result<Vec<TransferRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.receiver_identifier == receiver_identifier
                    && r.status == TransferRecordStatus::Pending
            })
            .cloned()
            .collect())
    }

    async fn open_from_sender(
        &self,
        sender_identifier: &str,
    ) -> anyhow::Result<Vec<TransferRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.sender_identifier == sender_identifier
                    && matches!(
                        r.status,
                        TransferRecordStatus::Pending | TransferRecordStatus::Redeemed
                    )
            })
            .cloned()
            .collect())
    }

    async fn list(&self) -> anyhow::Result<Vec<TransferRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// In-memory app-instance repository.
#[derive(Default)]
pub struct MemoryAppRepository {
    apps: RwLock<HashMap<String, AppInstance>>,
}

impl MemoryAppRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppRepository for MemoryAppRepository {
    async fn get(&self, identity_hash: &str) -> anyhow::Result<Option<AppInstance>> {
        Ok(self.apps.read().await.get(identity_hash).cloned())
    }

    async fn find_by_payment_id_and_receiver(
        &self,
        payment_id: &str,
        receiving_party: &str,
    ) -> anyhow::Result<Option<AppInstance>> {
        Ok(self
            .apps
            .read()
            .await
            .values()
            .find(|a| {
                a.latest_state.payment_id == payment_id && a.receiving_party() == receiving_party
            })
            .cloned())
    }

    async fn find_by_payment_id_and_funder(
        &self,
        payment_id: &str,
        funding_party: &str,
    ) -> anyhow::Result<Option<AppInstance>> {
        Ok(self
            .apps
            .read()
            .await
            .values()
            .find(|a| {
                a.latest_state.payment_id == payment_id && a.funding_party() == funding_party
            })
            .cloned())
    }

    async fn upsert(&self, app: AppInstance) -> anyhow::Result<()> {
        self.apps
            .write()
            .await
            .insert(app.identity_hash.clone(), app);
        Ok(())
    }

    async fn set_type(&self, identity_hash: &str, app_type: AppType) -> anyhow::Result<()> {
        let mut apps = self.apps.write().await;
        let app = apps
            .get_mut(identity_hash)
            .ok_or_else(|| anyhow::anyhow!("no app instance {}", identity_hash))?;
        app.app_type = app_type;
        Ok(())
    }

    async fn set_preimage(
        &self,
        identity_hash: &str,
        preimage: crate::types::Bytes32,
    ) -> anyhow::Result<()> {
        let mut apps = self.apps.write().await;
        let app = apps
            .get_mut(identity_hash)
            .ok_or_else(|| anyhow::anyhow!("no app instance {}", identity_hash))?;
        app.latest_state.preimage = preimage;
        Ok(())
    }
}
