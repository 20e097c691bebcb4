//! Collateral rebalancing engine
//!
//! Decides, per channel and per asset, whether the hub must top up or
//! reclaim its side of the channel's free balance. Callers hold the
//! channel's lock; the per-(channel, asset) in-flight flag is the additional
//! exclusion that stops two concurrent collateralizations from double
//! depositing even when lock granularity does not cover the asset.

use crate::channel::{Channel, ChannelRepository, RebalanceProfile};
use crate::config::{CollateralConfig, RetryConfig};
use crate::protocol::ProtocolClient;
use crate::types::{Amount, AssetId, UserIdentifier};
use crate::utils::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Which way funds should move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceDirection {
    /// Hub deposits into the channel
    Collateralize,
    /// Hub withdraws excess back out
    Reclaim,
}

/// Result of a rebalance decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// Balance already within bounds; nothing moved.
    NoOp,
    /// Another collateralization for this channel+asset is mid-flight;
    /// nothing moved (idempotent backoff).
    AlreadyInFlight,
    /// Hub deposited `amount`, bringing the free balance to `target`.
    Deposited { amount: Amount, target: Amount },
    /// Hub withdrew `amount` back toward the reclaim floor.
    Withdrawn { amount: Amount },
}

/// Collateral engine error types
#[derive(Debug, Error)]
pub enum CollateralError {
    /// No profile from the rebalancing service, the channel, or the
    /// system default. Configuration problem, surfaced to operators.
    #[error("no rebalance profile for channel {multisig} asset {asset}")]
    NoRebalanceConfig { multisig: String, asset: String },

    /// A resolved profile violates bound ordering.
    #[error("invalid rebalance profile for asset {asset}: {reason}")]
    InvalidRebalanceConfig { asset: String, reason: String },

    /// The underlying deposit/withdraw failed. The in-flight flag has
    /// already been cleared; callers must not assume funds moved.
    #[error("collateral transfer failed for channel {multisig}: {reason}")]
    TransferFailed { multisig: String, reason: String },

    /// Repository or balance-read failure at the seam.
    #[error("collateral engine store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Optional live rebalancing-recommendation source (an HTTP service in
/// production). Failures are non-fatal; the engine falls back to the stored
/// profile, then the default.
#[async_trait]
pub trait RebalanceTargetSource: Send + Sync {
    async fn profile_for(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
    ) -> anyhow::Result<Option<RebalanceProfile>>;
}

/// Collateral rebalancing engine.
pub struct CollateralEngine {
    channel_repo: Arc<dyn ChannelRepository>,
    protocol: Arc<dyn ProtocolClient>,
    target_source: Option<Arc<dyn RebalanceTargetSource>>,
    /// System-default bounds, applied to any asset lacking a profile
    default_profile: Option<RebalanceProfile>,
    node_identifier: UserIdentifier,
    retry: RetryPolicy,
    deposit_timeout: Duration,
}

impl CollateralEngine {
    pub fn new(
        channel_repo: Arc<dyn ChannelRepository>,
        protocol: Arc<dyn ProtocolClient>,
        node_identifier: UserIdentifier,
        config: &CollateralConfig,
        retry_config: &RetryConfig,
        default_profile: Option<RebalanceProfile>,
    ) -> Self {
        Self {
            channel_repo,
            protocol,
            target_source: None,
            default_profile,
            node_identifier,
            retry: RetryPolicy::new(retry_config),
            deposit_timeout: Duration::from_millis(config.deposit_timeout_ms),
        }
    }

    /// Attach a live rebalancing-recommendation source.
    pub fn with_target_source(mut self, source: Arc<dyn RebalanceTargetSource>) -> Self {
        self.target_source = Some(source);
        self
    }

    /// Hub's current free balance in the channel for an asset.
    pub async fn free_balance(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
    ) -> Result<Amount, CollateralError> {
        let balance = tokio::time::timeout(
            self.deposit_timeout,
            self.protocol
                .free_balance(&channel.multisig_address, asset_id, &self.node_identifier),
        )
        .await
        .map_err(|_| anyhow::anyhow!("free balance read timed out"))??;
        Ok(balance)
    }

    /// Rebalance the hub's side of `channel` for `asset_id`.
    ///
    /// For `Collateralize`, `minimum_required` raises the deposit target so
    /// a pending transfer's full amount is covered before the hub promises
    /// it.
    pub async fn rebalance(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        direction: RebalanceDirection,
        minimum_required: Option<Amount>,
    ) -> Result<RebalanceOutcome, CollateralError> {
        let profile = self.resolve_profile(channel, asset_id).await?;
        debug!(
            "Rebalance {:?} for channel {} asset {}: bounds collateralize [{}, {}] reclaim [{}, {}]",
            direction,
            channel.multisig_address,
            asset_id,
            profile.lower_bound_collateralize,
            profile.upper_bound_collateralize,
            profile.lower_bound_reclaim,
            profile.upper_bound_reclaim
        );

        match direction {
            RebalanceDirection::Collateralize => {
                self.collateralize(channel, asset_id, &profile, minimum_required)
                    .await
            }
            RebalanceDirection::Reclaim => self.reclaim(channel, asset_id, &profile).await,
        }
    }

    async fn collateralize(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        profile: &RebalanceProfile,
        minimum_required: Option<Amount>,
    ) -> Result<RebalanceOutcome, CollateralError> {
        let minimum = minimum_required.unwrap_or_else(Amount::zero);
        let current = self.free_balance(channel, asset_id).await?;

        // Sufficient when the replenish floor is met and the pending
        // transfer (if any) fits in what is already there.
        if current >= profile.lower_bound_collateralize && current >= minimum {
            debug!(
                "Channel {} asset {} already collateralized ({} free)",
                channel.multisig_address, asset_id, current
            );
            return Ok(RebalanceOutcome::NoOp);
        }

        let target = profile.upper_bound_collateralize.max(minimum);
        let deposit_amount = target - current;

        // Finer-grained than the channel lock: two collateralizations for
        // different assets may race under one lock, and two hub instances
        // may race ahead of lock expiry. The previous flag value comes back
        // from a single atomic store operation.
        let already_in_flight = self
            .channel_repo
            .set_collateralization_in_flight(&channel.multisig_address, asset_id)
            .await?;
        if already_in_flight {
            info!(
                "Collateralization already in flight for channel {} asset {}, backing off",
                channel.multisig_address, asset_id
            );
            return Ok(RebalanceOutcome::AlreadyInFlight);
        }

        let deposit_result = self.submit_deposit(channel, asset_id, deposit_amount).await;

        // Guaranteed cleanup: the flag is cleared whether or not the deposit
        // went through, so a later retry is never blocked.
        if let Err(e) = self
            .channel_repo
            .clear_collateralization_in_flight(&channel.multisig_address, asset_id)
            .await
        {
            warn!(
                "Failed to clear in-flight flag for channel {} asset {}: {}",
                channel.multisig_address, asset_id, e
            );
        }

        match deposit_result {
            Ok(()) => {
                info!(
                    "Deposited {} into channel {} asset {} (target {})",
                    deposit_amount, channel.multisig_address, asset_id, target
                );
                Ok(RebalanceOutcome::Deposited {
                    amount: deposit_amount,
                    target,
                })
            }
            Err(reason) => Err(CollateralError::TransferFailed {
                multisig: channel.multisig_address.clone(),
                reason,
            }),
        }
    }

    async fn submit_deposit(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        amount: Amount,
    ) -> Result<(), String> {
        self.retry
            .run("collateral deposit", || async {
                tokio::time::timeout(
                    self.deposit_timeout,
                    self.protocol
                        .deposit(&channel.multisig_address, asset_id, amount),
                )
                .await
                .map_err(|_| "deposit timed out".to_string())?
                .map_err(|e| e.to_string())
            })
            .await
    }

    async fn reclaim(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        profile: &RebalanceProfile,
    ) -> Result<RebalanceOutcome, CollateralError> {
        if profile.reclaim_disabled() {
            debug!(
                "Reclaim disabled for channel {} asset {}",
                channel.multisig_address, asset_id
            );
            return Ok(RebalanceOutcome::NoOp);
        }

        let current = self.free_balance(channel, asset_id).await?;
        if current <= profile.upper_bound_reclaim {
            return Ok(RebalanceOutcome::NoOp);
        }

        let withdraw_amount = current - profile.lower_bound_reclaim;
        let result = tokio::time::timeout(
            self.deposit_timeout,
            self.protocol
                .withdraw(&channel.multisig_address, asset_id, withdraw_amount),
        )
        .await
        .map_err(|_| "withdraw timed out".to_string())
        .and_then(|r| r.map_err(|e| e.to_string()));

        match result {
            Ok(()) => {
                info!(
                    "Reclaimed {} from channel {} asset {}",
                    withdraw_amount, channel.multisig_address, asset_id
                );
                Ok(RebalanceOutcome::Withdrawn {
                    amount: withdraw_amount,
                })
            }
            Err(reason) => Err(CollateralError::TransferFailed {
                multisig: channel.multisig_address.clone(),
                reason,
            }),
        }
    }

    /// Resolve the applicable profile: live service response first, then the
    /// channel-attached profile, then the system default.
    async fn resolve_profile(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
    ) -> Result<RebalanceProfile, CollateralError> {
        if let Some(source) = &self.target_source {
            match source.profile_for(channel, asset_id).await {
                Ok(Some(profile)) => return self.validated(profile, asset_id),
                Ok(None) => {}
                Err(e) => {
                    // non-fatal: fall back to stored profile, then default
                    warn!(
                        "Rebalancing service lookup failed for channel {} asset {}: {}",
                        channel.multisig_address, asset_id, e
                    );
                }
            }
        }

        if let Some(profile) = channel.profile_for(asset_id) {
            return self.validated(profile.clone(), asset_id);
        }

        if let Some(default) = &self.default_profile {
            let mut profile = default.clone();
            profile.asset_id = asset_id.clone();
            return self.validated(profile, asset_id);
        }

        Err(CollateralError::NoRebalanceConfig {
            multisig: channel.multisig_address.clone(),
            asset: asset_id.clone(),
        })
    }

    fn validated(
        &self,
        profile: RebalanceProfile,
        asset_id: &AssetId,
    ) -> Result<RebalanceProfile, CollateralError> {
        // re-validate: profiles from the service or an older store schema
        // may not have passed the constructor
        RebalanceProfile::new(
            profile.asset_id.clone(),
            profile.lower_bound_collateralize,
            profile.upper_bound_collateralize,
            profile.lower_bound_reclaim,
            profile.upper_bound_reclaim,
        )
        .map_err(|reason| CollateralError::InvalidRebalanceConfig {
            asset: asset_id.clone(),
            reason,
        })
    }
}
