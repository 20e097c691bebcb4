//! Channel and rebalance-profile data model
//!
//! A channel is a two-party off-chain ledger backed by an on-chain multisig
//! escrow. The hub never deletes a channel record; its lifecycle ends only
//! when the multisig is closed on-chain, which is outside this crate.

pub mod repository;

pub use repository::{
    AppRepository, ChannelRepository, MemoryAppRepository, MemoryChannelRepository,
    MemoryTransferRepository, TransferRecord, TransferRecordStatus, TransferRepository,
};

use crate::types::{Amount, AssetId, MultisigAddress, UserIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-asset collateralization thresholds for one channel.
///
/// Bound ordering is enforced at construction: collateralize bounds must be
/// ordered, reclaim bounds must be ordered, and the reclaim floor must never
/// sit below the collateralize ceiling or the engine would oscillate between
/// depositing and withdrawing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProfile {
    pub asset_id: AssetId,
    pub lower_bound_collateralize: Amount,
    pub upper_bound_collateralize: Amount,
    pub lower_bound_reclaim: Amount,
    pub upper_bound_reclaim: Amount,
}

impl RebalanceProfile {
    /// Build a profile, rejecting inverted or oscillation-prone bounds.
    pub fn new(
        asset_id: AssetId,
        lower_bound_collateralize: Amount,
        upper_bound_collateralize: Amount,
        lower_bound_reclaim: Amount,
        upper_bound_reclaim: Amount,
    ) -> Result<Self, String> {
        if upper_bound_collateralize < lower_bound_collateralize {
            return Err(format!(
                "upper collateralize bound {} below lower bound {}",
                upper_bound_collateralize, lower_bound_collateralize
            ));
        }
        if upper_bound_reclaim < lower_bound_reclaim {
            return Err(format!(
                "upper reclaim bound {} below lower bound {}",
                upper_bound_reclaim, lower_bound_reclaim
            ));
        }
        let reclaim_enabled = !(lower_bound_reclaim.is_zero() && upper_bound_reclaim.is_zero());
        if reclaim_enabled && lower_bound_reclaim < upper_bound_collateralize {
            return Err(format!(
                "reclaim floor {} below collateralize ceiling {}",
                lower_bound_reclaim, upper_bound_collateralize
            ));
        }
        Ok(Self {
            asset_id,
            lower_bound_collateralize,
            upper_bound_collateralize,
            lower_bound_reclaim,
            upper_bound_reclaim,
        })
    }

    /// Reclaiming is opted out when both reclaim bounds are zero.
    pub fn reclaim_disabled(&self) -> bool {
        self.lower_bound_reclaim.is_zero() && self.upper_bound_reclaim.is_zero()
    }
}

/// Durable channel record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// On-chain multisig escrow address, the channel's unique key
    pub multisig_address: MultisigAddress,
    /// User side of the channel
    pub user_identifier: UserIdentifier,
    /// Hub side of the channel
    pub node_identifier: UserIdentifier,
    /// Chain the multisig lives on
    pub chain_id: u64,
    /// Per-asset deposit-in-flight flags; true while a hub deposit for that
    /// asset is mid-flight. Acts as a finer-grained exclusion than the
    /// channel lock, which is channel-level only.
    #[serde(default)]
    pub active_collateralizations: HashMap<AssetId, bool>,
    /// Profiles explicitly attached to this channel
    #[serde(default)]
    pub rebalance_profiles: Vec<RebalanceProfile>,
}

impl Channel {
    pub fn new(
        multisig_address: MultisigAddress,
        user_identifier: UserIdentifier,
        node_identifier: UserIdentifier,
        chain_id: u64,
    ) -> Self {
        Self {
            multisig_address,
            user_identifier,
            node_identifier,
            chain_id,
            active_collateralizations: HashMap::new(),
            rebalance_profiles: Vec::new(),
        }
    }

    /// Profile attached to this channel for an asset, if any.
    pub fn profile_for(&self, asset_id: &str) -> Option<&RebalanceProfile> {
        self.rebalance_profiles
            .iter()
            .find(|p| p.asset_id == asset_id)
    }

    /// Whether a hub deposit for this asset is currently in flight.
    pub fn collateralization_in_flight(&self, asset_id: &str) -> bool {
        self.active_collateralizations
            .get(asset_id)
            .copied()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Amount;

    fn amt(n: u64) -> Amount {
        Amount::from(n)
    }

    #[test]
    fn profile_accepts_ordered_bounds() {
        let profile = RebalanceProfile::new("0x0".into(), amt(50), amt(200), amt(250), amt(500));
        assert!(profile.is_ok());
    }

    #[test]
    fn profile_rejects_inverted_collateralize_bounds() {
        let profile = RebalanceProfile::new("0x0".into(), amt(200), amt(50), amt(250), amt(500));
        assert!(profile.is_err());
    }

    #[test]
    fn profile_rejects_reclaim_floor_below_collateralize_ceiling() {
        // would oscillate: reclaim down to 100, immediately top up to 200
        let profile = RebalanceProfile::new("0x0".into(), amt(50), amt(200), amt(100), amt(500));
        assert!(profile.is_err());
    }

    #[test]
    fn zeroed_reclaim_bounds_mean_opt_out() {
        let profile =
            RebalanceProfile::new("0x0".into(), amt(50), amt(200), amt(0), amt(0)).unwrap();
        assert!(profile.reclaim_disabled());
    }

    #[test]
    fn channel_profile_lookup() {
        let mut channel = Channel::new("0xabc".into(), "user".into(), "hub".into(), 1);
        channel.rebalance_profiles.push(
            RebalanceProfile::new("0xtoken".into(), amt(1), amt(2), amt(0), amt(0)).unwrap(),
        );
        assert!(channel.profile_for("0xtoken").is_some());
        assert!(channel.profile_for("0xother").is_none());
        assert!(!channel.collateralization_in_flight("0xtoken"));
    }
}
