//! Configuration management for the hub node
//!
//! Handles configuration loading, per-field defaults, and validation.
//! Amounts are decimal wei strings in the file and parsed into 256-bit
//! unsigned integers at load time.

use crate::channel::RebalanceProfile;
use crate::types::Amount;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lock service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Default lock TTL in milliseconds (forced expiry for crashed holders)
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Maximum time an acquire call may wait before failing with LockTimeout
    #[serde(default = "default_lock_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Bound on outstanding waiters per resource; the next acquire fails
    /// immediately with LockQueueFull
    #[serde(default = "default_max_waiters")]
    pub max_waiters_per_resource: usize,

    /// Interval between store polls while waiting on a contended resource
    #[serde(default = "default_lock_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    90_000
}

fn default_lock_max_wait_ms() -> u64 {
    110_000
}

fn default_max_waiters() -> usize {
    10
}

fn default_lock_poll_ms() -> u64 {
    10
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
            max_wait_ms: default_lock_max_wait_ms(),
            max_waiters_per_resource: default_max_waiters(),
            poll_interval_ms: default_lock_poll_ms(),
        }
    }
}

/// Default rebalance profile bounds, decimal wei strings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultProfileConfig {
    #[serde(default = "default_lower_collateralize")]
    pub lower_bound_collateralize: String,

    #[serde(default = "default_upper_collateralize")]
    pub upper_bound_collateralize: String,

    #[serde(default = "default_lower_reclaim")]
    pub lower_bound_reclaim: String,

    #[serde(default = "default_upper_reclaim")]
    pub upper_bound_reclaim: String,
}

fn default_lower_collateralize() -> String {
    "5000000000000000".to_string()
}

fn default_upper_collateralize() -> String {
    "50000000000000000".to_string()
}

fn default_lower_reclaim() -> String {
    "0".to_string()
}

fn default_upper_reclaim() -> String {
    // both reclaim bounds zero = reclaim disabled unless configured
    "0".to_string()
}

impl Default for DefaultProfileConfig {
    fn default() -> Self {
        Self {
            lower_bound_collateralize: default_lower_collateralize(),
            upper_bound_collateralize: default_upper_collateralize(),
            lower_bound_reclaim: default_lower_reclaim(),
            upper_bound_reclaim: default_upper_reclaim(),
        }
    }
}

/// Collateral engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralConfig {
    /// System-default rebalance profile, used when neither the rebalancing
    /// service nor the channel supplies one
    #[serde(default)]
    pub default_profile: DefaultProfileConfig,

    /// Timeout for a single deposit/withdraw round-trip, milliseconds
    #[serde(default = "default_deposit_timeout_ms")]
    pub deposit_timeout_ms: u64,
}

fn default_deposit_timeout_ms() -> u64 {
    90_000
}

impl Default for CollateralConfig {
    fn default() -> Self {
        Self {
            default_profile: DefaultProfileConfig::default(),
            deposit_timeout_ms: default_deposit_timeout_ms(),
        }
    }
}

/// Conditional transfer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Assets the hub will mediate transfers for (empty = all)
    #[serde(default)]
    pub supported_assets: Vec<String>,

    /// Timeout for a single protocol install/action/uninstall round-trip,
    /// milliseconds
    #[serde(default = "default_protocol_timeout_ms")]
    pub protocol_timeout_ms: u64,
}

fn default_protocol_timeout_ms() -> u64 {
    60_000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            supported_assets: Vec::new(),
            protocol_timeout_ms: default_protocol_timeout_ms(),
        }
    }
}

/// Retry policy configuration (used by the deposit submission path)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts, milliseconds; doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Maximum random jitter added to each backoff, milliseconds
    #[serde(default = "default_retry_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_retry_jitter_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_backoff_ms: default_retry_backoff_ms(),
            max_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

/// Top-level hub node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    /// Hub's public identifier on the channel network
    #[serde(default)]
    pub node_identifier: String,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub collateral: CollateralConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl HubConfig {
    /// Load configuration from a TOML file, applying defaults for missing
    /// fields, then validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// The default rebalance profile must satisfy the same bound ordering the
    /// collateral engine enforces at runtime, so a bad default fails at
    /// startup rather than on the first rebalance.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.default_rebalance_profile("")?;
        if self.lock.max_wait_ms == 0 {
            anyhow::bail!("lock.max_wait_ms must be non-zero");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be non-zero");
        }
        Ok(())
    }

    /// Materialize the configured system-default profile for an asset.
    pub fn default_rebalance_profile(&self, asset_id: &str) -> anyhow::Result<RebalanceProfile> {
        let p = &self.collateral.default_profile;
        RebalanceProfile::new(
            asset_id.to_string(),
            parse_amount(&p.lower_bound_collateralize)?,
            parse_amount(&p.upper_bound_collateralize)?,
            parse_amount(&p.lower_bound_reclaim)?,
            parse_amount(&p.upper_bound_reclaim)?,
        )
        .map_err(|e| anyhow::anyhow!("invalid default rebalance profile: {}", e))
    }
}

/// Parse a decimal wei string into an Amount.
pub fn parse_amount(raw: &str) -> anyhow::Result<Amount> {
    Amount::from_dec_str(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid amount {:?}: {:?}", raw, e))
}
