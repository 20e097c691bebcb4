//! Shared identifier and amount types
//!
//! Every balance and transfer amount is a 256-bit unsigned integer (wei
//! scale). Floating point is never used for amounts.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Wei-scale unsigned amount.
pub type Amount = U256;

/// Asset identifier (token contract address, or the zero address for the
/// native asset).
pub type AssetId = String;

/// Correlation key shared by the sender and receiver applications of one
/// conditional transfer.
pub type PaymentId = String;

/// Public identifier of a channel participant.
pub type UserIdentifier = String;

/// Identity hash of an installed application instance.
pub type AppIdentityHash = String;

/// Multisig address backing a channel.
pub type MultisigAddress = String;

/// 32-byte value rendered as 0x-prefixed lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bytes32(pub String);

impl Bytes32 {
    /// Build from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Decode to raw bytes. Fails on malformed or wrong-length input.
    pub fn to_bytes(&self) -> anyhow::Result<[u8; 32]> {
        let stripped = self.0.strip_prefix("0x").unwrap_or(&self.0);
        let raw = hex::decode(stripped)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected 32 bytes, got {}", raw.len()))
    }

    /// The zero value, used as the empty-preimage sentinel.
    pub fn zero() -> Self {
        Self::from_bytes(&[0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self == &Self::zero()
    }
}

impl std::fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
