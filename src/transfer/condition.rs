//! Unlock condition strategies
//!
//! One conditional-transfer state machine serves three secret-reveal
//! mechanisms. Only claim validation differs between them, so the mechanism
//! is a tagged variant consulted by the engine, not three parallel code
//! paths.

use crate::protocol::TransferState;
use crate::types::{Bytes32, UserIdentifier};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, Secp256k1};
use sha2::{Digest, Sha256};

/// Secret material a receiver presents to claim a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferClaim {
    /// Revealed hash preimage
    Preimage(Bytes32),
    /// Signed secret: the attested data plus a detached recoverable
    /// signature over its hash (65-byte compact, hex)
    SignedSecret { data: Bytes32, signature: String },
}

impl TransferClaim {
    /// The secret recorded on-app once the claim is accepted.
    pub fn revealed_secret(&self) -> &Bytes32 {
        match self {
            TransferClaim::Preimage(preimage) => preimage,
            TransferClaim::SignedSecret { data, .. } => data,
        }
    }

    /// Detached signature, when the variant carries one.
    pub fn signature(&self) -> Option<&str> {
        match self {
            TransferClaim::Preimage(_) => None,
            TransferClaim::SignedSecret { signature, .. } => Some(signature),
        }
    }
}

/// The three unlock mechanisms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockCondition {
    /// Plain hash preimage
    HashPreimage { lock_hash: Bytes32 },
    /// Hash preimage with a block-height expiry after which the lock lapses
    HashLock { lock_hash: Bytes32, expiry: u64 },
    /// Detached signature by a designated signer over the secret's hash
    SignedSecret { signer: UserIdentifier },
}

impl UnlockCondition {
    /// Derive the condition governing a transfer app from its locked state.
    pub fn from_state(state: &TransferState) -> Self {
        if let Some(signer) = &state.signer {
            return UnlockCondition::SignedSecret {
                signer: signer.clone(),
            };
        }
        if let Some(expiry) = state.expiry {
            return UnlockCondition::HashLock {
                lock_hash: state.lock_hash.clone(),
                expiry,
            };
        }
        UnlockCondition::HashPreimage {
            lock_hash: state.lock_hash.clone(),
        }
    }

    /// Block height after which the condition lapses, if any.
    pub fn expiry(&self) -> Option<u64> {
        match self {
            UnlockCondition::HashLock { expiry, .. } => Some(*expiry),
            _ => None,
        }
    }

    /// Whether `claim` satisfies this condition. Malformed input is an
    /// invalid claim, never a panic.
    pub fn validate(&self, claim: &TransferClaim) -> bool {
        match (self, claim) {
            (UnlockCondition::HashPreimage { lock_hash }, TransferClaim::Preimage(preimage))
            | (
                UnlockCondition::HashLock { lock_hash, .. },
                TransferClaim::Preimage(preimage),
            ) => preimage_matches(preimage, lock_hash),
            (
                UnlockCondition::SignedSecret { signer },
                TransferClaim::SignedSecret { data, signature },
            ) => signature_matches(signer, data, signature),
            _ => false,
        }
    }
}

/// Compute the lock hash for a preimage (sha256 over the raw 32 bytes).
pub fn hash_preimage(preimage: &Bytes32) -> anyhow::Result<Bytes32> {
    let raw = preimage.to_bytes()?;
    let digest: [u8; 32] = Sha256::digest(raw).into();
    Ok(Bytes32::from_bytes(&digest))
}

fn preimage_matches(preimage: &Bytes32, lock_hash: &Bytes32) -> bool {
    match hash_preimage(preimage) {
        Ok(hashed) => &hashed == lock_hash,
        Err(_) => false,
    }
}

fn signature_matches(signer: &str, data: &Bytes32, signature: &str) -> bool {
    let Ok(data_raw) = data.to_bytes() else {
        return false;
    };
    let digest: [u8; 32] = Sha256::digest(data_raw).into();

    let stripped = signature.strip_prefix("0x").unwrap_or(signature);
    let Ok(sig_raw) = hex::decode(stripped) else {
        return false;
    };
    if sig_raw.len() != 65 {
        return false;
    }
    // recovery byte: raw 0-3, or the legacy 27/28 convention
    let recovery_byte = match sig_raw[64] {
        v @ 0..=3 => v,
        v @ 27..=28 => v - 27,
        _ => return false,
    };
    let Ok(recovery_id) = RecoveryId::from_i32(i32::from(recovery_byte)) else {
        return false;
    };
    let Ok(signature) = RecoverableSignature::from_compact(&sig_raw[..64], recovery_id) else {
        return false;
    };

    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(digest);
    let Ok(recovered) = secp.recover_ecdsa(&message, &signature) else {
        return false;
    };

    let expected = signer
        .strip_prefix("0x")
        .unwrap_or(signer)
        .to_ascii_lowercase();
    hex::encode(recovered.serialize()) == expected
}
