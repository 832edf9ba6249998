//! Agent identities: Ed25519 key pairs and their derived addresses.
//!
//! An address is `agent1` followed by the base58 encoding of the 32-byte
//! public key, so the key can always be recovered from the address alone.
//! Signatures are `sig1` followed by the base58 encoding of the 64-byte
//! Ed25519 signature.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

pub const ADDRESS_PREFIX: &str = "agent1";
pub const SIGNATURE_PREFIX: &str = "sig1";

const SEED_DOMAIN: &[u8] = b"uagents/identity";

/// An agent's signing key plus the address derived from it.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    address: String,
}

impl Identity {
    /// Derive an identity from a seed phrase. The same seed and index always
    /// produce the same key pair and address.
    pub fn from_seed(seed: &str, index: u32) -> Result<Self> {
        let seed = seed.trim();
        if seed.is_empty() {
            return Err(Error::InvalidSeed("seed phrase is empty".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(SEED_DOMAIN);
        hasher.update(seed.as_bytes());
        hasher.update(index.to_be_bytes());
        let secret: [u8; 32] = hasher.finalize().into();

        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    /// Generate a random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_from_key(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    /// Restore an identity from its raw 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::InvalidSeed(format!("expected 32 secret bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign an already hashed 32-byte digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> String {
        let signature: Signature = self.signing_key.sign(digest);
        format!(
            "{}{}",
            SIGNATURE_PREFIX,
            bs58::encode(signature.to_bytes()).into_string()
        )
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

pub fn address_from_key(key: &VerifyingKey) -> String {
    format!(
        "{}{}",
        ADDRESS_PREFIX,
        bs58::encode(key.as_bytes()).into_string()
    )
}

/// Strip a `scheme://` prefix, if any, from an address or name.
pub fn normalize_address(address: &str) -> &str {
    match address.rsplit_once("://") {
        Some((_, rest)) => rest,
        None => address,
    }
}

/// Recover the public key encoded in an address.
pub fn parse_address(address: &str) -> Result<VerifyingKey> {
    let address = normalize_address(address);
    let encoded = address
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or_else(|| Error::InvalidAddress(format!("missing '{}' prefix", ADDRESS_PREFIX)))?;
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| Error::InvalidAddress(e.to_string()))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidAddress("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&key).map_err(|e| Error::InvalidAddress(e.to_string()))
}

pub fn is_valid_address(address: &str) -> bool {
    parse_address(address).is_ok()
}

/// Check `signature` over `digest` against the key behind `address`.
/// Malformed addresses or signatures yield `false`.
pub fn verify_digest(address: &str, digest: &[u8; 32], signature: &str) -> bool {
    let Ok(key) = parse_address(address) else {
        return false;
    };
    let Some(encoded) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(bytes) = bs58::decode(encoded).into_vec() else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&bytes);
    key.verify_strict(digest, &signature).is_ok()
}

/// SHA-256 helper for callers that need to hash before signing.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
