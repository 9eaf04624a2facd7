//! The wrapping key value object.
//!
//! A wrapping key is a symmetric AES-256-GCM key used only to encrypt other
//! key material: signing private keys, or another wrapping key's bytes when
//! keys are chained.
//!
//! - Not `Clone`. Shared through `Arc` by the wrapping-key cache.
//! - Zeroised on drop.
//! - `Debug` never prints the key bytes.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, KEY_LEN};
use crate::error::SoftHsmError;

/// The only algorithm name accepted for wrapping keys.
pub const WRAPPING_ALGORITHM: &str = "AES";

/// Encoding version written into wrapping-key catalog rows.
pub const WRAPPING_KEY_ENCODING_VERSION: i32 = 1;

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    bytes: [u8; KEY_LEN],
    #[zeroize(skip)]
    algorithm: &'static str,
}

impl WrappingKey {
    /// Produce a fresh random AES-256 wrapping key.
    pub fn generate() -> Result<Self, SoftHsmError> {
        Ok(Self::from_bytes(crypto::generate_random_key()?))
    }

    /// Derive an unmanaged root key from configuration-resident secrets.
    pub fn derive(passphrase: &str, salt: &str) -> Self {
        Self::from_bytes(crypto::derive_from_passphrase(passphrase, salt))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes,
            algorithm: WRAPPING_ALGORITHM,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    /// Authenticate and encrypt `plain` under this key.
    pub fn wrap(&self, plain: &[u8]) -> Result<Vec<u8>, SoftHsmError> {
        crypto::encrypt(&self.bytes, plain)
    }

    /// Decrypt and verify `wrapped`. The returned buffer is zeroised when dropped.
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, SoftHsmError> {
        crypto::decrypt(&self.bytes, wrapped).map(Zeroizing::new)
    }

    /// Wrap another wrapping key under this one (chaining).
    pub fn wrap_key(&self, other: &WrappingKey) -> Result<Vec<u8>, SoftHsmError> {
        self.wrap(&other.bytes)
    }

    /// Recover a wrapping key previously produced by [`WrappingKey::wrap_key`].
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<WrappingKey, SoftHsmError> {
        let plain = self.unwrap(wrapped)?;
        let bytes: [u8; KEY_LEN] = plain
            .as_slice()
            .try_into()
            .map_err(|_| SoftHsmError::InvalidKey)?;
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappingKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
