//! Low-level cryptographic operations.
//!
//! This module and `schemes` are the only places that import `ring`
//! directly. Wrapping and unwrapping of key material goes exclusively
//! through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//! - **Root derivation**: PBKDF2-HMAC-SHA256

use std::num::NonZeroU32;

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, pbkdf2};

use crate::error::SoftHsmError;

/// The AEAD algorithm used for every wrap.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a wrapping key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// PBKDF2 rounds for configuration-resident root keys.
const PBKDF2_ITERATIONS: u32 = 65_536;

/// A nonce generated for a single encryption operation.
struct OwnedNonce(Nonce);

fn generate_nonce() -> Result<OwnedNonce, SoftHsmError> {
    let mut buf = [0u8; NONCE_LEN];
    fill_random(&mut buf)?;
    Ok(OwnedNonce(Nonce::assume_unique_for_key(buf)))
}

/// Encrypt a plaintext payload using AES-256-GCM.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn encrypt(key_bytes: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, SoftHsmError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SoftHsmError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let nonce = generate_nonce()?;
    let aad = aead::Aad::empty();

    let mut output = Vec::with_capacity(NONCE_LEN + plaintext.len() + ALGORITHM.tag_len());
    output.extend_from_slice(nonce.0.as_ref());
    output.extend_from_slice(plaintext);

    let (_, body) = output.split_at_mut(NONCE_LEN);
    let tag = key
        .seal_in_place_separate_tag(nonce.0, aad, body)
        .map_err(|_| SoftHsmError::EncryptionFailure)?;
    output.extend_from_slice(tag.as_ref());

    Ok(output)
}

/// Decrypt a payload produced by [`encrypt`].
///
/// A wrong key or altered ciphertext fails the GCM tag check and yields
/// [`SoftHsmError::Authentication`]. No partial plaintext is returned.
pub fn decrypt(key_bytes: &[u8; KEY_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, SoftHsmError> {
    if ciphertext.len() < NONCE_LEN + ALGORITHM.tag_len() {
        return Err(SoftHsmError::Authentication);
    }

    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| SoftHsmError::Authentication)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SoftHsmError::InvalidKey)?;
    let key = LessSafeKey::new(unbound);

    let mut payload = ciphertext[NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, aead::Aad::empty(), &mut payload)
        .map_err(|_| SoftHsmError::Authentication)?;

    Ok(plaintext.to_vec())
}

/// Generate a cryptographically secure random key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], SoftHsmError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// Fill `buf` from the system RNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), SoftHsmError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| SoftHsmError::RandomnessFailure)
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// Derive a 256-bit key from a passphrase and salt.
pub fn derive_from_passphrase(passphrase: &str, salt: &str) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt.as_bytes(),
        passphrase.as_bytes(),
        &mut out,
    );
    out
}
