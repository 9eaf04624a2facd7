//! Key schemes and the asymmetric operations behind them.
//!
//! The engine treats a scheme as a pluggable capability: generate a key
//! pair, sign, verify, and for agreement schemes derive a shared secret.
//! Curve math and padding live entirely in `ring` and `x25519-dalek`.
//!
//! Private keys leave this module only as zeroising buffers: PKCS#8
//! documents for the signing schemes, raw 32-byte scalars for X25519.

use std::collections::BTreeMap;

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, EcdsaSigningAlgorithm, Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::SoftHsmError;

/// Length of the short fingerprint (`keyId`) in hex characters.
pub const SHORT_KEY_ID_LEN: usize = 12;

/// Supported asymmetric key schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyScheme {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
    X25519,
}

impl KeyScheme {
    pub const ALL: [KeyScheme; 4] = [
        KeyScheme::EcdsaP256,
        KeyScheme::EcdsaP384,
        KeyScheme::Ed25519,
        KeyScheme::X25519,
    ];

    /// Stable name persisted in `SigningKeyEntity::scheme_code_name`.
    pub fn code_name(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ECDSA_SECP256R1",
            Self::EcdsaP384 => "ECDSA_SECP384R1",
            Self::Ed25519 => "EDDSA_ED25519",
            Self::X25519 => "X25519",
        }
    }

    pub fn from_code_name(name: &str) -> Result<Self, SoftHsmError> {
        Self::ALL
            .into_iter()
            .find(|s| s.code_name() == name)
            .ok_or_else(|| SoftHsmError::BadRequest(format!("unsupported key scheme '{name}'")))
    }

    /// Signature specs this scheme can produce. Empty for agreement-only schemes.
    pub fn signature_specs(&self) -> &'static [SignatureSpec] {
        match self {
            Self::EcdsaP256 => &[SignatureSpec::EcdsaSha256, SignatureSpec::EcdsaSha256Plain],
            Self::EcdsaP384 => &[SignatureSpec::EcdsaSha384, SignatureSpec::EcdsaSha384Plain],
            Self::Ed25519 => &[SignatureSpec::EdDsa],
            Self::X25519 => &[],
        }
    }

    pub fn can_sign(&self) -> bool {
        !self.signature_specs().is_empty()
    }

    pub fn supports_key_agreement(&self) -> bool {
        matches!(self, Self::X25519)
    }

    /// The default signature spec for the scheme, if it signs at all.
    pub fn default_signature_spec(&self) -> Option<SignatureSpec> {
        self.signature_specs().first().copied()
    }
}

/// How a signature is computed and encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignatureSpec {
    /// ECDSA P-256 with SHA-256, ASN.1 DER encoded.
    EcdsaSha256,
    /// ECDSA P-256 with SHA-256, fixed-length `r || s`.
    EcdsaSha256Plain,
    /// ECDSA P-384 with SHA-384, ASN.1 DER encoded.
    EcdsaSha384,
    /// ECDSA P-384 with SHA-384, fixed-length `r || s`.
    EcdsaSha384Plain,
    /// Pure Ed25519.
    EdDsa,
}

impl SignatureSpec {
    pub fn signature_name(&self) -> &'static str {
        match self {
            Self::EcdsaSha256 => "SHA256withECDSA",
            Self::EcdsaSha256Plain => "SHA256withPLAIN-ECDSA",
            Self::EcdsaSha384 => "SHA384withECDSA",
            Self::EcdsaSha384Plain => "SHA384withPLAIN-ECDSA",
            Self::EdDsa => "EdDSA",
        }
    }

    fn ecdsa_signing(&self) -> Option<&'static EcdsaSigningAlgorithm> {
        match self {
            Self::EcdsaSha256 => Some(&signature::ECDSA_P256_SHA256_ASN1_SIGNING),
            Self::EcdsaSha256Plain => Some(&signature::ECDSA_P256_SHA256_FIXED_SIGNING),
            Self::EcdsaSha384 => Some(&signature::ECDSA_P384_SHA384_ASN1_SIGNING),
            Self::EcdsaSha384Plain => Some(&signature::ECDSA_P384_SHA384_FIXED_SIGNING),
            Self::EdDsa => None,
        }
    }

    fn verification(&self) -> &'static dyn signature::VerificationAlgorithm {
        match self {
            Self::EcdsaSha256 => &signature::ECDSA_P256_SHA256_ASN1,
            Self::EcdsaSha256Plain => &signature::ECDSA_P256_SHA256_FIXED,
            Self::EcdsaSha384 => &signature::ECDSA_P384_SHA384_ASN1,
            Self::EcdsaSha384Plain => &signature::ECDSA_P384_SHA384_FIXED,
            Self::EdDsa => &signature::ED25519,
        }
    }
}

/// A freshly generated key pair. The private half zeroises on drop.
pub struct GeneratedKeyPair {
    pub scheme: KeyScheme,
    pub public_key: Vec<u8>,
    pub private_key: Zeroizing<Vec<u8>>,
}

/// An encoded public key together with its scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub scheme: KeyScheme,
    pub encoded: Vec<u8>,
}

impl PublicKey {
    pub fn new(scheme: KeyScheme, encoded: Vec<u8>) -> Self {
        Self { scheme, encoded }
    }

    /// Short fingerprint, as stored in `SigningKeyEntity::key_id`.
    pub fn key_id(&self) -> String {
        key_ids(&self.encoded).0
    }

    pub fn full_key_id(&self) -> String {
        key_ids(&self.encoded).1
    }

    pub fn verify(&self, spec: SignatureSpec, data: &[u8], sig: &[u8]) -> bool {
        self.scheme.signature_specs().contains(&spec) && verify(spec, &self.encoded, data, sig)
    }
}

/// The schemes a service instance is willing to use.
#[derive(Debug, Clone)]
pub struct SchemeMetadata {
    schemes: Vec<KeyScheme>,
}

impl Default for SchemeMetadata {
    fn default() -> Self {
        Self {
            schemes: KeyScheme::ALL.to_vec(),
        }
    }
}

impl SchemeMetadata {
    pub fn new(schemes: Vec<KeyScheme>) -> Self {
        Self { schemes }
    }

    pub fn schemes(&self) -> &[KeyScheme] {
        &self.schemes
    }

    /// Reject schemes this instance was not configured for.
    pub fn require(&self, scheme: KeyScheme) -> Result<KeyScheme, SoftHsmError> {
        if self.schemes.contains(&scheme) {
            Ok(scheme)
        } else {
            Err(SoftHsmError::BadRequest(format!(
                "unsupported key scheme '{}'",
                scheme.code_name()
            )))
        }
    }

    pub fn supported_signature_specs(&self) -> BTreeMap<KeyScheme, Vec<SignatureSpec>> {
        self.schemes
            .iter()
            .map(|s| (*s, s.signature_specs().to_vec()))
            .collect()
    }
}

/// Full and short fingerprints of an encoded public key.
pub fn key_ids(public_key: &[u8]) -> (String, String) {
    let full = hex::encode(crypto::sha256(public_key));
    let short = full[..SHORT_KEY_ID_LEN].to_string();
    (short, full)
}

/// Generate a key pair for `scheme`.
pub fn generate_key_pair(scheme: KeyScheme) -> Result<GeneratedKeyPair, SoftHsmError> {
    let rng = SystemRandom::new();
    let (public_key, private_key) = match scheme {
        KeyScheme::EcdsaP256 | KeyScheme::EcdsaP384 => {
            let alg = ecdsa_alg_for(scheme)?;
            let pkcs8 = EcdsaKeyPair::generate_pkcs8(alg, &rng)
                .map_err(|_| SoftHsmError::RandomnessFailure)?;
            let pair = EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &rng)
                .map_err(|_| SoftHsmError::InvalidKey)?;
            (
                pair.public_key().as_ref().to_vec(),
                Zeroizing::new(pkcs8.as_ref().to_vec()),
            )
        }
        KeyScheme::Ed25519 => {
            let pkcs8 =
                Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| SoftHsmError::RandomnessFailure)?;
            let pair =
                Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| SoftHsmError::InvalidKey)?;
            (
                pair.public_key().as_ref().to_vec(),
                Zeroizing::new(pkcs8.as_ref().to_vec()),
            )
        }
        KeyScheme::X25519 => {
            let mut scalar = Zeroizing::new([0u8; 32]);
            crypto::fill_random(&mut scalar[..])?;
            let secret = x25519_dalek::StaticSecret::from(*scalar);
            let public = x25519_dalek::PublicKey::from(&secret);
            (public.as_bytes().to_vec(), Zeroizing::new(scalar.to_vec()))
        }
    };
    Ok(GeneratedKeyPair {
        scheme,
        public_key,
        private_key,
    })
}

fn ecdsa_alg_for(scheme: KeyScheme) -> Result<&'static EcdsaSigningAlgorithm, SoftHsmError> {
    match scheme {
        KeyScheme::EcdsaP256 => Ok(&signature::ECDSA_P256_SHA256_ASN1_SIGNING),
        KeyScheme::EcdsaP384 => Ok(&signature::ECDSA_P384_SHA384_ASN1_SIGNING),
        other => Err(SoftHsmError::BadRequest(format!(
            "{} is not an ECDSA scheme",
            other.code_name()
        ))),
    }
}

/// Sign `data` with an unwrapped private key.
pub fn sign(
    scheme: KeyScheme,
    spec: SignatureSpec,
    private_key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, SoftHsmError> {
    if !scheme.signature_specs().contains(&spec) {
        return Err(SoftHsmError::BadRequest(format!(
            "signature spec '{}' is not supported by {}",
            spec.signature_name(),
            scheme.code_name()
        )));
    }
    let rng = SystemRandom::new();
    match spec.ecdsa_signing() {
        Some(alg) => {
            let pair = EcdsaKeyPair::from_pkcs8(alg, private_key, &rng)
                .map_err(|e| SoftHsmError::SigningFailure(e.to_string()))?;
            let sig = pair
                .sign(&rng, data)
                .map_err(|_| SoftHsmError::SigningFailure("ecdsa".into()))?;
            Ok(sig.as_ref().to_vec())
        }
        None => {
            let pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(private_key)
                .map_err(|e| SoftHsmError::SigningFailure(e.to_string()))?;
            Ok(pair.sign(data).as_ref().to_vec())
        }
    }
}

/// Verify a signature produced by [`sign`].
pub fn verify(spec: SignatureSpec, public_key: &[u8], data: &[u8], sig: &[u8]) -> bool {
    signature::UnparsedPublicKey::new(spec.verification(), public_key)
        .verify(data, sig)
        .is_ok()
}

/// X25519 agreement between an unwrapped private scalar and a peer public key.
pub fn derive_shared_secret(
    private_key: &[u8],
    other_public_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, SoftHsmError> {
    let scalar: [u8; 32] = private_key
        .try_into()
        .map_err(|_| SoftHsmError::InvalidKey)?;
    let peer: [u8; 32] = other_public_key.try_into().map_err(|_| {
        SoftHsmError::BadRequest("other public key is not an X25519 key".into())
    })?;
    let secret = x25519_dalek::StaticSecret::from(scalar);
    let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
    Ok(Zeroizing::new(shared.as_bytes().to_vec()))
}
