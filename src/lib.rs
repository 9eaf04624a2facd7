//! # softhsm
//!
//! A software-emulated hardware security module.
//!
//! Signing keys are generated and used on behalf of many isolated tenants.
//! Private key material at rest is always wrapped (AES-256-GCM) by a
//! wrapping key, which is itself wrapped by its parent, up to a root held
//! in configuration. Rotating a wrapping key migrates signing-key material
//! additively: new copies are inserted, old ones are kept.
//!
//! ## Layering
//!
//! ```text
//! caller
//!   -> RetryTimeoutDecorator   bounded attempts, per-attempt timeout
//!   -> ThrottlingDecorator     back-off on throttling signals
//!   -> SoftCryptoService       key custody
//!   -> repositories            catalog rows
//! ```
//!
//! [`build_default_service`] assembles that stack.

pub mod cache;
pub mod chain;
pub mod config;
pub(crate) mod crypto;
pub mod entities;
pub mod error;
pub mod hsm_config;
pub mod repository;
pub mod retry;
mod rewrap;
pub mod schemes;
pub mod service;
pub mod throttling;
pub mod wrapping;

pub use config::SoftHsmConfig;
pub use error::SoftHsmError;
pub use service::{CryptoService, Repositories, SoftCryptoService};
pub use wrapping::WrappingKey;

use retry::RetryTimeoutDecorator;
use throttling::ThrottlingDecorator;

/// The service stack callers normally talk to.
pub type DefaultCryptoService = RetryTimeoutDecorator<ThrottlingDecorator<SoftCryptoService>>;

/// Validate `config` and wrap a [`SoftCryptoService`] in the throttling and
/// retry decorators.
pub fn build_default_service(
    config: &SoftHsmConfig,
    repositories: Repositories,
) -> Result<DefaultCryptoService, SoftHsmError> {
    config.validate()?;
    let soft = SoftCryptoService::new(config, repositories);
    let throttling =
        ThrottlingDecorator::new(soft).with_max_total_delay(config.retry.attempt_timeout());
    Ok(RetryTimeoutDecorator::new(throttling, &config.retry))
}

/// Generate a fresh random wrapping key.
pub fn generate_wrapping_key() -> Result<WrappingKey, SoftHsmError> {
    WrappingKey::generate()
}
