//! Error types for softhsm.
//!
//! Every error variant is a distinct failure mode of the key-custody engine.
//! Messages name the operation and the offending identifier (tenant, alias,
//! wrapping key id) and never carry key bytes.
//!
//! Retry decisions are made from [`SoftHsmError::recoverability`], not from
//! matching on variants at every call site.

use std::time::Duration;

/// Whether retrying the failed call could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverability {
    /// A later attempt may succeed (I/O hiccup, timeout, throttling).
    Recoverable,
    /// Retrying cannot change the outcome.
    NonRecoverable,
}

/// How long to back off after the n-th throttled attempt.
///
/// The strategy travels inside the [`ThrottleSignal`], so whoever raises the
/// signal decides the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base * growth_factor^(attempt - 1)` for up to `max_attempts` attempts.
    Exponential {
        base: Duration,
        growth_factor: u32,
        max_attempts: u32,
    },
    /// Explicit delays. Attempts past the end of `delays` reuse the last one.
    Linear {
        max_attempts: u32,
        delays: Vec<Duration>,
    },
    /// Give up immediately.
    NoBackoff,
}

impl BackoffStrategy {
    /// Delay before retrying after the given 1-based attempt, or `None` once
    /// the budget is spent.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return None;
        }
        match self {
            Self::Exponential {
                base,
                growth_factor,
                max_attempts,
            } => {
                if attempt > *max_attempts {
                    return None;
                }
                let factor = growth_factor.saturating_pow(attempt - 1);
                Some(base.saturating_mul(factor))
            }
            Self::Linear {
                max_attempts,
                delays,
            } => {
                if attempt > *max_attempts || delays.is_empty() {
                    return None;
                }
                let idx = (attempt as usize - 1).min(delays.len() - 1);
                Some(delays[idx])
            }
            Self::NoBackoff => None,
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(1000),
            growth_factor: 2,
            max_attempts: 6,
        }
    }
}

/// Raised by an underlying service that wants its caller to slow down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSignal {
    pub message: String,
    pub strategy: BackoffStrategy,
}

impl ThrottleSignal {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            strategy: BackoffStrategy::default(),
        }
    }

    pub fn with_strategy(message: impl Into<String>, strategy: BackoffStrategy) -> Self {
        Self {
            message: message.into(),
            strategy,
        }
    }
}

/// The single error type for all softhsm operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SoftHsmError {
    /// The request was malformed or asked for something unsupported.
    /// Rejected before any I/O.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A tenant, association, signing key or alias does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition on stored state failed, e.g. a missing wrapping key or
    /// a broken parent chain.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// AEAD authentication failed: wrong wrapping key or altered ciphertext.
    #[error("authentication failed while unwrapping key material")]
    Authentication,

    /// A cryptographic key was invalid (wrong length, malformed, etc.).
    #[error("invalid key")]
    InvalidKey,

    /// Encryption failed. The underlying `ring` operation returned an error.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Producing a signature failed after the private key was recovered.
    #[error("signing failed: {0}")]
    SigningFailure(String),

    /// The underlying service asked the caller to back off.
    #[error("throttled: {}", .0.message)]
    Throttled(ThrottleSignal),

    /// An infrastructure hiccup that may go away on retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A single attempt exceeded its time budget.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// Throttling could not be resolved within the backoff budget.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Uniform error surfaced by the decorator chain for anything that is
    /// not one of the caller-visible categories.
    #[error("calling {operation} failed ({arguments}): {reason}")]
    CryptoService {
        operation: String,
        arguments: serde_json::Value,
        reason: String,
    },

    /// The configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SoftHsmError {
    /// Classify this error for the retry and throttling decorators.
    pub fn recoverability(&self) -> Recoverability {
        match self {
            Self::Transient(_) | Self::Timeout { .. } | Self::Throttled(_) => {
                Recoverability::Recoverable
            }
            _ => Recoverability::NonRecoverable,
        }
    }

    /// `false` for the categories callers see unchanged (bad request, not
    /// found, state and authentication errors); everything else is folded
    /// into [`SoftHsmError::CryptoService`] by the retry decorator.
    pub fn is_translatable(&self) -> bool {
        !matches!(
            self,
            Self::BadRequest(_)
                | Self::NotFound(_)
                | Self::IllegalState(_)
                | Self::Authentication
                | Self::CryptoService { .. }
        )
    }
}
