//! Tagged outcomes delivered across the session-to-consumer boundary.

use crate::transport::TransportError;
use crate::verify::VerificationError;

/// Why a button operation or connection attempt did not succeed.
/// Delivered inside notifications; never raised as a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ButtonError {
    /// Link-level failure. Retry by calling `connect` again.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// The device failed cryptographic verification. Not retried.
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),
    /// The pairing is no longer valid; remove the button and pair it again.
    #[error("button is unpaired")]
    Unpaired,
    /// The button was removed from the registry.
    #[error("button no longer exists")]
    NotFound,
}

impl ButtonError {
    /// Whether calling `connect` again can succeed without re-pairing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ButtonError::Transport(_))
    }
}
