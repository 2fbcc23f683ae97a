//! Error taxonomy for the speculative decoding core.
//!
//! Mirrors the recovery policy in the specification: `InvalidConfig` is
//! rejected synchronously before any resource is acquired, `OutOfBlocks`
//! aborts only the request that hit it, and `ModelFailure`/`TokenOutOfRange`
//! both terminate the generation loop after its cache lanes are released.

use thiserror::Error;

use crate::block::pool::AllocatorError;

/// Errors surfaced by the core to its caller.
///
/// The core never swallows or retries an error — it is always surfaced,
/// either as `Err` from [`crate::generation::GenerationLoop::generate`] or
/// as the `cause` of a streaming `Final::Failed` event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Rejected before any cache lane or block was acquired.
    #[error("invalid generation config: {0}")]
    InvalidConfig(String),

    /// The block allocator ran out of free blocks, either opening a lane
    /// or mid-generation while ingesting new KV material.
    #[error("capacity exhausted: {0}")]
    OutOfBlocks(#[from] AllocatorError),

    /// The underlying model raised during a forward call.
    #[error("model failure: {0}")]
    ModelFailure(String),

    /// A model returned a token id that is not less than the vocabulary size.
    #[error("token {token} out of range for vocabulary size {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: u32 },
}

impl CoreError {
    /// User-visible `(kind, message)` shape for the blocking contract (§7).
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidConfig(_) => "InvalidConfig",
            CoreError::OutOfBlocks(_) => "CapacityExhausted",
            CoreError::ModelFailure(_) => "GenerationFailed",
            CoreError::TokenOutOfRange { .. } => "GenerationFailed",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
