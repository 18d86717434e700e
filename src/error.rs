//! Engine error taxonomy.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Lifecycle state of a training engine.
///
/// `Uninitialized → Ready → (PhiFresh ⇄ ZFresh) → TornDown`, with `Failed`
/// reachable from any live state on a fatal error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EngineState {
    Uninitialized,
    Ready,
    PhiFresh,
    ZFresh,
    Failed,
    TornDown,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::PhiFresh => "phi-fresh",
            Self::ZFresh => "z-fresh",
            Self::Failed => "failed",
            Self::TornDown => "torn-down",
        }
    }

    /// States holding device allocations.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::PhiFresh | Self::ZFresh)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{operation} is not allowed while the engine is {state}")]
    StateViolation {
        operation: &'static str,
        state: EngineState,
    },

    #[error(
        "out of device memory allocating {resource}: requested {requested} bytes, {available} available"
    )]
    OutOfDeviceMemory {
        resource: &'static str,
        requested: usize,
        available: usize,
    },

    #[error("device fault in kernel {kernel}: {message}")]
    DeviceFault {
        kernel: &'static str,
        message: String,
    },

    #[error("transfer of {len} elements does not fit {resource} (capacity {capacity})")]
    TransferOutOfBounds {
        resource: &'static str,
        len: usize,
        capacity: usize,
    },

    #[error("buffer {0} has no device mirror in this engine")]
    UnknownBuffer(String),

    #[error("invalid engine arguments: {0}")]
    InvalidArgs(String),

    #[error("failed to start device executor: {0}")]
    Executor(String),
}

impl EngineError {
    /// Fatal errors leave the engine unusable until `cleanup`.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::StateViolation { .. } | Self::UnknownBuffer(_)
        )
    }
}
