//! Error taxonomy shared by graphs, requests and operators.

use std::sync::Arc;

use strum::{AsRefStr, IntoStaticStr};
use thiserror::Error;

use crate::meta::DType;
use crate::roi::Roi;

/// Type alias for Results with the lazyflow error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categories of errors.
///
/// Configuration errors are raised synchronously at the point of misuse and
/// never affect the rest of the graph. Execution errors travel up exactly one
/// request tree. Cancellation is a terminal state, not a failure, but is
/// reported through the same type so `?` keeps working inside operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Misuse of the graph API.
    Configuration,
    /// An operator failed while computing a region.
    Execution,
    /// The request was canceled.
    Canceled,
    /// Memory could not be provided.
    Allocation,
    /// The graph no longer accepts work.
    Shutdown,
    /// Snapshot encoding or decoding failed.
    Serialization,
    /// Broken internal invariant.
    Internal,
}

/// Errors produced by lazyflow.
///
/// The type is `Clone` so that one failure can be handed to every
/// subscriber of a request.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Region of interest is malformed.
    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),

    /// Region of interest does not fit into the slot.
    #[error("region {roi} exceeds shape {shape:?}")]
    RoiOutOfBounds {
        /// Requested region.
        roi: Roi,
        /// Shape of the slot.
        shape: Vec<usize>,
    },

    /// Two slots of one operator share a name.
    #[error("duplicate slot `{slot}` on operator `{operator}`")]
    DuplicateSlot {
        /// Operator name.
        operator: String,
        /// Offending slot name.
        slot: String,
    },

    /// Slot name lookup failed.
    #[error("operator `{operator}` has no slot `{slot}`")]
    UnknownSlot {
        /// Operator name.
        operator: String,
        /// Requested slot name.
        slot: String,
    },

    /// Slot has neither a partner nor a value, or its metadata is incomplete.
    #[error("slot `{0}` is not ready")]
    SlotNotReady(String),

    /// Slot carries a literal value and cannot be connected.
    #[error("slot `{0}` holds a literal value; disconnect it first")]
    SlotHasValue(String),

    /// Slot is connected and cannot take a literal value.
    #[error("slot `{0}` is connected to a partner")]
    SlotConnected(String),

    /// Only level-0 slots deliver data.
    #[error("slot `{slot}` has level {level}; only level-0 slots can be requested")]
    SlotLevel {
        /// Slot name.
        slot: String,
        /// Nesting level of the slot.
        level: usize,
    },

    /// Sub-slot index is out of range.
    #[error("slot `{slot}` has {len} sub-slots, index {index} is out of range")]
    SubSlotIndex {
        /// Slot name.
        slot: String,
        /// Requested index.
        index: usize,
        /// Number of sub-slots.
        len: usize,
    },

    /// Array shapes disagree.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Shape required by the receiver.
        expected: Vec<usize>,
        /// Shape that was provided.
        found: Vec<usize>,
    },

    /// Element types disagree.
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DTypeMismatch {
        /// Element type required by the receiver.
        expected: DType,
        /// Element type that was provided.
        found: DType,
    },

    /// Configuration values were rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operator failure, annotated with the operator and the region.
    #[error("operator `{operator}` failed on {roi}: {source}")]
    Execution {
        /// Name of the failing operator.
        operator: String,
        /// Region that was being computed.
        roi: Roi,
        /// Underlying failure.
        #[source]
        source: Arc<Error>,
    },

    /// Failure raised by operator code.
    #[error("{0}")]
    Operator(String),

    /// The request was canceled.
    #[error("request canceled")]
    Canceled,

    /// Memory could not be provided.
    #[error("allocation of {requested} bytes failed")]
    Allocation {
        /// Number of bytes requested.
        requested: u64,
    },

    /// The graph has been finalized.
    #[error("graph has been finalized")]
    Shutdown,

    /// Snapshot encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates an operator failure with the given message.
    pub fn operator(message: impl Into<String>) -> Self {
        Self::Operator(message.into())
    }

    /// Wraps `self` as the failure of `operator` on `roi`.
    ///
    /// Cancellation and already-annotated failures pass through unchanged so
    /// a failure deep in a tree keeps the operator that actually raised it.
    pub fn in_operator(self, operator: impl Into<String>, roi: &Roi) -> Self {
        match self {
            Self::Canceled | Self::Execution { .. } | Self::Shutdown => self,
            other => Self::Execution {
                operator: operator.into(),
                roi: roi.clone(),
                source: Arc::new(other),
            },
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRoi(_)
            | Self::RoiOutOfBounds { .. }
            | Self::DuplicateSlot { .. }
            | Self::UnknownSlot { .. }
            | Self::SlotNotReady(_)
            | Self::SlotHasValue(_)
            | Self::SlotConnected(_)
            | Self::SlotLevel { .. }
            | Self::SubSlotIndex { .. }
            | Self::ShapeMismatch { .. }
            | Self::DTypeMismatch { .. }
            | Self::InvalidConfig(_) => ErrorKind::Configuration,
            Self::Execution { .. } | Self::Operator(_) => ErrorKind::Execution,
            Self::Canceled => ErrorKind::Canceled,
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error kind as a string.
    pub fn kind_str(&self) -> &'static str {
        self.kind().into()
    }

    /// Returns true for cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns true for configuration errors.
    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
