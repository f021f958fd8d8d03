//! Error types and the fixed status taxonomy.
//!
//! Internally every fallible operation returns [`RnntResult`], carrying an
//! [`RnntError`] with enough detail to debug a malformed call. At the C
//! boundary (and for callers that want the coarse view) errors collapse into
//! [`RnntStatus`], whose discriminants are part of the ABI.
//!
//! # Example
//!
//! ```rust
//! use warprnnt::{RnntError, RnntStatus};
//!
//! let err = RnntError::invalid_length("input_lengths", 0, 12, 10);
//! assert_eq!(RnntStatus::from(&err), RnntStatus::InvalidValue);
//! assert!(err.to_string().contains("12"));
//! ```

use std::borrow::Cow;
use std::ffi::CStr;

use thiserror::Error;

use crate::config::ConfigError;

/// Unified error type for loss computation on every backend.
///
/// GPU-specific variants are only available when the `gpu` feature is enabled.
#[derive(Error, Debug)]
pub enum RnntError {
    /// A per-example length exceeds the configured maximum (or is zero where
    /// a positive length is required).
    #[error("{what}[{example}] = {got} is outside the valid range 1..={max}")]
    InvalidLength {
        /// Which length array the value came from.
        what: &'static str,
        /// Example index inside the minibatch.
        example: usize,
        /// Offending value.
        got: i64,
        /// Largest accepted value.
        max: usize,
    },

    /// A problem dimension (alphabet size, minibatch, maxT, maxU) is invalid.
    #[error("Invalid dimension: {0}")]
    InvalidDimension(Cow<'static, str>),

    /// A label is out of range or equals the blank index.
    #[error("Label {label} at position {position} of example {example} is invalid for alphabet size {alphabet_size} with blank {blank}")]
    InvalidLabel {
        /// Example index inside the minibatch.
        example: usize,
        /// Position inside the example's label sequence.
        position: usize,
        /// Offending label value.
        label: i64,
        /// Alphabet size of the call.
        alphabet_size: usize,
        /// Blank index of the call.
        blank: usize,
    },

    /// The supplied workspace is smaller than [`workspace_size`](crate::workspace_size) requires.
    #[error("Workspace too small: need {required} bytes, got {got}")]
    WorkspaceTooSmall {
        /// Required size in bytes.
        required: usize,
        /// Supplied size in bytes.
        got: usize,
    },

    /// The workspace pointer is not aligned for `f32` access.
    #[error("Workspace is not 4-byte aligned")]
    MisalignedWorkspace,

    /// A tensor does not have the number of elements implied by the problem.
    #[error("Shape mismatch for {what}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        /// Tensor name.
        what: &'static str,
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        got: usize,
    },

    /// A required output buffer was not supplied.
    #[error("Missing output buffer: {0}")]
    MissingOutput(&'static str),

    /// Integer overflow in size calculations.
    #[error("Integer overflow: {0}")]
    Overflow(String),

    /// The host allocator could not provide a workspace.
    #[error("Failed to allocate {bytes} bytes of workspace")]
    AllocationFailed {
        /// Requested size in bytes.
        bytes: usize,
    },

    /// Options failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The CPU worker pool could not be created.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The requested backend is not compiled into this build.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// GPU device error captured while enqueueing work.
    #[cfg(feature = "gpu")]
    #[error("GPU device error: {0}")]
    Device(#[from] wgpu::Error),

    /// GPU device request failed.
    #[cfg(feature = "gpu")]
    #[error("Failed to create GPU device: {0}")]
    DeviceRequestFailed(#[from] wgpu::RequestDeviceError),

    /// GPU adapter request failed.
    #[cfg(feature = "gpu")]
    #[error("Failed to find suitable GPU adapter: {0}")]
    AdapterNotFound(String),

    /// GPU buffer async operation failed.
    #[cfg(feature = "gpu")]
    #[error("Buffer async error: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),

    /// Buffer allocation or transfer failed.
    #[cfg(feature = "gpu")]
    #[error("Buffer operation failed: {0}")]
    BufferError(String),

    /// The adapter or device does not meet a required limit.
    #[cfg(feature = "gpu")]
    #[error("Unsupported device limits: {0}")]
    UnsupportedLimits(String),
}

/// Result type alias for loss operations.
pub type RnntResult<T> = Result<T, RnntError>;

impl RnntError {
    /// Creates an invalid length error.
    pub fn invalid_length(what: &'static str, example: usize, got: i64, max: usize) -> Self {
        RnntError::InvalidLength {
            what,
            example,
            got,
            max,
        }
    }

    /// Creates an invalid dimension error.
    pub fn invalid_dimension<S: Into<Cow<'static, str>>>(msg: S) -> Self {
        RnntError::InvalidDimension(msg.into())
    }

    /// Creates a shape mismatch error.
    pub fn shape_mismatch(what: &'static str, expected: usize, got: usize) -> Self {
        RnntError::ShapeMismatch {
            what,
            expected,
            got,
        }
    }

    /// Creates a workspace too small error.
    pub fn workspace_too_small(required: usize, got: usize) -> Self {
        RnntError::WorkspaceTooSmall { required, got }
    }

    /// Creates an overflow error.
    pub fn overflow<S: Into<String>>(msg: S) -> Self {
        RnntError::Overflow(msg.into())
    }

    /// Creates a GPU buffer error.
    #[cfg(feature = "gpu")]
    pub fn buffer<S: Into<String>>(msg: S) -> Self {
        RnntError::BufferError(msg.into())
    }

    /// Creates an adapter not found error.
    #[cfg(feature = "gpu")]
    pub fn adapter_not_found<S: Into<String>>(msg: S) -> Self {
        RnntError::AdapterNotFound(msg.into())
    }

    /// Creates an unsupported limits error.
    #[cfg(feature = "gpu")]
    pub fn unsupported_limits<S: Into<String>>(msg: S) -> Self {
        RnntError::UnsupportedLimits(msg.into())
    }

    /// Returns the coarse status code for this error.
    pub fn status(&self) -> RnntStatus {
        RnntStatus::from(self)
    }
}

/// Status codes of the C interface.
///
/// The discriminants are fixed and must never change.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RnntStatus {
    /// The call completed (or, on GPU, was enqueued) successfully.
    Success = 0,
    /// Allocation or host/device memory transfer failed.
    MemopsFailed = 1,
    /// The call was malformed.
    InvalidValue = 2,
    /// A backend compute failure.
    ExecutionFailed = 3,
    /// Anything else.
    UnknownError = 4,
}

impl RnntStatus {
    /// Human readable description, matching the C `rnntGetStatusString`.
    pub fn as_str(self) -> &'static str {
        self.as_c_str()
            .to_str()
            .unwrap_or("unknown error")
    }

    /// NUL-terminated description with static lifetime.
    pub fn as_c_str(self) -> &'static CStr {
        match self {
            RnntStatus::Success => c"no error",
            RnntStatus::MemopsFailed => c"memory operation failed",
            RnntStatus::InvalidValue => c"invalid value",
            RnntStatus::ExecutionFailed => c"execution failed",
            RnntStatus::UnknownError => c"unknown error",
        }
    }

    /// Converts a raw status value; unknown values map to [`RnntStatus::UnknownError`].
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => RnntStatus::Success,
            1 => RnntStatus::MemopsFailed,
            2 => RnntStatus::InvalidValue,
            3 => RnntStatus::ExecutionFailed,
            _ => RnntStatus::UnknownError,
        }
    }
}

impl std::fmt::Display for RnntStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&RnntError> for RnntStatus {
    fn from(err: &RnntError) -> Self {
        match err {
            RnntError::InvalidLength { .. }
            | RnntError::InvalidDimension(_)
            | RnntError::InvalidLabel { .. }
            | RnntError::WorkspaceTooSmall { .. }
            | RnntError::MisalignedWorkspace
            | RnntError::ShapeMismatch { .. }
            | RnntError::MissingOutput(_)
            | RnntError::Overflow(_)
            | RnntError::Config(_)
            | RnntError::Unsupported(_) => RnntStatus::InvalidValue,
            RnntError::AllocationFailed { .. } => RnntStatus::MemopsFailed,
            RnntError::ThreadPool(_) => RnntStatus::ExecutionFailed,
            #[cfg(feature = "gpu")]
            RnntError::Device(wgpu::Error::OutOfMemory { .. }) => RnntStatus::MemopsFailed,
            #[cfg(feature = "gpu")]
            RnntError::Device(_) => RnntStatus::ExecutionFailed,
            #[cfg(feature = "gpu")]
            RnntError::BufferAsync(_) | RnntError::BufferError(_) => RnntStatus::MemopsFailed,
            #[cfg(feature = "gpu")]
            RnntError::DeviceRequestFailed(_)
            | RnntError::AdapterNotFound(_)
            | RnntError::UnsupportedLimits(_) => RnntStatus::ExecutionFailed,
        }
    }
}

impl From<RnntError> for RnntStatus {
    fn from(err: RnntError) -> Self {
        RnntStatus::from(&err)
    }
}

impl<T> From<&RnntResult<T>> for RnntStatus {
    fn from(result: &RnntResult<T>) -> Self {
        match result {
            Ok(_) => RnntStatus::Success,
            Err(err) => RnntStatus::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_discriminants() {
        assert_eq!(RnntStatus::Success as i32, 0);
        assert_eq!(RnntStatus::MemopsFailed as i32, 1);
        assert_eq!(RnntStatus::InvalidValue as i32, 2);
        assert_eq!(RnntStatus::ExecutionFailed as i32, 3);
        assert_eq!(RnntStatus::UnknownError as i32, 4);
    }

    #[test]
    fn test_status_from_raw() {
        for raw in 0..5 {
            assert_eq!(RnntStatus::from_raw(raw) as i32, raw);
        }
        assert_eq!(RnntStatus::from_raw(42), RnntStatus::UnknownError);
        assert_eq!(RnntStatus::from_raw(-1), RnntStatus::UnknownError);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(RnntStatus::Success.as_str(), "no error");
        assert_eq!(RnntStatus::InvalidValue.as_str(), "invalid value");
        assert_eq!(RnntStatus::ExecutionFailed.to_string(), "execution failed");
    }

    #[test]
    fn test_validation_errors_are_invalid_value() {
        let errors = [
            RnntError::invalid_length("input_lengths", 1, 9, 8),
            RnntError::invalid_dimension("alphabet_size must be > 0"),
            RnntError::workspace_too_small(1024, 16),
            RnntError::shape_mismatch("trans_acts", 12, 11),
            RnntError::MissingOutput("costs"),
            RnntError::MisalignedWorkspace,
        ];
        for err in &errors {
            assert_eq!(RnntStatus::from(err), RnntStatus::InvalidValue, "{err}");
        }
    }

    #[test]
    fn test_allocation_failure_is_memops() {
        let err = RnntError::AllocationFailed { bytes: 1 << 20 };
        assert_eq!(err.status(), RnntStatus::MemopsFailed);
    }

    #[test]
    fn test_result_status() {
        let ok: RnntResult<()> = Ok(());
        assert_eq!(RnntStatus::from(&ok), RnntStatus::Success);
        let err: RnntResult<()> = Err(RnntError::overflow("maxT * maxU"));
        assert_eq!(RnntStatus::from(&err), RnntStatus::InvalidValue);
    }

    #[test]
    fn test_shape_mismatch_message() {
        let msg = RnntError::shape_mismatch("pred_acts", 30, 29).to_string();
        assert!(msg.contains("pred_acts"));
        assert!(msg.contains("30"));
        assert!(msg.contains("29"));
    }
}
