//! Call options: backend selection, blank index and lattice maxima.
//!
//! This module provides [`RnntOptions`], the Rust form of the C
//! `rnntOptions` struct. The C struct stores the CPU thread budget and the
//! GPU stream in one union keyed by the location field; here that is the
//! tagged [`ComputeLocation`].
//!
//! # Example
//!
//! ```rust
//! use warprnnt::{ComputeLocation, RnntOptions};
//!
//! let options = RnntOptions {
//!     location: ComputeLocation::Cpu { num_threads: 4 },
//!     blank_label: 0,
//!     max_t: 50,
//!     max_u: 11, // longest label sequence is 10
//! };
//! assert!(options.validate(29).is_ok());
//! ```
//!
//! # Lattice maxima
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `max_t` | Rows of the transcription tensor, upper bound of every input length |
//! | `max_u` | Rows of the prediction tensor, upper bound of every `label_length + 1` |

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "gpu")]
use crate::gpu::GpuStream;

/// Default CPU thread budget.
pub const DEFAULT_NUM_THREADS: usize = 1;

/// Backend selector with the fixed C discriminants.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Backend {
    /// Multi-threaded host execution.
    #[default]
    Cpu = 0,
    /// wgpu compute execution.
    Gpu = 1,
}

impl Backend {
    /// Converts the raw C value.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Backend::Cpu),
            1 => Some(Backend::Gpu),
            _ => None,
        }
    }

    /// Returns true for [`Backend::Gpu`].
    #[inline]
    pub fn is_gpu(self) -> bool {
        self == Backend::Gpu
    }
}

/// Where the loss is computed, with the backend-specific payload.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ComputeLocation {
    /// Run on a bounded rayon pool of `num_threads` workers.
    Cpu {
        /// Maximum number of worker threads (must be at least 1).
        num_threads: usize,
    },
    /// Enqueue work on the given device queue.
    #[cfg(feature = "gpu")]
    #[cfg_attr(feature = "serde", serde(skip))]
    Gpu(GpuStream),
}

impl ComputeLocation {
    /// Returns the backend selector for this location.
    pub fn backend(&self) -> Backend {
        match self {
            ComputeLocation::Cpu { .. } => Backend::Cpu,
            #[cfg(feature = "gpu")]
            ComputeLocation::Gpu(_) => Backend::Gpu,
        }
    }
}

impl Default for ComputeLocation {
    fn default() -> Self {
        ComputeLocation::Cpu {
            num_threads: DEFAULT_NUM_THREADS,
        }
    }
}

/// Options for one loss computation.
///
/// Zero-sized maxima are rejected by [`validate`](Self::validate); there is
/// no sensible default for them, so `Default` leaves them at zero and callers
/// are expected to fill them in.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RnntOptions {
    /// Backend and its payload.
    pub location: ComputeLocation,
    /// Index of the blank symbol.
    pub blank_label: usize,
    /// Maximum input length (rows of the transcription tensor).
    pub max_t: usize,
    /// Maximum label length plus one (rows of the prediction tensor).
    pub max_u: usize,
}

impl RnntOptions {
    /// Creates CPU options.
    pub fn cpu(max_t: usize, max_u: usize, num_threads: usize) -> Self {
        Self {
            location: ComputeLocation::Cpu { num_threads },
            blank_label: 0,
            max_t,
            max_u,
        }
    }

    /// Creates GPU options bound to `stream`.
    #[cfg(feature = "gpu")]
    pub fn gpu(max_t: usize, max_u: usize, stream: GpuStream) -> Self {
        Self {
            location: ComputeLocation::Gpu(stream),
            blank_label: 0,
            max_t,
            max_u,
        }
    }

    /// Sets the blank index.
    pub fn with_blank(mut self, blank_label: usize) -> Self {
        self.blank_label = blank_label;
        self
    }

    /// Returns the backend selector.
    #[inline]
    pub fn backend(&self) -> Backend {
        self.location.backend()
    }

    /// Validates the options against the call's alphabet size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `max_t` or `max_u` is zero
    /// - the CPU thread budget is zero
    /// - `blank_label >= alphabet_size`
    pub fn validate(&self, alphabet_size: usize) -> Result<(), ConfigError> {
        if self.max_t == 0 {
            return Err(ConfigError::InvalidDimension("max_t must be > 0"));
        }
        if self.max_u == 0 {
            return Err(ConfigError::InvalidDimension("max_u must be > 0"));
        }
        if let ComputeLocation::Cpu { num_threads: 0 } = self.location {
            return Err(ConfigError::ZeroThreads);
        }
        if self.blank_label >= alphabet_size {
            return Err(ConfigError::BlankOutOfRange {
                blank: self.blank_label,
                alphabet_size,
            });
        }
        Ok(())
    }
}

/// Errors returned by [`RnntOptions::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A lattice maximum is zero.
    #[error("Invalid dimension: {0}")]
    InvalidDimension(&'static str),

    /// CPU execution was requested with no threads.
    #[error("CPU thread budget must be at least 1")]
    ZeroThreads,

    /// Blank index does not address a symbol of the alphabet.
    #[error("Blank label {blank} out of range for alphabet size {alphabet_size}")]
    BlankOutOfRange {
        /// Requested blank index.
        blank: usize,
        /// Alphabet size of the call.
        alphabet_size: usize,
    },
}
