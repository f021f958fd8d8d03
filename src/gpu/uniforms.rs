//! Uniform buffer layout shared by every RNNT kernel.
//!
//! All fields are `u32`, so the std140 rules reduce to rounding the struct
//! up to a multiple of 16 bytes.

use bytemuck::{Pod, Zeroable};

use crate::error::{RnntError, RnntResult};
use crate::workspace::WorkspaceLayout;

/// Kernel parameters for one call.
///
/// # Layout
///
/// Total size: 48 bytes (3 × vec4).
///
/// ```text
/// Offset  Size  Field
/// 0       4     minibatch
/// 4       4     alphabet_size
/// 8       4     blank
/// 12      4     max_t
/// 16      4     max_u
/// 20      4     lattice
/// 24      4     labels_offset
/// 28      4     tables_offset
/// 32      4     example_stride
/// 36      4     diagonals
/// 40      4     pos_inf_bits
/// 44      4     _pad
/// ```
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RnntUniforms {
    pub minibatch: u32,
    pub alphabet_size: u32,
    pub blank: u32,
    pub max_t: u32,
    pub max_u: u32,
    /// `max_t * max_u`, the word capacity of one lattice table.
    pub lattice: u32,
    /// Word offset of the label arena in the workspace.
    pub labels_offset: u32,
    /// Word offset of the first example's tables in the workspace.
    pub tables_offset: u32,
    /// Words between consecutive examples' tables.
    pub example_stride: u32,
    /// Number of anti-diagonals, `max_t + max_u - 1`.
    pub diagonals: u32,
    /// Bit pattern of `+inf`, read at run time so no shader constant is infinite.
    pub pos_inf_bits: u32,
    pub _pad: u32,
}

impl RnntUniforms {
    /// Builds the parameters for `layout` with blank index `blank`.
    ///
    /// # Errors
    ///
    /// [`RnntError::Overflow`] if any offset does not fit in 32 bits.
    pub fn new(layout: &WorkspaceLayout, blank: usize) -> RnntResult<Self> {
        // every workspace word must be addressable by a u32 index
        to_u32("workspace words", layout.gpu_words()?)?;
        Ok(Self {
            minibatch: to_u32("minibatch", layout.minibatch)?,
            alphabet_size: to_u32("alphabet_size", layout.alphabet_size)?,
            blank: to_u32("blank", blank)?,
            max_t: to_u32("max_t", layout.max_t)?,
            max_u: to_u32("max_u", layout.max_u)?,
            lattice: to_u32("lattice", layout.lattice_len())?,
            labels_offset: to_u32("labels_offset", layout.gpu_labels_offset()?)?,
            tables_offset: to_u32("tables_offset", layout.gpu_tables_offset()?)?,
            example_stride: to_u32("example_stride", layout.gpu_example_words()?)?,
            diagonals: to_u32("diagonals", layout.max_t + layout.max_u - 1)?,
            pos_inf_bits: f32::INFINITY.to_bits(),
            _pad: 0,
        })
    }

    /// Returns the size of this struct in bytes.
    pub const fn size() -> usize {
        std::mem::size_of::<Self>()
    }
}

pub(crate) fn to_u32(what: &str, value: usize) -> RnntResult<u32> {
    u32::try_from(value).map_err(|_| RnntError::overflow(format!("{what} ({value}) exceeds u32")))
}
