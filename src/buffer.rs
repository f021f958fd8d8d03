//! Cache-line aligned scratch bytes for the CPU workspace.
//!
//! [`AlignedBuffer`] backs the workspace that [`RnntLoss`](crate::RnntLoss)
//! keeps between calls. The loss engine only needs 4-byte alignment, but the
//! buffer is allocated on a 64-byte boundary ([`CACHE_LINE`]) so that
//! per-example regions that start on a multiple of 16 floats do not share a
//! cache line with their neighbours.
//!
//! ```rust
//! use warprnnt::AlignedBuffer;
//!
//! let mut buf = AlignedBuffer::new();
//! buf.resize(1024).unwrap();
//! assert_eq!(buf.len(), 1024);
//! assert_eq!(buf.as_ptr() as usize % warprnnt::buffer::CACHE_LINE, 0);
//! ```

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{RnntError, RnntResult};

/// Cache line size for memory alignment (64 bytes).
pub const CACHE_LINE: usize = 64;

/// 64-byte aligned, zero-initialized byte buffer.
///
/// Grows on demand and never shrinks. Contents are not preserved across a
/// reallocation; the loss engine overwrites every byte it reads.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
}

// SAFETY: AlignedBuffer uniquely owns its allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Creates an empty buffer without allocating.
    pub fn new() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
        }
    }

    /// Creates a zeroed buffer of `len` bytes.
    pub fn with_len(len: usize) -> RnntResult<Self> {
        let mut buf = Self::new();
        buf.resize(len)?;
        Ok(buf)
    }

    /// Sets the length to `new_len` bytes, reallocating if the capacity is
    /// insufficient.
    ///
    /// On allocation failure the buffer keeps its previous contents and
    /// [`RnntError::AllocationFailed`] is returned.
    pub fn resize(&mut self, new_len: usize) -> RnntResult<()> {
        if new_len > self.capacity {
            let layout = Self::layout(new_len)?;
            // SAFETY: layout has non-zero size; a null return is checked below.
            let raw = unsafe { alloc_zeroed(layout) };
            let new_ptr = NonNull::new(raw)
                .ok_or(RnntError::AllocationFailed { bytes: new_len })?;
            self.release();
            self.ptr = new_ptr;
            self.capacity = new_len;
        }
        self.len = new_len;
        Ok(())
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Allocated capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: ptr is valid for `len` initialized bytes.
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            &mut []
        } else {
            // SAFETY: ptr is uniquely owned and valid for `len` initialized bytes.
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn layout(bytes: usize) -> RnntResult<Layout> {
        Layout::from_size_align(bytes, CACHE_LINE)
            .map_err(|_| RnntError::overflow(format!("workspace allocation of {bytes} bytes")))
    }

    fn release(&mut self) {
        if self.capacity > 0 {
            if let Ok(layout) = Self::layout(self.capacity) {
                // SAFETY: layout matches the one used at allocation.
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
            self.capacity = 0;
            self.len = 0;
        }
    }
}

impl Default for AlignedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_basic() {
        let mut buf = AlignedBuffer::with_len(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE, 0);
        buf.as_mut_slice()[99] = 7;
        assert_eq!(buf.as_slice()[99], 7);
    }

    #[test]
    fn test_aligned_buffer_grow_and_shrink() {
        let mut buf = AlignedBuffer::new();
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());

        buf.resize(64).unwrap();
        assert_eq!(buf.capacity(), 64);

        buf.resize(4096).unwrap();
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE, 0);

        buf.resize(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn test_aligned_buffer_casts_to_f32() {
        let mut buf = AlignedBuffer::with_len(32).unwrap();
        let floats: &mut [f32] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        assert_eq!(floats.len(), 8);
        floats[3] = 1.5;
        assert_eq!(bytemuck::cast_slice::<u8, f32>(buf.as_slice())[3], 1.5);
    }

    #[test]
    fn test_failed_allocation_keeps_buffer() {
        let mut buf = AlignedBuffer::with_len(128).unwrap();
        buf.as_mut_slice()[5] = 9;

        let huge = isize::MAX as usize & !(CACHE_LINE - 1);
        let err = buf.resize(huge).unwrap_err();
        assert!(matches!(err, RnntError::AllocationFailed { bytes } if bytes == huge));
        assert_eq!(err.status(), crate::RnntStatus::MemopsFailed);

        assert_eq!(buf.len(), 128);
        assert_eq!(buf.as_slice()[5], 9);
    }
}
