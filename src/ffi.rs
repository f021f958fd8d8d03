//! C ABI.
//!
//! Provides `#[no_mangle] extern "C"` functions for C/C++/Python callers.
//! Every fallible entry point returns an [`RnntStatus`]; the detailed
//! [`RnntError`] is logged at debug level before it is collapsed.
//!
//! The GPU location takes a stream handle created with
//! `rnntGpuStreamCreate`. wgpu exposes no raw device pointers, so C callers
//! always pass host pointers; the GPU path stages them through device
//! buffers on that stream and copies the results back before returning.

use std::ffi::{c_char, c_int, c_uint, c_void};

use crate::batch::{Gradients, LossInputs};
use crate::config::{Backend, ComputeLocation, RnntOptions};
use crate::error::{RnntError, RnntResult, RnntStatus};
use crate::workspace::workspace_size;

#[cfg(feature = "gpu")]
use crate::gpu::{GpuStream, WgpuBackend, WgpuOptions};

/// `rnntComputeLocation` value selecting the CPU.
pub const RNNT_CPU: c_int = 0;
/// `rnntComputeLocation` value selecting the GPU.
pub const RNNT_GPU: c_int = 1;

/// Backend payload of [`CRnntOptions`], selected by `loc`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union CLocationPayload {
    /// CPU thread budget.
    pub num_threads: c_uint,
    /// Handle from `rnntGpuStreamCreate`.
    pub stream: *mut c_void,
}

/// The C `rnntOptions` struct.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CRnntOptions {
    /// `RNNT_CPU` or `RNNT_GPU`.
    pub loc: c_int,
    pub payload: CLocationPayload,
    pub blank_label: c_int,
    pub max_t: c_int,
    pub max_u: c_int,
}

impl CRnntOptions {
    /// CPU options with the given thread budget.
    pub fn cpu(num_threads: c_uint, blank_label: c_int, max_t: c_int, max_u: c_int) -> Self {
        Self {
            loc: RNNT_CPU,
            payload: CLocationPayload { num_threads },
            blank_label,
            max_t,
            max_u,
        }
    }

    /// Converts to the tagged Rust options.
    ///
    /// # Safety
    ///
    /// For `RNNT_GPU`, `payload.stream` must be null or a live handle from
    /// `rnntGpuStreamCreate`.
    pub unsafe fn to_options(&self) -> RnntResult<RnntOptions> {
        let non_negative = |what: &'static str, value: c_int| {
            usize::try_from(value)
                .map_err(|_| RnntError::invalid_dimension(format!("{what} ({value}) is negative")))
        };
        let blank_label = non_negative("blank_label", self.blank_label)?;
        let max_t = non_negative("maxT", self.max_t)?;
        let max_u = non_negative("maxU", self.max_u)?;

        let location = match Backend::from_raw(self.loc) {
            Some(Backend::Cpu) => ComputeLocation::Cpu {
                num_threads: self.payload.num_threads as usize,
            },
            Some(Backend::Gpu) => self.gpu_location()?,
            None => {
                return Err(RnntError::invalid_dimension(format!(
                    "unknown compute location {}",
                    self.loc
                )))
            }
        };

        Ok(RnntOptions {
            location,
            blank_label,
            max_t,
            max_u,
        })
    }

    #[cfg(feature = "gpu")]
    unsafe fn gpu_location(&self) -> RnntResult<ComputeLocation> {
        let stream = self.payload.stream as *const GpuStream;
        if stream.is_null() {
            return Err(RnntError::invalid_dimension("GPU stream handle is null"));
        }
        Ok(ComputeLocation::Gpu((*stream).clone()))
    }

    #[cfg(not(feature = "gpu"))]
    unsafe fn gpu_location(&self) -> RnntResult<ComputeLocation> {
        Err(RnntError::Unsupported(
            "GPU location requested but the gpu feature is not enabled",
        ))
    }
}

// ── Version and status ──────────────────────────────────────────────

/// Returns the API version.
#[no_mangle]
pub extern "C" fn get_warprnnt_version() -> c_int {
    crate::API_VERSION
}

/// Returns a static NUL-terminated description of `status`.
///
/// Unknown values describe [`RnntStatus::UnknownError`].
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn rnntGetStatusString(status: c_int) -> *const c_char {
    RnntStatus::from_raw(status).as_c_str().as_ptr()
}

// ── Workspace sizing ────────────────────────────────────────────────

/// Writes the workspace size in bytes to `size_bytes`.
///
/// # Safety
/// `size_bytes` must be null or point to writable memory.
#[no_mangle]
pub unsafe extern "C" fn get_workspace_size(
    max_t: c_int,
    max_u: c_int,
    minibatch: c_int,
    alphabet_size: c_int,
    gpu: bool,
    size_bytes: *mut usize,
) -> RnntStatus {
    if size_bytes.is_null() {
        return RnntStatus::InvalidValue;
    }
    let dims = [max_t, max_u, minibatch, alphabet_size].map(usize::try_from);
    let [Ok(max_t), Ok(max_u), Ok(minibatch), Ok(alphabet_size)] = dims else {
        return RnntStatus::InvalidValue;
    };
    let backend = if gpu { Backend::Gpu } else { Backend::Cpu };
    match workspace_size(max_t, max_u, minibatch, alphabet_size, backend) {
        Ok(bytes) => {
            *size_bytes = bytes;
            RnntStatus::Success
        }
        Err(err) => report(err),
    }
}

// ── Loss ────────────────────────────────────────────────────────────

/// Computes per-example costs and, for non-null gradient pointers,
/// gradients.
///
/// # Safety
/// - `trans_acts` (and `trans_grad` if non-null) must point to
///   `maxT * minibatch * alphabet_size` floats.
/// - `pred_acts` (and `pred_grad` if non-null) must point to
///   `maxU * minibatch * alphabet_size` floats.
/// - `label_lengths`, `input_lengths` and `costs` must point to `minibatch`
///   values; `flat_labels` to the sum of the label lengths (it may be null
///   when that sum is zero).
/// - `workspace` must point to `get_workspace_size` bytes, 4-byte aligned.
/// - No output may alias an input.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn compute_rnnt_loss(
    trans_acts: *const f32,
    pred_acts: *const f32,
    trans_grad: *mut f32,
    pred_grad: *mut f32,
    flat_labels: *const c_int,
    label_lengths: *const c_int,
    input_lengths: *const c_int,
    alphabet_size: c_int,
    minibatch: c_int,
    costs: *mut f32,
    workspace: *mut c_void,
    options: CRnntOptions,
) -> RnntStatus {
    let result = compute_loss_raw(
        RawTensors {
            trans_acts,
            pred_acts,
            trans_grad,
            pred_grad,
            flat_labels,
            label_lengths,
            input_lengths,
            costs,
            workspace: workspace as *mut u8,
        },
        alphabet_size,
        minibatch,
        &options,
    );
    match result {
        Ok(()) => RnntStatus::Success,
        Err(err) => report(err),
    }
}

struct RawTensors {
    trans_acts: *const f32,
    pred_acts: *const f32,
    trans_grad: *mut f32,
    pred_grad: *mut f32,
    flat_labels: *const c_int,
    label_lengths: *const c_int,
    input_lengths: *const c_int,
    costs: *mut f32,
    workspace: *mut u8,
}

unsafe fn compute_loss_raw(
    raw: RawTensors,
    alphabet_size: c_int,
    minibatch: c_int,
    options: &CRnntOptions,
) -> RnntResult<()> {
    let required = [
        ("trans_acts", raw.trans_acts.is_null()),
        ("pred_acts", raw.pred_acts.is_null()),
        ("label_lengths", raw.label_lengths.is_null()),
        ("input_lengths", raw.input_lengths.is_null()),
        ("workspace", raw.workspace.is_null()),
    ];
    if raw.costs.is_null() {
        return Err(RnntError::MissingOutput("costs"));
    }
    if let Some((name, _)) = required.iter().find(|(_, null)| *null) {
        return Err(RnntError::invalid_dimension(format!("{name} is null")));
    }

    let alphabet_size = usize::try_from(alphabet_size)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| RnntError::invalid_dimension("alphabet_size must be > 0"))?;
    let minibatch = usize::try_from(minibatch)
        .ok()
        .filter(|&b| b > 0)
        .ok_or_else(|| RnntError::invalid_dimension("minibatch must be > 0"))?;
    let options = options.to_options()?;
    // the slice lengths below are derived from the maxima
    let ws_bytes = workspace_size(
        options.max_t,
        options.max_u,
        minibatch,
        alphabet_size,
        options.backend(),
    )?;
    let trans_len = tensor_elements(options.max_t, minibatch, alphabet_size)?;
    let pred_len = tensor_elements(options.max_u, minibatch, alphabet_size)?;

    let label_lengths = std::slice::from_raw_parts(raw.label_lengths, minibatch);
    let input_lengths = std::slice::from_raw_parts(raw.input_lengths, minibatch);
    let total_labels = label_lengths
        .iter()
        .filter_map(|&l| usize::try_from(l).ok())
        .try_fold(0usize, usize::checked_add)
        .ok_or_else(|| RnntError::overflow("sum of label lengths"))?;
    let labels: &[c_int] = if total_labels == 0 {
        &[]
    } else if raw.flat_labels.is_null() {
        return Err(RnntError::invalid_dimension("flat_labels is null"));
    } else {
        std::slice::from_raw_parts(raw.flat_labels, total_labels)
    };

    let inputs = LossInputs {
        trans_acts: std::slice::from_raw_parts(raw.trans_acts, trans_len),
        pred_acts: std::slice::from_raw_parts(raw.pred_acts, pred_len),
        labels,
        label_lengths,
        input_lengths,
        alphabet_size,
        minibatch,
    };
    let grads = Gradients {
        trans_grad: (!raw.trans_grad.is_null())
            .then(|| std::slice::from_raw_parts_mut(raw.trans_grad, trans_len)),
        pred_grad: (!raw.pred_grad.is_null())
            .then(|| std::slice::from_raw_parts_mut(raw.pred_grad, pred_len)),
    };
    let costs = std::slice::from_raw_parts_mut(raw.costs, minibatch);
    let workspace = std::slice::from_raw_parts_mut(raw.workspace, ws_bytes);

    crate::loss::compute_rnnt_loss(&inputs, grads, costs, workspace, &options)
}

fn tensor_elements(rows: usize, minibatch: usize, alphabet_size: usize) -> RnntResult<usize> {
    rows.checked_mul(minibatch)
        .and_then(|n| n.checked_mul(alphabet_size))
        .ok_or_else(|| RnntError::overflow("activation tensor size"))
}

fn report(err: RnntError) -> RnntStatus {
    let status = err.status();
    log::debug!("warprnnt C call failed with {status}: {err}");
    status
}

// ── GPU streams ─────────────────────────────────────────────────────

/// Creates a GPU stream on the default adapter and writes its handle to
/// `out`.
///
/// # Safety
/// `out` must point to a writable pointer.
#[cfg(feature = "gpu")]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn rnntGpuStreamCreate(out: *mut *mut c_void) -> RnntStatus {
    if out.is_null() {
        return RnntStatus::InvalidValue;
    }
    match WgpuBackend::init(WgpuOptions::default()) {
        Ok(backend) => {
            *out = Box::into_raw(Box::new(backend.stream())) as *mut c_void;
            RnntStatus::Success
        }
        Err(err) => report(err),
    }
}

/// Destroys a stream handle. Null is ignored.
///
/// # Safety
/// `stream` must be a handle returned by `rnntGpuStreamCreate`, or null,
/// and must not be used afterwards.
#[cfg(feature = "gpu")]
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn rnntGpuStreamDestroy(stream: *mut c_void) {
    if !stream.is_null() {
        drop(Box::from_raw(stream as *mut GpuStream));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_options_layout() {
        let ptr = size_of::<*mut c_void>();
        assert_eq!(size_of::<CLocationPayload>(), ptr);
        assert_eq!(offset_of!(CRnntOptions, loc), 0);
        assert_eq!(offset_of!(CRnntOptions, payload), align_of::<CLocationPayload>().max(4));
        assert_eq!(
            offset_of!(CRnntOptions, blank_label),
            offset_of!(CRnntOptions, payload) + ptr
        );
        assert_eq!(
            offset_of!(CRnntOptions, max_u),
            offset_of!(CRnntOptions, blank_label) + 8
        );
    }

    #[test]
    fn test_version() {
        assert_eq!(get_warprnnt_version(), 1);
    }

    #[test]
    fn test_status_strings() {
        for raw in 0..5 {
            let s = unsafe { CStr::from_ptr(rnntGetStatusString(raw)) };
            assert_eq!(s.to_str().unwrap(), RnntStatus::from_raw(raw).as_str());
        }
        let unknown = unsafe { CStr::from_ptr(rnntGetStatusString(99)) };
        assert_eq!(unknown.to_str().unwrap(), "unknown error");
    }

    #[test]
    fn test_get_workspace_size() {
        let mut bytes = 0usize;
        let status = unsafe { get_workspace_size(2, 3, 4, 5, false, &mut bytes) };
        assert_eq!(status, RnntStatus::Success);
        assert_eq!(bytes, 4 * 4 * (5 * 2 * 3 + 5));

        let status = unsafe { get_workspace_size(-1, 3, 4, 5, false, &mut bytes) };
        assert_eq!(status, RnntStatus::InvalidValue);
        let status = unsafe { get_workspace_size(2, 3, 4, 5, false, std::ptr::null_mut()) };
        assert_eq!(status, RnntStatus::InvalidValue);
    }

    #[test]
    fn test_compute_cpu() {
        // T = 2, U = 2, V = 3, all activations zero
        let trans = [0.0f32; 6];
        let pred = [0.0f32; 6];
        let labels = [1];
        let label_lengths = [1];
        let input_lengths = [2];
        let mut costs = [0.0f32];
        let mut trans_grad = [0.0f32; 6];
        let mut ws = vec![0u32; 4 * 23];

        let status = unsafe {
            compute_rnnt_loss(
                trans.as_ptr(),
                pred.as_ptr(),
                trans_grad.as_mut_ptr(),
                std::ptr::null_mut(),
                labels.as_ptr(),
                label_lengths.as_ptr(),
                input_lengths.as_ptr(),
                3,
                1,
                costs.as_mut_ptr(),
                ws.as_mut_ptr() as *mut c_void,
                CRnntOptions::cpu(1, 0, 2, 2),
            )
        };
        assert_eq!(status, RnntStatus::Success);
        assert!((costs[0] + (2.0f32 / 27.0).ln()).abs() < 1e-5);
        assert!(trans_grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn test_compute_invalid_length() {
        let trans = [0.0f32; 3];
        let pred = [0.0f32; 3];
        let label_lengths = [0];
        let input_lengths = [2];
        let mut costs = [7.0f32];
        let mut ws = vec![0u32; 64];

        let status = unsafe {
            compute_rnnt_loss(
                trans.as_ptr(),
                pred.as_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null(),
                label_lengths.as_ptr(),
                input_lengths.as_ptr(),
                3,
                1,
                costs.as_mut_ptr(),
                ws.as_mut_ptr() as *mut c_void,
                CRnntOptions::cpu(1, 0, 1, 1),
            )
        };
        assert_eq!(status, RnntStatus::InvalidValue);
        assert_eq!(costs[0], 7.0);
    }

    #[test]
    fn test_null_inputs_rejected() {
        let mut costs = [0.0f32];
        let status = unsafe {
            compute_rnnt_loss(
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                3,
                1,
                costs.as_mut_ptr(),
                std::ptr::null_mut(),
                CRnntOptions::cpu(1, 0, 1, 1),
            )
        };
        assert_eq!(status, RnntStatus::InvalidValue);
    }

    #[test]
    fn test_unknown_location() {
        let mut options = CRnntOptions::cpu(1, 0, 1, 1);
        options.loc = 7;
        assert!(unsafe { options.to_options() }.is_err());
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_gpu_location_without_feature() {
        let options = CRnntOptions {
            loc: RNNT_GPU,
            payload: CLocationPayload {
                stream: std::ptr::null_mut(),
            },
            blank_label: 0,
            max_t: 1,
            max_u: 1,
        };
        let err = unsafe { options.to_options() }.unwrap_err();
        assert_eq!(err.status(), RnntStatus::InvalidValue);
    }
}
