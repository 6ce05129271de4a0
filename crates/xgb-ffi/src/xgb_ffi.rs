//! Minimal XGBoost C-API bindings for inference.
//!
//! Scope:
//! - Load a booster from a file or an in-memory buffer
//! - In-place prediction on dense row-major `f32` matrices via
//!   `XGBoosterPredictFromDense` (value / margin only)
//! - DMatrix prediction via `XGBoosterPredictFromDMatrix` for every other
//!   output type (contributions, interactions, leaf indices)
//! - Prediction config JSON

use anyhow::{anyhow, bail, ensure, Context};
use std::ffi::{CStr, CString};
use std::fmt::Write as _;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::ptr;

pub type BstUlong = u64;
pub type DMatrixHandle = *mut c_void;
pub type BoosterHandle = *mut c_void;

extern "C" {
    fn XGBGetLastError() -> *const c_char;
    fn XGBoostVersion(major: *mut c_int, minor: *mut c_int, patch: *mut c_int);

    fn XGBoosterCreate(dmats: *const DMatrixHandle, len: BstUlong, out: *mut BoosterHandle) -> c_int;
    fn XGBoosterFree(handle: BoosterHandle) -> c_int;
    fn XGBoosterLoadModel(handle: BoosterHandle, fname: *const c_char) -> c_int;
    fn XGBoosterLoadModelFromBuffer(handle: BoosterHandle, buf: *const c_void, len: BstUlong) -> c_int;
    fn XGBoosterSetParam(handle: BoosterHandle, name: *const c_char, value: *const c_char) -> c_int;
    fn XGBoosterGetNumFeature(handle: BoosterHandle, out: *mut BstUlong) -> c_int;

    fn XGDMatrixCreateFromMat(
        data: *const f32,
        nrow: BstUlong,
        ncol: BstUlong,
        missing: f32,
        out: *mut DMatrixHandle,
    ) -> c_int;
    fn XGDMatrixFree(handle: DMatrixHandle) -> c_int;

    fn XGBoosterPredictFromDMatrix(
        handle: BoosterHandle,
        dmat: DMatrixHandle,
        config: *const c_char,
        out_shape: *mut *const BstUlong,
        out_dim: *mut BstUlong,
        out_result: *mut *const f32,
    ) -> c_int;

    fn XGBoosterPredictFromDense(
        handle: BoosterHandle,
        array_interface: *const c_char,
        config: *const c_char,
        proxy: DMatrixHandle,
        out_shape: *mut *const BstUlong,
        out_dim: *mut BstUlong,
        out_result: *mut *const f32,
    ) -> c_int;
}

fn last_error() -> anyhow::Error {
    let p = unsafe { XGBGetLastError() };
    if p.is_null() {
        anyhow!("xgboost: unknown error (XGBGetLastError returned null)")
    } else {
        let s = unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned();
        anyhow!("xgboost: {s}")
    }
}

fn check(rc: c_int) -> anyhow::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(last_error())
    }
}

/// Version of the linked libxgboost as `(major, minor, patch)`.
pub fn xgboost_version() -> (i32, i32, i32) {
    let (mut major, mut minor, mut patch) = (0, 0, 0);
    unsafe { XGBoostVersion(&mut major, &mut minor, &mut patch) };
    (major, minor, patch)
}

/// Output of a predict call.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOutput {
    pub shape: Vec<BstUlong>,
    pub values: Vec<f32>,
}

impl PredictOutput {
    /// Number of floats produced per input row.
    pub fn per_row(&self, nrow: usize) -> usize {
        if nrow == 0 {
            0
        } else {
            self.values.len() / nrow
        }
    }
}

/// `type` field of the in-place prediction config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PredictType {
    Value = 0,
    Margin = 1,
    Contribs = 2,
    ApproxContribs = 3,
    Interactions = 4,
    ApproxInteractions = 5,
    Leaf = 6,
}

impl PredictType {
    /// Whether `XGBoosterPredictFromDense` accepts this type. The in-place
    /// path rejects everything except value and margin.
    pub fn is_inplace(self) -> bool {
        matches!(self, PredictType::Value | PredictType::Margin)
    }
}

/// Config JSON passed to `XGBoosterPredictFromDense` / `XGBoosterPredictFromDMatrix`.
///
/// `missing` is only read by the in-place path; a DMatrix takes it at
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct PredictConfig {
    pub kind: PredictType,
    pub iteration_begin: u32,
    /// `0` means "all trees".
    pub iteration_end: u32,
    pub strict_shape: bool,
    pub missing: f32,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            kind: PredictType::Value,
            iteration_begin: 0,
            iteration_end: 0,
            strict_shape: false,
            missing: f32::NAN,
        }
    }
}

impl PredictConfig {
    pub fn with_kind(kind: PredictType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> String {
        format!(
            r#"{{"type":{},"training":false,"iteration_begin":{},"iteration_end":{},"strict_shape":{},"missing":{}}}"#,
            self.kind as u8,
            self.iteration_begin,
            self.iteration_end,
            self.strict_shape,
            json_f32(self.missing),
        )
    }

    pub fn to_cstring(&self) -> anyhow::Result<CString> {
        Ok(CString::new(self.to_json())?)
    }
}

// xgboost's JSON reader accepts the non-standard NaN / Infinity literals.
fn json_f32(v: f32) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        let mut s = String::new();
        let _ = write!(s, "{v}");
        s
    }
}

/// Numpy-style `__array_interface__` (version 3) describing a borrowed dense
/// row-major little-endian `f32` matrix.
#[derive(Debug)]
pub struct DenseArrayInterface<'a> {
    data: &'a [f32],
    cstr: CString,
}

impl<'a> DenseArrayInterface<'a> {
    pub fn new(data: &'a [f32], nrow: usize, ncol: usize) -> anyhow::Result<Self> {
        let need = nrow
            .checked_mul(ncol)
            .ok_or_else(|| anyhow!("matrix shape overflows: {nrow}x{ncol}"))?;
        ensure!(
            data.len() == need,
            "dense data len mismatch: got={} expect={}x{}={}",
            data.len(),
            nrow,
            ncol,
            need
        );

        // data: [ptr, read_only]
        let s = format!(
            r#"{{"data":[{},true],"shape":[{},{}],"typestr":"<f4","version":3}}"#,
            data.as_ptr() as usize,
            nrow,
            ncol
        );
        let cstr = CString::new(s)?;
        Ok(Self { data, cstr })
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        self.data
    }

    #[inline]
    pub fn as_cstr(&self) -> &CStr {
        &self.cstr
    }
}

/// Owned `DMatrix` copied from a dense row-major `f32` matrix.
#[derive(Debug)]
pub struct DMatrix {
    handle: DMatrixHandle,
    nrow: usize,
    ncol: usize,
}

impl Drop for DMatrix {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            let _ = unsafe { XGDMatrixFree(self.handle) };
            self.handle = ptr::null_mut();
        }
    }
}

impl DMatrix {
    pub fn from_dense(data: &[f32], nrow: usize, ncol: usize, missing: f32) -> anyhow::Result<Self> {
        // same shape checks as the in-place path
        DenseArrayInterface::new(data, nrow, ncol)?;
        let mut handle: DMatrixHandle = ptr::null_mut();
        unsafe {
            check(XGDMatrixCreateFromMat(
                data.as_ptr(),
                nrow as BstUlong,
                ncol as BstUlong,
                missing,
                &mut handle,
            ))
            .context("XGDMatrixCreateFromMat")?;
        }
        if handle.is_null() {
            bail!("xgboost: XGDMatrixCreateFromMat returned null handle");
        }
        Ok(Self { handle, nrow, ncol })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrow, self.ncol)
    }
}

#[derive(Debug)]
pub struct Booster {
    handle: BoosterHandle,
}

// Not safe for concurrent calls across threads; OK to move to a worker thread.
unsafe impl Send for Booster {}

impl Drop for Booster {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            let _ = unsafe { XGBoosterFree(self.handle) };
            self.handle = ptr::null_mut();
        }
    }
}

impl Booster {
    fn create() -> anyhow::Result<Self> {
        let mut handle: BoosterHandle = ptr::null_mut();
        unsafe {
            check(XGBoosterCreate(ptr::null(), 0, &mut handle)).context("XGBoosterCreate")?;
        }
        if handle.is_null() {
            bail!("xgboost: XGBoosterCreate returned null handle");
        }
        Ok(Self { handle })
    }

    /// Create an empty booster and load model from file (json / ubj / legacy binary).
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let cpath = CString::new(
            path.to_str()
                .ok_or_else(|| anyhow!("model path is not valid UTF-8: {path:?}"))?,
        )?;

        let bst = Self::create()?;
        unsafe {
            check(XGBoosterLoadModel(bst.handle, cpath.as_ptr()))
                .with_context(|| format!("XGBoosterLoadModel: {}", path.display()))?
        };
        Ok(bst)
    }

    /// Create an empty booster and load a serialized model from memory.
    pub fn load_from_buffer(buf: &[u8]) -> anyhow::Result<Self> {
        ensure!(!buf.is_empty(), "model buffer is empty");
        let bst = Self::create()?;
        unsafe {
            check(XGBoosterLoadModelFromBuffer(
                bst.handle,
                buf.as_ptr() as *const c_void,
                buf.len() as BstUlong,
            ))
            .context("XGBoosterLoadModelFromBuffer")?
        };
        Ok(bst)
    }

    pub fn set_param(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let cname = CString::new(name)?;
        let cvalue = CString::new(value)?;
        unsafe {
            check(XGBoosterSetParam(self.handle, cname.as_ptr(), cvalue.as_ptr()))
                .with_context(|| format!("XGBoosterSetParam {name}={value}"))
        }
    }

    pub fn num_features(&self) -> anyhow::Result<usize> {
        let mut out: BstUlong = 0;
        unsafe {
            check(XGBoosterGetNumFeature(self.handle, &mut out)).context("XGBoosterGetNumFeature")?;
        }
        Ok(out as usize)
    }

    /// Generic dense prediction entry point.
    ///
    /// The result is copied out of xgboost's buffer, which is only valid
    /// until the next call on this booster.
    pub fn predict_from_dense(&self, array_interface: &CStr, config: &CStr) -> anyhow::Result<PredictOutput> {
        let mut out_shape_ptr: *const BstUlong = ptr::null();
        let mut out_dim: BstUlong = 0;
        let mut out_result_ptr: *const f32 = ptr::null();

        unsafe {
            check(XGBoosterPredictFromDense(
                self.handle,
                array_interface.as_ptr(),
                config.as_ptr(),
                ptr::null_mut(),
                &mut out_shape_ptr,
                &mut out_dim,
                &mut out_result_ptr,
            ))
            .context("XGBoosterPredictFromDense")?;
        }

        Ok(unsafe { copy_output(out_shape_ptr, out_dim, out_result_ptr) })
    }

    /// Prediction on an owned [`DMatrix`]. Required for contributions,
    /// interactions and leaf indices.
    pub fn predict_from_dmatrix(&self, dmat: &DMatrix, config: &CStr) -> anyhow::Result<PredictOutput> {
        let mut out_shape_ptr: *const BstUlong = ptr::null();
        let mut out_dim: BstUlong = 0;
        let mut out_result_ptr: *const f32 = ptr::null();

        unsafe {
            check(XGBoosterPredictFromDMatrix(
                self.handle,
                dmat.handle,
                config.as_ptr(),
                &mut out_shape_ptr,
                &mut out_dim,
                &mut out_result_ptr,
            ))
            .context("XGBoosterPredictFromDMatrix")?;
            Ok(copy_output(out_shape_ptr, out_dim, out_result_ptr))
        }
    }

    /// Predict on a borrowed dense row-major matrix.
    ///
    /// Value and margin run in place on the borrowed buffer; other types
    /// copy it into a temporary [`DMatrix`] first.
    pub fn predict_dense(
        &self,
        data: &[f32],
        nrow: usize,
        ncol: usize,
        config: &PredictConfig,
    ) -> anyhow::Result<PredictOutput> {
        let cfg = config.to_cstring()?;
        if config.kind.is_inplace() {
            let ai = DenseArrayInterface::new(data, nrow, ncol)?;
            self.predict_from_dense(ai.as_cstr(), &cfg)
        } else {
            let dmat = DMatrix::from_dense(data, nrow, ncol, config.missing)?;
            self.predict_from_dmatrix(&dmat, &cfg)
        }
    }
}

// xgboost owns the result buffers until the next call on the booster.
unsafe fn copy_output(shape_ptr: *const BstUlong, dim: BstUlong, result_ptr: *const f32) -> PredictOutput {
    let shape = if dim == 0 || shape_ptr.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(shape_ptr, dim as usize).to_vec()
    };

    let n = shape_len(&shape);
    let values = if n == 0 || result_ptr.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(result_ptr, n).to_vec()
    };

    PredictOutput { shape, values }
}

fn shape_len(shape: &[BstUlong]) -> usize {
    if shape.is_empty() {
        return 0;
    }
    shape
        .iter()
        .copied()
        .fold(1u64, |acc, v| acc.saturating_mul(v)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_has_required_keys() {
        let s = PredictConfig::default().to_json();
        assert_eq!(
            s,
            r#"{"type":0,"training":false,"iteration_begin":0,"iteration_end":0,"strict_shape":false,"missing":NaN}"#
        );

        let mut cfg = PredictConfig::with_kind(PredictType::Contribs);
        cfg.missing = -999.0;
        cfg.iteration_end = 10;
        let s = cfg.to_json();
        assert!(s.contains(r#""type":2"#));
        assert!(s.contains(r#""iteration_end":10"#));
        assert!(s.contains(r#""missing":-999"#));
    }

    #[test]
    fn only_value_and_margin_run_in_place() {
        assert!(PredictType::Value.is_inplace());
        assert!(PredictType::Margin.is_inplace());
        for kind in [
            PredictType::Contribs,
            PredictType::ApproxContribs,
            PredictType::Interactions,
            PredictType::ApproxInteractions,
            PredictType::Leaf,
        ] {
            assert!(!kind.is_inplace(), "{kind:?}");
        }
    }

    #[test]
    fn copy_output_handles_empty_results() {
        let out = unsafe { copy_output(ptr::null(), 0, ptr::null()) };
        assert!(out.shape.is_empty() && out.values.is_empty());

        let shape: [BstUlong; 2] = [2, 2];
        let values = [1.0f32, 2.0, 3.0, 4.0];
        let out = unsafe { copy_output(shape.as_ptr(), 2, values.as_ptr()) };
        assert_eq!(out.values, values);
        assert_eq!(out.per_row(2), 2);
    }

    #[test]
    fn json_f32_special_values() {
        assert_eq!(json_f32(f32::INFINITY), "Infinity");
        assert_eq!(json_f32(f32::NEG_INFINITY), "-Infinity");
        assert_eq!(json_f32(0.5), "0.5");
    }

    #[test]
    fn array_interface_describes_buffer() {
        let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let ai = DenseArrayInterface::new(&data, 2, 3).unwrap();
        let s = ai.as_cstr().to_str().unwrap();
        assert!(s.contains(&format!(r#""data":[{},true]"#, data.as_ptr() as usize)));
        assert!(s.contains(r#""shape":[2,3]"#));
        assert!(s.contains(r#""typestr":"<f4""#));
        assert_eq!(ai.data().len(), 6);
    }

    #[test]
    fn array_interface_rejects_len_mismatch() {
        let data = vec![0.0f32; 5];
        let err = DenseArrayInterface::new(&data, 2, 3).unwrap_err();
        assert!(err.to_string().contains("len mismatch"));
        assert!(DenseArrayInterface::new(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn shape_len_and_per_row() {
        assert_eq!(shape_len(&[]), 0);
        assert_eq!(shape_len(&[4]), 4);
        assert_eq!(shape_len(&[4, 3]), 12);

        let out = PredictOutput {
            shape: vec![4, 3],
            values: vec![0.0; 12],
        };
        assert_eq!(out.per_row(4), 3);
        assert_eq!(out.per_row(0), 0);
    }
}
