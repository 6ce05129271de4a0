//! C ABI. Declarations: `include/cockchafer.h`.
//!
//! Conventions for every function returning `int`:
//! - `0` on success, a negative code from [`crate::error`] otherwise
//! - on failure `cockchafer_last_error()` describes the error (per thread)
//! - no panic crosses the boundary
//!
//! Feature matrices are dense row-major `float`, `nrow * nfea` values, NaN
//! (or the configured `COCKCHAFER_MISSING`) marking missing entries. Output
//! buffers must hold `nrow * dim` floats where `dim` comes from the matching
//! `cockchafer_*_dim` query.

use std::any::Any;
use std::ffi::CStr;
use std::mem::size_of;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::time::Instant;

use crate::config;
use crate::error::{self, AbiError};
use crate::logging;
use crate::predictor::PredictKind;
use crate::registry::{models, ModelEntry};
use crate::util::now_us;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn guard<F>(f: F) -> c_int
where
    F: FnOnce() -> Result<(), AbiError>,
{
    let res = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(payload) => Err(AbiError::Panic(panic_message(payload.as_ref()))),
    };
    match res {
        Ok(()) => {
            error::clear_last_error();
            error::OK
        }
        Err(e) => {
            metrics::counter!("cockchafer_abi_errors_total").increment(1);
            tracing::debug!(code = e.code(), err = %e, "abi call failed");
            error::set_last_error(&e);
            e.code()
        }
    }
}

unsafe fn read_int(p: *const c_int, what: &'static str) -> Result<c_int, AbiError> {
    if p.is_null() {
        return Err(AbiError::NullPointer(what));
    }
    Ok(*p)
}

unsafe fn write_int(p: *mut c_int, what: &'static str, v: usize) -> Result<(), AbiError> {
    if p.is_null() {
        return Err(AbiError::NullPointer(what));
    }
    *p = c_int::try_from(v).map_err(|_| AbiError::InvalidDims(format!("{what}={v} overflows int")))?;
    Ok(())
}

fn lookup(id: c_int) -> Result<std::sync::Arc<ModelEntry>, AbiError> {
    models().get(id).ok_or(AbiError::UnknownModel(id))
}

fn output_dim(entry: &ModelEntry, id: c_int, kind: PredictKind) -> Result<usize, AbiError> {
    entry.output_dim(kind).ok_or_else(|| {
        AbiError::Predict(anyhow::anyhow!(
            "{} prediction is not available for model {id}",
            kind_label(kind)
        ))
    })
}

fn kind_label(kind: PredictKind) -> &'static str {
    match kind {
        PredictKind::Value => "value",
        PredictKind::Margin => "margin",
        PredictKind::Contribs => "contribs",
    }
}

unsafe fn predict_impl(
    model: *const c_int,
    feature: *const f32,
    nrow: *const c_int,
    nfea: *const c_int,
    output: *mut f32,
    kind: PredictKind,
) -> Result<(), AbiError> {
    let id = read_int(model, "model")?;
    let nrow = read_int(nrow, "nrow")?;
    let nfea = read_int(nfea, "nfea")?;
    if feature.is_null() {
        return Err(AbiError::NullPointer("feature"));
    }
    if output.is_null() {
        return Err(AbiError::NullPointer("output"));
    }
    if nrow <= 0 || nfea <= 0 {
        return Err(AbiError::InvalidDims(format!("nrow={nrow} nfea={nfea}")));
    }
    let (nrow, ncol) = (nrow as usize, nfea as usize);
    // from_raw_parts needs the buffer to span at most isize::MAX bytes
    let len = nrow
        .checked_mul(ncol)
        .filter(|n| n.checked_mul(size_of::<f32>()).is_some_and(|b| b <= isize::MAX as usize))
        .ok_or_else(|| AbiError::InvalidDims(format!("nrow={nrow} x nfea={ncol} overflows")))?;

    let entry = lookup(id)?;
    if ncol != entry.num_features() {
        return Err(AbiError::InvalidDims(format!(
            "nfea={ncol} but model {id} expects {}",
            entry.num_features()
        )));
    }
    let dim = output_dim(&entry, id, kind)?;

    let data = std::slice::from_raw_parts(feature, len);
    let t0 = Instant::now();
    let out = entry.predict(data, nrow, ncol, kind).map_err(AbiError::Predict)?;

    let need = nrow * dim;
    if out.values.len() != need {
        return Err(AbiError::OutputShape(format!("got={} expect={}", out.values.len(), need)));
    }
    ptr::copy_nonoverlapping(out.values.as_ptr(), output, need);

    metrics::counter!("cockchafer_predict_total", "kind" => kind_label(kind)).increment(1);
    metrics::counter!("cockchafer_predict_rows_total").increment(nrow as u64);
    metrics::histogram!("cockchafer_predict_us").record(now_us(t0) as f64);
    Ok(())
}

/// Score `nrow` rows of `nfea` features with the model behind `*model`.
///
/// Writes `nrow * output_dim` floats to `output`.
///
/// # Safety
/// `feature` must point to `*nrow * *nfea` readable floats and `output` to
/// `*nrow * cockchafer_output_dim(model)` writable floats.
#[no_mangle]
pub unsafe extern "C" fn predict(
    model: *mut c_int,
    feature: *mut f32,
    nrow: *mut c_int,
    nfea: *mut c_int,
    output: *mut f32,
) -> c_int {
    guard(|| predict_impl(model, feature, nrow, nfea, output, PredictKind::Value))
}

/// Like [`predict`], but returns untransformed margins.
///
/// # Safety
/// As [`predict`], with `output` sized by `cockchafer_margin_dim`.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_predict_margin(
    model: *const c_int,
    feature: *const f32,
    nrow: *const c_int,
    nfea: *const c_int,
    output: *mut f32,
) -> c_int {
    guard(|| predict_impl(model, feature, nrow, nfea, output, PredictKind::Margin))
}

/// SHAP contributions, `nfea + 1` columns (bias last) per output group.
///
/// # Safety
/// As [`predict`], with `output` sized by `cockchafer_contribs_dim`.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_predict_contribs(
    model: *const c_int,
    feature: *const f32,
    nrow: *const c_int,
    nfea: *const c_int,
    output: *mut f32,
) -> c_int {
    guard(|| predict_impl(model, feature, nrow, nfea, output, PredictKind::Contribs))
}

/// # Safety
/// `model` must be non-null and writable.
unsafe fn register(entry: ModelEntry, model: *mut c_int, origin: &str) -> Result<(), AbiError> {
    let num_features = entry.num_features();
    let output_dim = entry.output_dim(PredictKind::Value).unwrap_or_default();
    let contribs = entry.output_dim(PredictKind::Contribs).is_some();
    let id = models().insert(entry).map_err(AbiError::Load)?;
    *model = id;
    tracing::info!(model = id, origin, num_features, output_dim, contribs, "model loaded");
    Ok(())
}

/// Load a model file (or a model directory) and write its handle to `*model`.
///
/// # Safety
/// `path` must be a NUL-terminated string; `model` must be writable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_load_model(path: *const c_char, model: *mut c_int) -> c_int {
    guard(|| {
        let cfg = config::global();
        logging::init(&cfg.log_filter);
        if path.is_null() {
            return Err(AbiError::NullPointer("path"));
        }
        if model.is_null() {
            return Err(AbiError::NullPointer("model"));
        }
        let path = CStr::from_ptr(path)
            .to_str()
            .map_err(|e| AbiError::InvalidArgument(format!("path is not valid UTF-8: {e}")))?;
        if path.is_empty() {
            return Err(AbiError::InvalidArgument("empty model path".to_string()));
        }
        let entry = ModelEntry::load(Path::new(path), cfg).map_err(|e| {
            tracing::warn!(path, err = %format!("{e:#}"), "model load failed");
            AbiError::Load(e)
        })?;
        register(entry, model, path)
    })
}

/// Load a serialized model (json / ubj bytes) and write its handle to `*model`.
///
/// # Safety
/// `buf` must point to `len` readable bytes; `model` must be writable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_load_model_from_buffer(
    buf: *const c_void,
    len: usize,
    model: *mut c_int,
) -> c_int {
    guard(|| {
        let cfg = config::global();
        logging::init(&cfg.log_filter);
        if buf.is_null() {
            return Err(AbiError::NullPointer("buf"));
        }
        if model.is_null() {
            return Err(AbiError::NullPointer("model"));
        }
        if len == 0 {
            return Err(AbiError::InvalidArgument("empty model buffer".to_string()));
        }
        let bytes = std::slice::from_raw_parts(buf as *const u8, len);
        let entry = ModelEntry::load_from_buffer(bytes, cfg).map_err(AbiError::Load)?;
        register(entry, model, "buffer")
    })
}

/// Release the model behind `*model`. Calls already running on it finish first.
///
/// # Safety
/// `model` must be readable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_free_model(model: *const c_int) -> c_int {
    guard(|| {
        let id = read_int(model, "model")?;
        models().remove(id).ok_or(AbiError::UnknownModel(id))?;
        tracing::info!(model = id, "model freed");
        Ok(())
    })
}

/// # Safety
/// `model` must be readable, `out` writable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_num_features(model: *const c_int, out: *mut c_int) -> c_int {
    guard(|| {
        let entry = lookup(read_int(model, "model")?)?;
        write_int(out, "out", entry.num_features())
    })
}

unsafe fn dim_impl(model: *const c_int, out: *mut c_int, kind: PredictKind) -> Result<(), AbiError> {
    let id = read_int(model, "model")?;
    let entry = lookup(id)?;
    write_int(out, "out", output_dim(&entry, id, kind)?)
}

/// Floats per row written by [`predict`].
///
/// # Safety
/// `model` must be readable, `out` writable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_output_dim(model: *const c_int, out: *mut c_int) -> c_int {
    guard(|| dim_impl(model, out, PredictKind::Value))
}

/// # Safety
/// `model` must be readable, `out` writable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_margin_dim(model: *const c_int, out: *mut c_int) -> c_int {
    guard(|| dim_impl(model, out, PredictKind::Margin))
}

/// Fails with `COCKCHAFER_ERR_PREDICT` when the model cannot produce
/// contributions.
///
/// # Safety
/// `model` must be readable, `out` writable.
#[no_mangle]
pub unsafe extern "C" fn cockchafer_contribs_dim(model: *const c_int, out: *mut c_int) -> c_int {
    guard(|| dim_impl(model, out, PredictKind::Contribs))
}

/// Message for the last failing call on this thread; `""` if it succeeded.
#[no_mangle]
pub extern "C" fn cockchafer_last_error() -> *const c_char {
    error::last_error_ptr()
}

#[no_mangle]
pub extern "C" fn cockchafer_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}
