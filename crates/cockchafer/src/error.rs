//! Status codes and per-thread error messages for the C ABI.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};

pub const OK: c_int = 0;
pub const ERR_NULL_POINTER: c_int = -1;
pub const ERR_INVALID_DIMS: c_int = -2;
pub const ERR_UNKNOWN_MODEL: c_int = -3;
pub const ERR_PREDICT: c_int = -4;
pub const ERR_OUTPUT_SHAPE: c_int = -5;
pub const ERR_INVALID_ARGUMENT: c_int = -6;
pub const ERR_PANIC: c_int = -7;
pub const ERR_LOAD: c_int = -8;

#[derive(Debug)]
pub enum AbiError {
    NullPointer(&'static str),
    InvalidDims(String),
    UnknownModel(c_int),
    Predict(anyhow::Error),
    OutputShape(String),
    InvalidArgument(String),
    Panic(String),
    Load(anyhow::Error),
}

impl AbiError {
    pub fn code(&self) -> c_int {
        match self {
            AbiError::NullPointer(_) => ERR_NULL_POINTER,
            AbiError::InvalidDims(_) => ERR_INVALID_DIMS,
            AbiError::UnknownModel(_) => ERR_UNKNOWN_MODEL,
            AbiError::Predict(_) => ERR_PREDICT,
            AbiError::OutputShape(_) => ERR_OUTPUT_SHAPE,
            AbiError::InvalidArgument(_) => ERR_INVALID_ARGUMENT,
            AbiError::Panic(_) => ERR_PANIC,
            AbiError::Load(_) => ERR_LOAD,
        }
    }
}

impl std::fmt::Display for AbiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbiError::NullPointer(what) => write!(f, "null pointer: {what}"),
            AbiError::InvalidDims(msg) => write!(f, "invalid dimensions: {msg}"),
            AbiError::UnknownModel(id) => write!(f, "unknown model handle: {id}"),
            AbiError::Predict(e) => write!(f, "predict failed: {e:#}"),
            AbiError::OutputShape(msg) => write!(f, "output shape mismatch: {msg}"),
            AbiError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            AbiError::Panic(msg) => write!(f, "panic: {msg}"),
            AbiError::Load(e) => write!(f, "load failed: {e:#}"),
        }
    }
}

impl std::error::Error for AbiError {}

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

pub fn set_last_error(err: &AbiError) {
    // Interior NULs would truncate the C string; replace them.
    let msg = err.to_string().replace('\0', "\\0");
    let msg = CString::new(msg).unwrap_or_default();
    LAST_ERROR.with(|cell| *cell.borrow_mut() = msg);
}

pub fn clear_last_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = CString::default());
}

/// Pointer valid until the next ABI call on this thread.
pub fn last_error_ptr() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ptr())
}

pub fn last_error_message() -> String {
    LAST_ERROR.with(|cell| cell.borrow().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn codes_are_distinct_and_negative() {
        let errs = [
            AbiError::NullPointer("x"),
            AbiError::InvalidDims("x".into()),
            AbiError::UnknownModel(3),
            AbiError::Predict(anyhow::anyhow!("x")),
            AbiError::OutputShape("x".into()),
            AbiError::InvalidArgument("x".into()),
            AbiError::Panic("x".into()),
            AbiError::Load(anyhow::anyhow!("x")),
        ];
        let mut codes: Vec<c_int> = errs.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn last_error_roundtrips_through_c_string() {
        set_last_error(&AbiError::UnknownModel(42));
        let msg = unsafe { CStr::from_ptr(last_error_ptr()) }.to_str().unwrap().to_string();
        assert_eq!(msg, "unknown model handle: 42");

        clear_last_error();
        assert_eq!(last_error_message(), "");
    }

    #[test]
    fn interior_nul_is_escaped() {
        set_last_error(&AbiError::InvalidArgument("a\0b".into()));
        assert_eq!(last_error_message(), "invalid argument: a\\0b");
    }

    #[test]
    fn last_error_is_per_thread() {
        set_last_error(&AbiError::NullPointer("feature"));
        let other = std::thread::spawn(last_error_message).join().unwrap();
        assert_eq!(other, "");
        assert_eq!(last_error_message(), "null pointer: feature");
    }

    #[test]
    fn context_chain_is_rendered() {
        let e = anyhow::anyhow!("xgboost: bad shape").context("XGBoosterPredictFromDense");
        let msg = AbiError::Predict(e).to_string();
        assert!(msg.contains("XGBoosterPredictFromDense"));
        assert!(msg.contains("bad shape"));
    }
}
