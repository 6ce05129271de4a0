use cockchafer::abi::*;
use cockchafer::error::*;
use cockchafer::predictor::{validate_shape, PredictKind, Prediction, Predictor};
use cockchafer::registry::{models, ModelEntry};
use std::ffi::{CStr, CString};
use std::os::raw::c_int;
use std::ptr;

/// Per row: value = [sum, -sum], margin = [sum], contribs = features then bias 1.0.
struct SumPredictor {
    ncol: usize,
}

impl Predictor for SumPredictor {
    fn num_features(&self) -> usize {
        self.ncol
    }

    fn predict(&mut self, data: &[f32], nrow: usize, ncol: usize, kind: PredictKind) -> anyhow::Result<Prediction> {
        validate_shape(data.len(), nrow, ncol)?;
        let mut out = Vec::new();
        for row in data.chunks_exact(ncol) {
            let sum: f32 = row.iter().filter(|x| !x.is_nan()).sum();
            match kind {
                PredictKind::Value => out.extend([sum, -sum]),
                PredictKind::Margin => out.push(sum),
                PredictKind::Contribs => {
                    out.extend(row.iter().map(|x| if x.is_nan() { 0.0 } else { *x }));
                    out.push(1.0);
                }
            }
        }
        Prediction::from_flat(out, nrow)
    }
}

/// [`SumPredictor`] that rejects contributions like xgboost's in-place predict.
struct NoContribs(SumPredictor);

impl Predictor for NoContribs {
    fn num_features(&self) -> usize {
        self.0.num_features()
    }

    fn predict(&mut self, data: &[f32], nrow: usize, ncol: usize, kind: PredictKind) -> anyhow::Result<Prediction> {
        anyhow::ensure!(kind != PredictKind::Contribs, "Unsupported prediction type:2");
        self.0.predict(data, nrow, ncol, kind)
    }
}

fn register(ncol: usize) -> c_int {
    let entry = ModelEntry::new(Box::new(SumPredictor { ncol }), None, None, 1).unwrap();
    models().insert(entry).unwrap()
}

fn last_error() -> String {
    unsafe { CStr::from_ptr(cockchafer_last_error()) }
        .to_string_lossy()
        .into_owned()
}

#[test]
fn predict_symbol_matches_declaration() {
    // int predict(int *model, float *feature, int *nrow, int *nfea, float *output);
    let f: unsafe extern "C" fn(*mut c_int, *mut f32, *mut c_int, *mut c_int, *mut f32) -> c_int = predict;
    let _ = f;
}

#[test]
fn predict_writes_all_rows() {
    let mut id = register(3);
    let mut feature = vec![1.0, 2.0, 3.0, f32::NAN, 5.0, -1.0];
    let (mut nrow, mut nfea) = (2, 3);

    let mut dim = 0;
    assert_eq!(unsafe { cockchafer_output_dim(&id, &mut dim) }, OK);
    assert_eq!(dim, 2);

    let mut output = vec![0.0f32; (nrow * dim) as usize];
    let rc = unsafe {
        predict(
            &mut id,
            feature.as_mut_ptr(),
            &mut nrow,
            &mut nfea,
            output.as_mut_ptr(),
        )
    };
    assert_eq!(rc, OK, "{}", last_error());
    assert_eq!(output, vec![6.0, -6.0, 4.0, -4.0]);
    assert_eq!(last_error(), "");
}

#[test]
fn margin_and_contribs_use_their_own_dims() {
    let id = register(2);
    let feature = [1.0f32, f32::NAN];
    let (nrow, nfea) = (1, 2);

    let (mut mdim, mut cdim, mut nf) = (0, 0, 0);
    unsafe {
        assert_eq!(cockchafer_margin_dim(&id, &mut mdim), OK);
        assert_eq!(cockchafer_contribs_dim(&id, &mut cdim), OK);
        assert_eq!(cockchafer_num_features(&id, &mut nf), OK);
    }
    assert_eq!((mdim, cdim, nf), (1, 3, 2));

    let mut margin = vec![0.0f32; mdim as usize];
    let rc = unsafe { cockchafer_predict_margin(&id, feature.as_ptr(), &nrow, &nfea, margin.as_mut_ptr()) };
    assert_eq!(rc, OK);
    assert_eq!(margin, vec![1.0]);

    let mut contribs = vec![0.0f32; cdim as usize];
    let rc = unsafe { cockchafer_predict_contribs(&id, feature.as_ptr(), &nrow, &nfea, contribs.as_mut_ptr()) };
    assert_eq!(rc, OK);
    assert_eq!(contribs, vec![1.0, 0.0, 1.0]);
}

#[test]
fn null_pointers_are_rejected() {
    let mut id = register(1);
    let mut feature = [1.0f32];
    let (mut nrow, mut nfea) = (1, 1);
    let mut output = [0.0f32; 2];

    let rc = unsafe { predict(ptr::null_mut(), feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, ERR_NULL_POINTER);
    assert!(last_error().contains("model"));

    let rc = unsafe { predict(&mut id, ptr::null_mut(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, ERR_NULL_POINTER);
    assert!(last_error().contains("feature"));

    let rc = unsafe { predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, ptr::null_mut()) };
    assert_eq!(rc, ERR_NULL_POINTER);
    assert!(last_error().contains("output"));

    let rc = unsafe { cockchafer_output_dim(&id, ptr::null_mut()) };
    assert_eq!(rc, ERR_NULL_POINTER);
}

#[test]
fn bad_dims_are_rejected_before_reading() {
    let mut id = register(2);
    let mut feature = [1.0f32, 2.0];
    let mut output = [0.0f32; 2];

    for (mut nrow, mut nfea) in [(0, 2), (1, -1), (1, 3)] {
        let rc = unsafe { predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
        assert_eq!(rc, ERR_INVALID_DIMS, "nrow={nrow} nfea={nfea}");
    }
    assert!(last_error().contains("expects 2"));
    assert_eq!(output, [0.0, 0.0]);
}

#[test]
fn unknown_and_freed_handles() {
    let mut bogus: c_int = -5;
    let mut feature = [1.0f32];
    let (mut nrow, mut nfea) = (1, 1);
    let mut output = [0.0f32; 2];
    let rc = unsafe { predict(&mut bogus, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, ERR_UNKNOWN_MODEL);
    assert_eq!(last_error(), "unknown model handle: -5");

    let mut id = register(1);
    assert_eq!(unsafe { cockchafer_free_model(&id) }, OK);
    assert_eq!(unsafe { cockchafer_free_model(&id) }, ERR_UNKNOWN_MODEL);
    let rc = unsafe { predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, ERR_UNKNOWN_MODEL);
}

#[test]
fn oversized_buffers_are_rejected() {
    let mut id = register(2);
    let mut feature = [1.0f32, 2.0];
    let mut output = [0.0f32; 2];
    let (mut nrow, mut nfea) = (c_int::MAX, c_int::MAX);
    let rc = unsafe { predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, ERR_INVALID_DIMS);
    assert!(last_error().contains("overflows"), "{}", last_error());
}

#[test]
fn model_without_contribs_serves_values() {
    let entry = ModelEntry::new(Box::new(NoContribs(SumPredictor { ncol: 2 })), None, None, 1).unwrap();
    let mut id = models().insert(entry).unwrap();

    let mut cdim = -1;
    assert_eq!(unsafe { cockchafer_contribs_dim(&id, &mut cdim) }, ERR_PREDICT);
    assert!(last_error().contains("contribs prediction is not available"));
    assert_eq!(cdim, -1);

    let mut feature = [1.0f32, 2.0];
    let (mut nrow, mut nfea) = (1, 2);
    let mut output = [0.0f32; 3];
    let rc = unsafe { cockchafer_predict_contribs(&id, feature.as_ptr(), &nrow, &nfea, output.as_mut_ptr()) };
    assert_eq!(rc, ERR_PREDICT);
    assert_eq!(output, [0.0; 3]);

    let rc = unsafe { predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, OK, "{}", last_error());
    assert_eq!(output[..2], [3.0, -3.0]);
}

#[test]
fn freed_model_outlives_inflight_holders() {
    let id = register(2);
    let held = models().get(id).unwrap();
    assert_eq!(unsafe { cockchafer_free_model(&id) }, OK);
    assert!(models().get(id).is_none());

    let out = held.predict(&[1.0, 2.0, 3.0, 4.0], 2, 2, PredictKind::Value).unwrap();
    assert_eq!(out.values, vec![3.0, -3.0, 7.0, -7.0]);
}

#[test]
fn concurrent_callers_share_a_model() {
    let id = register(4);
    let handles: Vec<_> = (0..8)
        .map(|t| {
            std::thread::spawn(move || {
                let mut id = id;
                let mut feature = vec![t as f32; 4 * 16];
                let (mut nrow, mut nfea) = (16, 4);
                let mut output = vec![0.0f32; 32];
                let rc = unsafe {
                    predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr())
                };
                assert_eq!(rc, OK);
                assert!(output.chunks(2).all(|c| c == [4.0 * t as f32, -4.0 * t as f32]));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn load_model_argument_errors() {
    let mut id: c_int = 0;
    assert_eq!(unsafe { cockchafer_load_model(ptr::null(), &mut id) }, ERR_NULL_POINTER);

    let empty = CString::new("").unwrap();
    assert_eq!(unsafe { cockchafer_load_model(empty.as_ptr(), &mut id) }, ERR_INVALID_ARGUMENT);

    let bad_utf8 = CString::new(vec![0xffu8, 0xfe]).unwrap();
    assert_eq!(unsafe { cockchafer_load_model(bad_utf8.as_ptr(), &mut id) }, ERR_INVALID_ARGUMENT);

    let missing = CString::new("/nonexistent/cockchafer/model.json").unwrap();
    assert_eq!(unsafe { cockchafer_load_model(missing.as_ptr(), &mut id) }, ERR_LOAD);
    assert!(last_error().contains("does not exist"));
    assert_eq!(id, 0);

    let buf = [1u8, 2, 3];
    assert_eq!(unsafe { cockchafer_load_model_from_buffer(buf.as_ptr().cast(), 0, &mut id) }, ERR_INVALID_ARGUMENT);
    assert_eq!(unsafe { cockchafer_load_model_from_buffer(ptr::null(), 3, &mut id) }, ERR_NULL_POINTER);
}

#[cfg(not(feature = "xgb_ffi"))]
#[test]
fn load_model_without_backend_explains_feature() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("xgb_model.json"), b"{}").unwrap();
    let path = CString::new(tmp.path().to_str().unwrap()).unwrap();
    let mut id: c_int = 0;
    assert_eq!(unsafe { cockchafer_load_model(path.as_ptr(), &mut id) }, ERR_LOAD);
    assert!(last_error().contains("xgb_ffi"));
}

#[cfg(feature = "xgb_ffi")]
#[test]
fn xgboost_model_roundtrip_through_abi() {
    let Some(model) = std::env::var_os("XGB_MODEL") else {
        eprintln!("SKIPPED xgboost_model_roundtrip_through_abi: set XGB_MODEL=/path/to/model.json to run");
        return;
    };
    let path = CString::new(model.to_str().unwrap()).unwrap();
    let mut id: c_int = 0;
    assert_eq!(unsafe { cockchafer_load_model(path.as_ptr(), &mut id) }, OK, "{}", last_error());
    assert!(id > 0);

    let (mut nfea, mut dim) = (0, 0);
    unsafe {
        assert_eq!(cockchafer_num_features(&id, &mut nfea), OK);
        assert_eq!(cockchafer_output_dim(&id, &mut dim), OK);
    }
    let mut nrow = 4;
    let mut feature = vec![f32::NAN; (nrow * nfea) as usize];
    let mut output = vec![f32::NAN; (nrow * dim) as usize];
    let rc = unsafe { predict(&mut id, feature.as_mut_ptr(), &mut nrow, &mut nfea, output.as_mut_ptr()) };
    assert_eq!(rc, OK, "{}", last_error());
    assert!(output.iter().all(|v| v.is_finite()));
    // identical all-missing rows score identically
    assert!(output.chunks(dim as usize).all(|c| c == &output[..dim as usize]));

    // contributions go through a DMatrix, one column per feature plus bias
    let mut cdim = 0;
    assert_eq!(unsafe { cockchafer_contribs_dim(&id, &mut cdim) }, OK, "{}", last_error());
    assert_eq!(cdim % (nfea + 1), 0);
    let mut contribs = vec![f32::NAN; (nrow * cdim) as usize];
    let rc = unsafe { cockchafer_predict_contribs(&id, feature.as_ptr(), &nrow, &nfea, contribs.as_mut_ptr()) };
    assert_eq!(rc, OK, "{}", last_error());
    assert!(contribs.iter().all(|v| v.is_finite()));

    assert_eq!(unsafe { cockchafer_free_model(&id) }, OK);
}
