use std::path::PathBuf;
use xgb_ffi::{Booster, DMatrix, PredictConfig, PredictType};

// These tests need a real model; without one they report SKIPPED on stderr
// (visible with `--nocapture`) and pass.
fn model_path(test: &str) -> Option<PathBuf> {
    match std::env::var_os("XGB_MODEL") {
        Some(p) => Some(PathBuf::from(p)),
        None => {
            eprintln!("SKIPPED {test}: set XGB_MODEL=/path/to/model.json to run");
            None
        }
    }
}

#[test]
fn smoke_predict() {
    let Some(model) = model_path("smoke_predict") else { return };
    let bst = Booster::load_from_file(&model).unwrap();
    let ncols = bst.num_features().unwrap();
    assert!(ncols > 0);

    let rows = vec![f32::NAN; ncols * 3];
    let out = bst
        .predict_dense(&rows, 3, ncols, &PredictConfig::default())
        .unwrap();
    assert_eq!(out.shape.first().copied(), Some(3));
    assert!(out.per_row(3) >= 1);
    eprintln!("shape={:?} values={:?}", out.shape, out.values);
}

#[test]
fn smoke_contribs_width() {
    let Some(model) = model_path("smoke_contribs_width") else { return };
    let bst = Booster::load_from_file(&model).unwrap();
    let ncols = bst.num_features().unwrap();

    let rows = vec![f32::NAN; ncols * 2];
    let out = bst
        .predict_dense(&rows, 2, ncols, &PredictConfig::with_kind(PredictType::Contribs))
        .unwrap();
    // one column per feature plus the bias, per output group
    let per_row = out.per_row(2);
    assert!(per_row >= ncols + 1);
    assert_eq!(per_row % (ncols + 1), 0);

    // contributions plus bias add up to the margin
    let margin = bst
        .predict_dense(&rows, 2, ncols, &PredictConfig::with_kind(PredictType::Margin))
        .unwrap();
    if margin.per_row(2) == 1 {
        let total: f32 = out.values[..per_row].iter().sum();
        assert!((total - margin.values[0]).abs() < 1e-3, "{total} vs {}", margin.values[0]);
    }
}

#[test]
fn smoke_dmatrix_predict_matches_inplace() {
    let Some(model) = model_path("smoke_dmatrix_predict_matches_inplace") else { return };
    let bst = Booster::load_from_file(&model).unwrap();
    let ncols = bst.num_features().unwrap();

    let rows = vec![f32::NAN; ncols * 3];
    let cfg = PredictConfig::default();
    let inplace = bst.predict_dense(&rows, 3, ncols, &cfg).unwrap();

    let dmat = DMatrix::from_dense(&rows, 3, ncols, f32::NAN).unwrap();
    assert_eq!(dmat.shape(), (3, ncols));
    let via_dmat = bst.predict_from_dmatrix(&dmat, &cfg.to_cstring().unwrap()).unwrap();
    assert_eq!(inplace.values, via_dmat.values);
}

#[test]
fn smoke_load_from_buffer() {
    let Some(model) = model_path("smoke_load_from_buffer") else { return };
    let bytes = std::fs::read(&model).unwrap();
    let bst = Booster::load_from_buffer(&bytes).unwrap();
    assert!(bst.num_features().unwrap() > 0);
}

#[test]
fn load_missing_file_reports_xgboost_error() {
    if model_path("load_missing_file_reports_xgboost_error").is_none() {
        return;
    }
    let err = Booster::load_from_file(std::path::Path::new("/nonexistent/model.json")).unwrap_err();
    assert!(format!("{err:#}").contains("XGBoosterLoadModel"));
}
