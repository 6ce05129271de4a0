use anyhow::{anyhow, ensure, Result};

#[cfg(feature = "xgb_ffi")]
use crate::config::Config;
#[cfg(feature = "xgb_ffi")]
use anyhow::Context;
#[cfg(feature = "xgb_ffi")]
use std::path::Path;
#[cfg(feature = "xgb_ffi")]
use xgb_ffi::{Booster, PredictConfig, PredictType};

/// What a prediction call returns per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredictKind {
    /// Transformed output (e.g. probability for logistic objectives).
    Value,
    /// Raw margin, before the objective's transform.
    Margin,
    /// SHAP contributions: one column per feature plus a trailing bias, per output group.
    Contribs,
}

impl PredictKind {
    pub const ALL: [PredictKind; 3] = [PredictKind::Value, PredictKind::Margin, PredictKind::Contribs];
}

/// Row-major prediction result: `values.len() == nrow * per_row`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub values: Vec<f32>,
    pub per_row: usize,
}

impl Prediction {
    pub fn from_flat(values: Vec<f32>, nrow: usize) -> Result<Self> {
        ensure!(nrow > 0, "prediction for zero rows");
        ensure!(
            !values.is_empty() && values.len() % nrow == 0,
            "prediction len {} is not a multiple of nrow={}",
            values.len(),
            nrow
        );
        let per_row = values.len() / nrow;
        Ok(Self { values, per_row })
    }

    pub fn nrow(&self) -> usize {
        if self.per_row == 0 {
            0
        } else {
            self.values.len() / self.per_row
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.values[i * self.per_row..(i + 1) * self.per_row]
    }
}

/// A loaded model that can score dense row-major `f32` matrices.
///
/// Implementations are `Send` but need not be `Sync`: the registry and the
/// pool serialize calls per instance.
pub trait Predictor: Send {
    fn num_features(&self) -> usize;

    fn predict(&mut self, data: &[f32], nrow: usize, ncol: usize, kind: PredictKind) -> Result<Prediction>;
}

/// Check a flat buffer against its declared shape; returns `nrow * ncol`.
pub fn validate_shape(data_len: usize, nrow: usize, ncol: usize) -> Result<usize> {
    ensure!(nrow > 0, "nrow must be > 0");
    ensure!(ncol > 0, "ncol must be > 0");
    let need = nrow
        .checked_mul(ncol)
        .ok_or_else(|| anyhow!("matrix shape overflows: {nrow}x{ncol}"))?;
    ensure!(
        data_len == need,
        "feature len mismatch: got={} expect={}x{}={}",
        data_len,
        nrow,
        ncol,
        need
    );
    Ok(need)
}

/// [`Predictor`] backed by libxgboost.
#[cfg(feature = "xgb_ffi")]
pub struct XgbPredictor {
    booster: Booster,
    num_features: usize,
    missing: f32,
}

#[cfg(feature = "xgb_ffi")]
impl XgbPredictor {
    pub fn load(path: &Path, cfg: &Config) -> Result<Self> {
        let booster = Booster::load_from_file(path)
            .with_context(|| format!("load xgboost model: {}", path.display()))?;
        Self::from_booster(booster, cfg)
    }

    pub fn load_from_buffer(buf: &[u8], cfg: &Config) -> Result<Self> {
        let booster = Booster::load_from_buffer(buf).context("load xgboost model from buffer")?;
        Self::from_booster(booster, cfg)
    }

    fn from_booster(mut booster: Booster, cfg: &Config) -> Result<Self> {
        if cfg.nthread > 0 {
            booster.set_param("nthread", &cfg.nthread.to_string())?;
        }
        let num_features = booster.num_features()?;
        ensure!(num_features > 0, "xgboost model reports zero features");
        Ok(Self {
            booster,
            num_features,
            missing: cfg.missing,
        })
    }
}

#[cfg(feature = "xgb_ffi")]
impl Predictor for XgbPredictor {
    fn num_features(&self) -> usize {
        self.num_features
    }

    fn predict(&mut self, data: &[f32], nrow: usize, ncol: usize, kind: PredictKind) -> Result<Prediction> {
        let mut cfg = PredictConfig::with_kind(match kind {
            PredictKind::Value => PredictType::Value,
            PredictKind::Margin => PredictType::Margin,
            PredictKind::Contribs => PredictType::Contribs,
        });
        cfg.missing = self.missing;
        let out = self.booster.predict_dense(data, nrow, ncol, &cfg)?;
        Prediction::from_flat(out.values, nrow)
    }
}
