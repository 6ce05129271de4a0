//! Handle registry: maps the `int` model handles seen by C callers to loaded models.

use anyhow::{anyhow, ensure, Context, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::model_dir;
use crate::predictor::{validate_shape, PredictKind, Prediction, Predictor};

/// Thread-safe id -> entry map. Ids are positive and never reused.
pub struct Registry<T> {
    next: AtomicI32,
    entries: RwLock<HashMap<c_int, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, value: T) -> Result<c_int> {
        let id = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .map_err(|_| anyhow!("model handle space exhausted"))?;
        self.entries.write().insert(id, Arc::new(value));
        Ok(id)
    }

    pub fn get(&self, id: c_int) -> Option<Arc<T>> {
        self.entries.read().get(&id).cloned()
    }

    /// In-flight holders of the entry keep it alive until they finish.
    pub fn remove(&self, id: c_int) -> Option<Arc<T>> {
        self.entries.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<c_int> {
        let mut ids: Vec<c_int> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// A loaded model plus the metadata C callers need to size buffers.
pub struct ModelEntry {
    source: Option<PathBuf>,
    feature_names: Option<Vec<String>>,
    num_features: usize,
    value_dim: usize,
    margin_dim: usize,
    /// `None` when the backend could not produce contributions at load time.
    contribs_dim: Option<usize>,
    predictor: Mutex<Box<dyn Predictor>>,
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("source", &self.source)
            .field("num_features", &self.num_features)
            .field("value_dim", &self.value_dim)
            .field("margin_dim", &self.margin_dim)
            .field("contribs_dim", &self.contribs_dim)
            .finish_non_exhaustive()
    }
}

impl ModelEntry {
    /// Wrap a predictor, warming it up and probing the output width of
    /// every [`PredictKind`] with all-missing rows.
    ///
    /// Value and margin must work. A failing contributions probe only
    /// disables that kind for this entry.
    pub fn new(
        mut predictor: Box<dyn Predictor>,
        source: Option<PathBuf>,
        feature_names: Option<Vec<String>>,
        warmup_iters: usize,
    ) -> Result<Self> {
        let num_features = predictor.num_features();
        ensure!(num_features > 0, "model reports zero features");
        if let Some(names) = &feature_names {
            ensure!(
                names.len() == num_features,
                "feature names len {} != model num_features {}",
                names.len(),
                num_features
            );
        }

        let row = vec![f32::NAN; num_features];
        for _ in 0..warmup_iters {
            predictor
                .predict(&row, 1, num_features, PredictKind::Value)
                .context("warmup predict")?;
        }

        let mut probe = |kind: PredictKind| -> Result<usize> {
            let out = predictor
                .predict(&row, 1, num_features, kind)
                .with_context(|| format!("probe output dim for {kind:?}"))?;
            Ok(out.per_row)
        };
        let value_dim = probe(PredictKind::Value)?;
        let margin_dim = probe(PredictKind::Margin)?;
        let contribs_dim = match probe(PredictKind::Contribs) {
            Ok(dim) => Some(dim),
            Err(e) => {
                tracing::warn!(err = %format!("{e:#}"), "contributions unavailable for this model");
                None
            }
        };

        Ok(Self {
            source,
            feature_names,
            num_features,
            value_dim,
            margin_dim,
            contribs_dim,
            predictor: Mutex::new(predictor),
        })
    }

    /// Resolve `path` (file or model dir), load it with the xgboost backend.
    #[cfg(feature = "xgb_ffi")]
    pub fn load(path: &Path, cfg: &Config) -> Result<Self> {
        let file = model_dir::resolve_model_file(path)?;
        let feature_names = model_dir::load_feature_names(path)?;
        let predictor = crate::predictor::XgbPredictor::load(&file, cfg)?;
        Self::new(Box::new(predictor), Some(file), feature_names, cfg.warmup_iters)
    }

    #[cfg(not(feature = "xgb_ffi"))]
    pub fn load(path: &Path, _cfg: &Config) -> Result<Self> {
        let file = model_dir::resolve_model_file(path)?;
        Err(anyhow!(
            "no predictor backend enabled for {}: build with feature xgb_ffi",
            file.display()
        ))
    }

    #[cfg(feature = "xgb_ffi")]
    pub fn load_from_buffer(buf: &[u8], cfg: &Config) -> Result<Self> {
        let predictor = crate::predictor::XgbPredictor::load_from_buffer(buf, cfg)?;
        Self::new(Box::new(predictor), None, None, cfg.warmup_iters)
    }

    #[cfg(not(feature = "xgb_ffi"))]
    pub fn load_from_buffer(_buf: &[u8], _cfg: &Config) -> Result<Self> {
        Err(anyhow!("no predictor backend enabled: build with feature xgb_ffi"))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn feature_names(&self) -> Option<&[String]> {
        self.feature_names.as_deref()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Floats written per input row for `kind`; `None` if the model cannot
    /// produce that kind.
    pub fn output_dim(&self, kind: PredictKind) -> Option<usize> {
        match kind {
            PredictKind::Value => Some(self.value_dim),
            PredictKind::Margin => Some(self.margin_dim),
            PredictKind::Contribs => self.contribs_dim,
        }
    }

    pub fn predict(&self, data: &[f32], nrow: usize, ncol: usize, kind: PredictKind) -> Result<Prediction> {
        validate_shape(data.len(), nrow, ncol)?;
        ensure!(
            ncol == self.num_features,
            "nfea mismatch: got={} model expects={}",
            ncol,
            self.num_features
        );

        let dim = self
            .output_dim(kind)
            .ok_or_else(|| anyhow!("{kind:?} prediction is not available for this model"))?;
        let out = self.predictor.lock().predict(data, nrow, ncol, kind)?;
        ensure!(
            out.per_row == dim && out.values.len() == nrow * dim,
            "{kind:?} output width changed: got={} expect={}",
            out.per_row,
            dim
        );
        Ok(out)
    }
}

static MODELS: OnceLock<Registry<ModelEntry>> = OnceLock::new();

/// Registry backing the C ABI handles.
pub fn models() -> &'static Registry<ModelEntry> {
    MODELS.get_or_init(Registry::new)
}
