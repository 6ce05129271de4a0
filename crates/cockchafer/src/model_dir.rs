//! Locating model files and their feature schema on disk.
//!
//! A model path may name the model file itself or a directory holding it.
//! Directory layout:
//!
//! - `xgb_model.ubj` / `xgb_model.json` / `xgb_model.bin` / `model.ubj` / `model.json`
//! - or `xgb_model_iter<N>.json` checkpoints (lowest N wins)
//! - optional `feature_names.json` (JSON array) or `features.txt` (one per line)

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const CANDIDATES: &[&str] = &[
    "xgb_model.ubj",
    "xgb_model.json",
    "xgb_model.bin",
    "model.ubj",
    "model.json",
];

pub fn resolve_model_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        bail!("model path does not exist: {}", path.display());
    }

    for name in CANDIDATES {
        let p = path.join(name);
        if p.is_file() {
            return Ok(p);
        }
    }

    let mut cands: Vec<(u32, PathBuf)> = vec![];
    let rd = fs::read_dir(path).with_context(|| format!("read model dir: {}", path.display()))?;
    for ent in rd.flatten() {
        let p = ent.path();
        if !p.is_file() {
            continue;
        }
        let name = p.file_name().and_then(|s| s.to_str()).unwrap_or("");
        let iter = name
            .strip_prefix("xgb_model_iter")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(it) = iter {
            cands.push((it, p));
        }
    }
    cands.sort_by_key(|(it, _)| *it);
    cands
        .into_iter()
        .next()
        .map(|(_, p)| p)
        .ok_or_else(|| anyhow!("no model file found in dir: {}", path.display()))
}

/// Feature names stored next to the model, if any.
///
/// `path` may be the model file or its directory.
pub fn load_feature_names(path: &Path) -> Result<Option<Vec<String>>> {
    let dir = if path.is_dir() {
        path
    } else {
        match path.parent() {
            Some(p) => p,
            None => return Ok(None),
        }
    };

    let json_path = dir.join("feature_names.json");
    if json_path.exists() {
        let s = fs::read_to_string(&json_path)
            .with_context(|| format!("read feature_names.json: {}", json_path.display()))?;
        let names: Vec<String> = serde_json::from_str(&s)
            .with_context(|| format!("parse feature_names.json: {}", json_path.display()))?;
        return Ok(Some(names));
    }

    let txt_path = dir.join("features.txt");
    if txt_path.exists() {
        let s = fs::read_to_string(&txt_path)
            .with_context(|| format!("read features.txt: {}", txt_path.display()))?;
        let names = s
            .lines()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        return Ok(Some(names));
    }

    Ok(None)
}
