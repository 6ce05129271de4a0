use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::OnceLock;

pub const ENV_NTHREAD: &str = "COCKCHAFER_NTHREAD";
pub const ENV_WARMUP_ITERS: &str = "COCKCHAFER_WARMUP_ITERS";
pub const ENV_MISSING: &str = "COCKCHAFER_MISSING";
pub const ENV_LOG: &str = "COCKCHAFER_LOG";

/// Runtime configuration shared by every model loaded through the C ABI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// xgboost `nthread` for each booster; 0 keeps the library default.
    pub nthread: u32,

    /// One-row predictions run right after load, before the handle is handed out.
    pub warmup_iters: usize,

    /// Value treated as missing in feature matrices (NaN is always missing too).
    pub missing: f32,

    /// `tracing_subscriber::EnvFilter` directive.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nthread: 0,
            warmup_iters: 1,
            missing: f32::NAN,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build a config from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = parse_key(&lookup, ENV_NTHREAD)? {
            cfg.nthread = v;
        }
        if let Some(v) = parse_key(&lookup, ENV_WARMUP_ITERS)? {
            cfg.warmup_iters = v;
        }
        if let Some(v) = parse_key(&lookup, ENV_MISSING)? {
            cfg.missing = v;
        }
        if let Some(v) = lookup(ENV_LOG) {
            cfg.log_filter = v;
        }
        Ok(cfg)
    }
}

fn parse_key<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key}={raw:?}")),
    }
}

static GLOBAL: OnceLock<Config> = OnceLock::new();

/// Process-wide config, read from the environment on first use.
///
/// A malformed variable falls back to defaults and is reported once.
pub fn global() -> &'static Config {
    GLOBAL.get_or_init(|| match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(err = %format!("{e:#}"), "bad cockchafer env config, using defaults");
            Config::default()
        }
    })
}
