use anyhow::{ensure, Context};
use clap::Parser;
use cockchafer::config::Config;
use cockchafer::predictor::PredictKind;
use cockchafer::registry::ModelEntry;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Score rows with an xgboost model.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Model file, or a directory holding xgb_model.{ubj,json,bin}
    #[arg(long)]
    model: PathBuf,

    /// JSON array of rows (arrays of numbers; null = missing)
    #[arg(long)]
    input: PathBuf,

    /// Output untransformed margins
    #[arg(long, conflicts_with = "contribs")]
    margin: bool,

    /// Output SHAP contributions (bias last)
    #[arg(long)]
    contribs: bool,

    /// Print only the k largest |contributions| per row, by feature name
    #[arg(long, requires = "contribs")]
    topk: Option<usize>,

    /// xgboost nthread (0 = library default)
    #[arg(long)]
    nthread: Option<u32>,
}

fn read_rows(path: &Path, ncol: usize) -> anyhow::Result<(Vec<f32>, usize)> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read input: {}", path.display()))?;
    let rows: Vec<Vec<Option<f32>>> =
        serde_json::from_str(&s).with_context(|| format!("parse input: {}", path.display()))?;
    ensure!(!rows.is_empty(), "input has no rows");

    let mut flat = Vec::with_capacity(rows.len() * ncol);
    for (i, row) in rows.iter().enumerate() {
        ensure!(row.len() == ncol, "row {i} has {} values, model expects {ncol}", row.len());
        flat.extend(row.iter().map(|v| v.unwrap_or(f32::NAN)));
    }
    Ok((flat, rows.len()))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = Config::from_env()?;
    if let Some(n) = args.nthread {
        cfg.nthread = n;
    }
    cockchafer::logging::init(&cfg.log_filter);

    let (major, minor, patch) = xgb_ffi::xgboost_version();
    tracing::debug!(xgboost = %format!("{major}.{minor}.{patch}"), "linked libxgboost");

    let entry = ModelEntry::load(&args.model, &cfg)?;
    let ncol = entry.num_features();
    let (data, nrow) = read_rows(&args.input, ncol)?;

    let kind = if args.contribs {
        PredictKind::Contribs
    } else if args.margin {
        PredictKind::Margin
    } else {
        PredictKind::Value
    };
    let out = entry.predict(&data, nrow, ncol, kind)?;

    let rows: Vec<Value> = (0..nrow)
        .map(|i| {
            let row = out.row(i);
            match args.topk {
                Some(k) => {
                    let mut named: Vec<(String, f32)> = row
                        .iter()
                        .take(ncol)
                        .enumerate()
                        .map(|(j, &v)| {
                            let name = entry
                                .feature_names()
                                .and_then(|n| n.get(j))
                                .cloned()
                                .unwrap_or_else(|| format!("f{j}"));
                            (name, v)
                        })
                        .collect();
                    named.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
                    named.truncate(k);
                    json!(named
                        .into_iter()
                        .map(|(name, v)| json!({ "feature": name, "value": v }))
                        .collect::<Vec<_>>())
                }
                None => json!(row),
            }
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "xgboost": format!("{major}.{minor}.{patch}"),
            "model": entry.source().map(|p| p.display().to_string()),
            "kind": format!("{kind:?}").to_lowercase(),
            "per_row": out.per_row,
            "rows": rows,
        }))?
    );
    Ok(())
}
