//! Startup configuration: environment variables plus an optional
//! `sources.toml` describing the supply-source fleet.
//!
//! Invalid configuration is fatal at startup (refusing to run rather than
//! dispatching against a fleet nobody approved), so
//! every accessor here returns `Result` and `main` exits on the first
//! error via `.context(...)`.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::solver::SourceSpec;

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint_addr: String,
    pub observer_addr: SocketAddr,
    pub tick_interval: Duration,
    pub history_capacity: usize,
    pub node_stale_after: Duration,
    pub forecast_horizon: usize,
    pub min_samples: usize,
    pub fourier_k: usize,
    pub fourier_period: f64,
    pub variance_window: usize,
    pub solve_budget: Duration,
    pub confidence_threshold: f64,
    pub oracle_url: Option<String>,
    pub oracle_timeout: Duration,
    pub pin_core: Option<usize>,
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    source: Vec<SourceToml>,
}

#[derive(Debug, Deserialize)]
struct SourceToml {
    id: u8,
    max_capacity: f64,
    cost_per_amp: f64,
    ramp_limit: f64,
    #[serde(default)]
    green: bool,
}

impl Config {
    /// Load from the process environment (optionally populated by a
    /// `.env` file) plus `SOURCES_TOML_PATH` (default `sources.toml`).
    pub fn from_env() -> Result<Self> {
        let endpoint_addr =
            env::var("ENDPOINT_ADDR").unwrap_or_else(|_| "0.0.0.0:7800".to_string());

        let observer_addr: SocketAddr = env::var("OBSERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9800".to_string())
            .parse()
            .context("invalid OBSERVER_ADDR")?;

        let tick_interval_ms: u64 = env_parse("TICK_MS", 42)?;
        let history_capacity: usize = env_parse("HISTORY_H", 200)?;
        let node_stale_after_ms: u64 = env_parse("STALE_MS", 5_000)?;
        let forecast_horizon: usize = env_parse("FORECAST_HORIZON", 12)?;
        let min_samples: usize = env_parse("MIN_SAMPLES", 32)?;
        let fourier_k: usize = env_parse("FOURIER_K", 2)?;
        let fourier_period: f64 = env_parse("FOURIER_PERIOD", 120.0)?;
        let variance_window: usize = env_parse("VARIANCE_WINDOW", 64)?;
        let solve_budget_ms: u64 = env_parse("SOLVE_BUDGET_MS", 25)?;
        let confidence_threshold: f64 = env_parse("CONFIDENCE_THRESHOLD", 0.5)?;
        let oracle_timeout_ms: u64 = env_parse("ORACLE_TIMEOUT_MS", 300)?;

        let oracle_url = env::var("ORACLE_URL").ok().filter(|s| !s.trim().is_empty());

        let pin_core = env::var("PIN_CORE")
            .ok()
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("invalid PIN_CORE")?;

        let sources_path = env::var("SOURCES_TOML_PATH").unwrap_or_else(|_| "sources.toml".into());
        let sources = load_sources(&sources_path)?;

        if sources.is_empty() {
            bail!("no supply sources configured; populate {sources_path}");
        }
        if confidence_threshold < 0.0 || confidence_threshold > 1.0 {
            bail!("CONFIDENCE_THRESHOLD must be in [0, 1], got {confidence_threshold}");
        }

        Ok(Self {
            endpoint_addr,
            observer_addr,
            tick_interval: Duration::from_millis(tick_interval_ms),
            history_capacity,
            node_stale_after: Duration::from_millis(node_stale_after_ms),
            forecast_horizon,
            min_samples,
            fourier_k,
            fourier_period,
            variance_window,
            solve_budget: Duration::from_millis(solve_budget_ms),
            confidence_threshold,
            oracle_url,
            oracle_timeout: Duration::from_millis(oracle_timeout_ms),
            pin_core,
            sources,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn load_sources(path: &str) -> Result<Vec<SourceSpec>> {
    let path = resolve_config_path(path);
    if !path.exists() {
        bail!("sources file not found: {}", path.display());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: SourcesFile =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(parsed.source.len());
    for s in parsed.source {
        if !seen.insert(s.id) {
            bail!("duplicate source id {} in {}", s.id, path.display());
        }
        if s.max_capacity < 0.0 || s.ramp_limit < 0.0 || s.cost_per_amp < 0.0 {
            bail!("source {} has a negative field in {}", s.id, path.display());
        }
        out.push(SourceSpec {
            source_id: s.id,
            max_capacity: s.max_capacity,
            cost_per_amp: s.cost_per_amp,
            ramp_limit: s.ramp_limit,
            green: s.green,
        });
    }
    Ok(out)
}

/// Relative paths resolve against the crate root, not the caller's cwd,
/// so the daemon behaves the same regardless of where it's launched from.
fn resolve_config_path(raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    Path::new(env!("CARGO_MANIFEST_DIR")).join(p)
}

/// Load a `.env` file if present, mirroring the layered search the rest
/// of this codebase's ancestors use (cwd, then crate root).
pub fn load_dotenv() {
    let _ = dotenv::dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let _ = dotenv::from_path(manifest_dir.join(".env"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_source_ids() {
        let dir = std::env::temp_dir().join(format!("microgrid-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("dup_sources.toml");
        fs::write(
            &file,
            r#"
            [[source]]
            id = 1
            max_capacity = 10.0
            cost_per_amp = 0.1
            ramp_limit = 1.0

            [[source]]
            id = 1
            max_capacity = 5.0
            cost_per_amp = 0.2
            ramp_limit = 1.0
            "#,
        )
        .unwrap();

        let result = load_sources(file.to_str().unwrap());
        assert!(result.is_err());
        fs::remove_file(&file).ok();
    }

    #[test]
    fn loads_valid_sources() {
        let dir = std::env::temp_dir().join(format!("microgrid-test-ok-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sources.toml");
        fs::write(
            &file,
            r#"
            [[source]]
            id = 1
            max_capacity = 10.0
            cost_per_amp = 0.1
            ramp_limit = 1.0
            green = true
            "#,
        )
        .unwrap();

        let sources = load_sources(file.to_str().unwrap()).unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].green);
        fs::remove_file(&file).ok();
    }
}
