//! Configuration for quorum paths.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (QUORUM_HOME, QUORUM_CACHE)
//! 2. Config file (.quorum/config.yaml)
//! 3. Defaults (~/.quorum)
//!
//! Config file discovery:
//! - Searches current directory and parents for .quorum/config.yaml
//! - `home` is relative to the .quorum/ directory, other paths are
//!   relative to the project root (the parent of .quorum/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Coordinator state directory (relative to .quorum/)
    pub home: Option<String>,
    /// Shared cache directory
    pub cache: Option<String>,
    /// Pipeline definitions directory
    pub pipelines: Option<String>,
    /// Default conflict policy file
    pub policy: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Coordinator state (runs live under it)
    pub home: PathBuf,
    pub cache: PathBuf,
    pub pipelines: PathBuf,
    pub policy: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Locate a pipeline by name or path
    pub fn pipeline_path(&self, name_or_path: &str) -> PathBuf {
        let direct = PathBuf::from(name_or_path);
        if direct.extension().is_some() || direct.components().count() > 1 {
            return direct;
        }
        self.pipelines.join(format!("{}.yaml", name_or_path))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".quorum").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    let parsed = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };
    resolve(config_file, parsed.map(|c| c.paths).unwrap_or_default())
}

fn resolve(config_file: Option<PathBuf>, paths: PathsConfig) -> Result<ResolvedConfig> {
    let quorum_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let project_root = quorum_dir
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = match (env_path("QUORUM_HOME"), &paths.home, &quorum_dir) {
        (Some(home), _, _) => home,
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".quorum"),
    };

    let relative = |value: &Option<String>| -> Option<PathBuf> {
        match (value, &project_root) {
            (Some(v), Some(root)) => Some(resolve_path(root, v)),
            _ => None,
        }
    };

    let cache = env_path("QUORUM_CACHE")
        .or_else(|| relative(&paths.cache))
        .unwrap_or_else(|| home.join("cache"));
    let pipelines = relative(&paths.pipelines).unwrap_or_else(|| home.join("pipelines"));
    let policy = relative(&paths.policy).unwrap_or_else(|| home.join("policy.yaml"));

    Ok(ResolvedConfig {
        home,
        cache,
        pipelines,
        policy,
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($QUORUM_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

/// Get the shared cache directory
pub fn cache_dir() -> Result<PathBuf> {
    Ok(config()?.cache.clone())
}

/// Get the default policy path
pub fn policy_path() -> Result<PathBuf> {
    Ok(config()?.policy.clone())
}
