//! Content-hash keyed, TTL-bounded cache of stage records.
//!
//! Entries live at `<root>/<stage_id>/<input_hash>.json`. A lookup reports
//! hit, miss, expired or corrupt explicitly; only a hit ever yields a
//! record, so stale data is never served silently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{CacheStatus, OutputRecord};

use super::inputs::DeclaredInput;

/// Errors raised by cache writes and maintenance
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid cache key component: '{0}'")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A persisted cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub stage_id: String,
    pub input_hash: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub record: OutputRecord,
}

impl CacheEntry {
    /// Valid iff `now - created_at < ttl`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let age_ms = now.signed_duration_since(self.created_at).num_milliseconds();
        let ttl_ms = i64::try_from(self.ttl_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        age_ms < ttl_ms
    }

    pub fn age_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_seconds()
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Present and within its TTL
    Hit(OutputRecord),

    /// No entry for this key
    Miss,

    /// Present but older than its TTL
    Expired { age_seconds: i64 },

    /// Present but unreadable or inconsistent with its key
    Corrupt { reason: String },
}

impl CacheLookup {
    pub fn into_record(self) -> Option<OutputRecord> {
        match self {
            CacheLookup::Hit(record) => Some(record),
            _ => None,
        }
    }

    pub fn status(&self) -> CacheStatus {
        match self {
            CacheLookup::Hit(_) => CacheStatus::Hit,
            CacheLookup::Miss => CacheStatus::Miss,
            CacheLookup::Expired { .. } => CacheStatus::Expired,
            CacheLookup::Corrupt { .. } => CacheStatus::Corrupt,
        }
    }
}

/// Diagnostic counts; never used to gate behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub corrupt: usize,
}

/// File-based cache store
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `root` (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the store in the configured cache directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::config::cache_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, stage_id: &str, input_hash: &str) -> Result<PathBuf, CacheError> {
        if !is_safe_component(stage_id) {
            return Err(CacheError::InvalidKey(stage_id.to_string()));
        }
        if input_hash.is_empty() || !input_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidKey(input_hash.to_string()));
        }
        Ok(self
            .root
            .join(stage_id)
            .join(format!("{}.json", input_hash)))
    }

    /// Look up an entry against the current time
    pub async fn lookup(&self, stage_id: &str, input_hash: &str) -> CacheLookup {
        self.lookup_at(stage_id, input_hash, Utc::now()).await
    }

    /// Look up an entry as of `now`
    pub async fn lookup_at(&self, stage_id: &str, input_hash: &str, now: DateTime<Utc>) -> CacheLookup {
        let path = match self.entry_path(stage_id, input_hash) {
            Ok(path) => path,
            Err(e) => return CacheLookup::Corrupt { reason: e.to_string() },
        };

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheLookup::Miss,
            Err(e) => {
                warn!(stage = %stage_id, path = %path.display(), error = %e, "Unreadable cache entry");
                return CacheLookup::Corrupt { reason: e.to_string() };
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(stage = %stage_id, path = %path.display(), error = %e, "Corrupt cache entry");
                return CacheLookup::Corrupt { reason: e.to_string() };
            }
        };

        if entry.stage_id != stage_id
            || entry.input_hash != input_hash
            || entry.record.stage_id() != stage_id
        {
            return CacheLookup::Corrupt {
                reason: format!(
                    "Entry key {}:{} does not match requested {}:{}",
                    entry.stage_id, entry.input_hash, stage_id, input_hash
                ),
            };
        }

        if !entry.is_valid_at(now) {
            debug!(stage = %stage_id, digest = %input_hash, "Cache entry expired");
            return CacheLookup::Expired {
                age_seconds: entry.age_seconds_at(now),
            };
        }

        CacheLookup::Hit(entry.record)
    }

    /// Return the cached record only if present and unexpired
    pub async fn get(&self, stage_id: &str, input_hash: &str) -> Option<OutputRecord> {
        self.lookup(stage_id, input_hash).await.into_record()
    }

    /// Store or overwrite an entry (last writer wins)
    pub async fn set(
        &self,
        stage_id: &str,
        input_hash: &str,
        record: &OutputRecord,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.set_at(stage_id, input_hash, record, ttl, Utc::now()).await
    }

    /// Store an entry with an explicit creation time
    pub async fn set_at(
        &self,
        stage_id: &str,
        input_hash: &str,
        record: &OutputRecord,
        ttl: Duration,
        created_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        if record.stage_id() != stage_id {
            return Err(CacheError::InvalidKey(format!(
                "record for '{}' stored under '{}'",
                record.stage_id(),
                stage_id
            )));
        }

        let path = self.entry_path(stage_id, input_hash)?;
        let entry = CacheEntry {
            stage_id: stage_id.to_string(),
            input_hash: input_hash.to_string(),
            created_at,
            ttl_seconds: ttl.as_secs(),
            record: record.clone(),
        };

        let dir = self.root.join(stage_id);
        fs::create_dir_all(&dir).await?;

        // Write beside the target and rename so readers never see half an entry
        let tmp_path = dir.join(format!(".{}.{}.tmp", input_hash, Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(&entry)?;
        fs::write(&tmp_path, json).await?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(stage = %stage_id, digest = %input_hash, "Cache entry written");
        Ok(())
    }

    /// Count entries by freshness
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.stats_at(Utc::now()).await
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        for path in self.entry_files(None).await? {
            stats.total += 1;
            let parsed = fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|c| serde_json::from_str::<CacheEntry>(&c).ok());
            match parsed {
                Some(entry) if entry.is_valid_at(now) => stats.valid += 1,
                Some(_) => stats.expired += 1,
                None => stats.corrupt += 1,
            }
        }

        Ok(stats)
    }

    /// Evict every entry for one stage, or the whole cache
    pub async fn clear(&self, stage_id: Option<&str>) -> Result<usize, CacheError> {
        if let Some(stage) = stage_id {
            if !is_safe_component(stage) {
                return Err(CacheError::InvalidKey(stage.to_string()));
            }
        }

        let files = self.entry_files(stage_id).await?;
        let removed = files.len();

        let dirs: Vec<PathBuf> = match stage_id {
            Some(stage) => vec![self.root.join(stage)],
            None => self.stage_dirs().await?,
        };
        for dir in dirs {
            if fs::try_exists(&dir).await? {
                fs::remove_dir_all(&dir).await?;
            }
        }

        Ok(removed)
    }

    async fn stage_dirs(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut dirs = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(dirs);
        }

        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn entry_files(&self, stage_id: Option<&str>) -> Result<Vec<PathBuf>, CacheError> {
        let dirs = match stage_id {
            Some(stage) => vec![self.root.join(stage)],
            None => self.stage_dirs().await?,
        };

        let mut files = Vec::new();
        for dir in dirs {
            if !fs::try_exists(&dir).await? {
                continue;
            }
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    if name.ends_with(".json") && !name.starts_with('.') {
                        files.push(entry.path());
                    }
                }
            }
        }
        Ok(files)
    }
}

/// True for names usable as a single path component
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Deterministic SHA-256 digest over a stage's declared inputs.
///
/// Order of the list does not matter; identity and content do. A file that
/// disappeared since resolution hashes like a missing input.
pub async fn hash_inputs(inputs: &[DeclaredInput]) -> Result<String> {
    let mut parts: Vec<(String, Vec<u8>)> = Vec::with_capacity(inputs.len());

    for input in inputs {
        let content = match input {
            DeclaredInput::File { path } => match fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    parts.push((format!("missing:{}", path.display()), Vec::new()));
                    continue;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read input: {}", path.display()))
                }
            },
            DeclaredInput::Missing { .. } => Vec::new(),
            DeclaredInput::Snapshot { value, .. } => {
                serde_json::to_vec(value).context("Failed to serialize input snapshot")?
            }
        };
        parts.push((input.identity(), content));
    }

    parts.sort_by(|a, b| a.0.cmp(&b.0));
    parts.dedup_by(|a, b| a.0 == b.0);

    let mut hasher = Sha256::new();
    for (identity, content) in &parts {
        hasher.update(identity.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inputs::{resolve_inputs, InputSpec};
    use crate::domain::Decision;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(stage: &str) -> OutputRecord {
        OutputRecord::new(stage, Decision::Approve, "ok", 0.9, Vec::<String>::new(), json!({"n": 1})).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());
        let stored = record("research");

        cache.set("research", "abcd", &stored, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("research", "abcd").await, Some(stored));
        assert_eq!(cache.lookup("research", "ffff").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_served() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());
        let now = Utc::now();
        let ttl = Duration::from_secs(60);

        let created = now - chrono::Duration::seconds(61);
        cache.set_at("research", "abcd", &record("research"), ttl, created).await.unwrap();

        assert!(matches!(
            cache.lookup_at("research", "abcd", now).await,
            CacheLookup::Expired { age_seconds: 61 }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_entry_reported() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());

        std::fs::create_dir_all(temp.path().join("research")).unwrap();
        std::fs::write(temp.path().join("research/abcd.json"), "{not json").unwrap();

        assert!(matches!(
            cache.lookup("research", "abcd").await,
            CacheLookup::Corrupt { .. }
        ));

        // A later write repairs it
        cache.set("research", "abcd", &record("research"), Duration::from_secs(60)).await.unwrap();
        assert!(matches!(cache.lookup("research", "abcd").await, CacheLookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_unsafe_keys_rejected() {
        let temp = TempDir::new().unwrap();
        let cache = CacheStore::new(temp.path());

        let result = cache.set("../escape", "abcd", &record("../escape"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));

        let result = cache.set("research", "not-hex!", &record("research"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_safe_component() {
        assert!(is_safe_component("market_research-v2.1"));
        assert!(!is_safe_component(""));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component("a b"));
    }

    #[tokio::test]
    async fn test_hash_inputs_order_insensitive() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.md");
        let b = temp.path().join("b.md");
        std::fs::write(&a, "alpha").unwrap();
        std::fs::write(&b, "beta").unwrap();

        let forward = hash_inputs(&[DeclaredInput::file(&a), DeclaredInput::file(&b)]).await.unwrap();
        let reverse = hash_inputs(&[DeclaredInput::file(&b), DeclaredInput::file(&a)]).await.unwrap();

        assert_eq!(forward, reverse);
        assert_eq!(forward.len(), 64);
    }

    #[tokio::test]
    async fn test_declared_order_does_not_change_digest() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("idea.md"), "Invoicing for freelancers").unwrap();
        let idea = InputSpec::Path("idea.md".to_string());
        let b2b = InputSpec::Static { value: json!({"market": "b2b"}) };
        let smb = InputSpec::Static { value: json!({"market": "smb"}) };

        async fn digest(specs: &[InputSpec], base: &Path) -> String {
            hash_inputs(&resolve_inputs(specs, base, &json!(null)).unwrap())
                .await
                .unwrap()
        }

        assert_eq!(
            digest(&[idea.clone(), b2b.clone()], temp.path()).await,
            digest(&[b2b.clone(), idea.clone()], temp.path()).await
        );
        assert_eq!(
            digest(&[b2b.clone(), smb.clone()], temp.path()).await,
            digest(&[smb.clone(), b2b.clone()], temp.path()).await
        );
        assert_ne!(
            digest(&[idea.clone(), b2b], temp.path()).await,
            digest(&[idea, smb], temp.path()).await
        );
    }

    #[tokio::test]
    async fn test_hash_inputs_content_and_path_sensitive() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.md");
        let b = temp.path().join("b.md");
        std::fs::write(&a, "same").unwrap();
        std::fs::write(&b, "same").unwrap();

        let hash_a = hash_inputs(&[DeclaredInput::file(&a)]).await.unwrap();
        let hash_b = hash_inputs(&[DeclaredInput::file(&b)]).await.unwrap();
        assert_ne!(hash_a, hash_b);

        std::fs::write(&a, "changed").unwrap();
        let hash_a2 = hash_inputs(&[DeclaredInput::file(&a)]).await.unwrap();
        assert_ne!(hash_a, hash_a2);
    }

    #[tokio::test]
    async fn test_missing_file_hashes_differently_from_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("later.md");

        let missing = hash_inputs(&[DeclaredInput::file(&path)]).await.unwrap();
        std::fs::write(&path, "").unwrap();
        let present = hash_inputs(&[DeclaredInput::file(&path)]).await.unwrap();

        assert_ne!(missing, present);
    }
}
