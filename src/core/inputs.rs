//! Declared stage inputs and their resolution.
//!
//! A stage lists the things its cache key depends on. Nothing else is
//! consulted when computing the key.
//!
//! Supported YAML forms:
//! - Glob pattern: `inputs: ["docs/*.md", "idea.md"]`
//! - Upstream payload: `inputs: [{ upstream: true }]`
//! - Static snapshot: `inputs: [{ static: { market: b2b } }]`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One declared input as written in a pipeline file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// Glob pattern relative to the pipeline base directory
    Path(String),

    /// Include the upstream checkpoint's payload
    Upstream { upstream: bool },

    /// Literal value
    Static {
        #[serde(rename = "static")]
        value: serde_json::Value,
    },
}

/// A resolved input, ready to hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeclaredInput {
    /// A file on disk
    File { path: PathBuf },

    /// A declared path or pattern with nothing behind it
    Missing { pattern: String },

    /// In-memory state identified by name
    Snapshot { name: String, value: serde_json::Value },
}

impl DeclaredInput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn snapshot(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Snapshot {
            name: name.into(),
            value,
        }
    }

    /// Identity used for ordering and de-duplication
    pub fn identity(&self) -> String {
        match self {
            DeclaredInput::File { path } => format!("file:{}", path.display()),
            DeclaredInput::Missing { pattern } => format!("missing:{}", pattern),
            DeclaredInput::Snapshot { name, .. } => format!("snapshot:{}", name),
        }
    }
}

/// Resolve declared inputs against a base directory.
///
/// Globs expand to every matching file; a pattern that matches nothing
/// yields a `Missing` marker so adding the file later changes the key.
pub fn resolve_inputs(
    specs: &[InputSpec],
    base_dir: &Path,
    upstream: &serde_json::Value,
) -> Result<Vec<DeclaredInput>> {
    let mut resolved = Vec::new();

    for spec in specs {
        match spec {
            InputSpec::Path(pattern) => {
                let full = if Path::new(pattern).is_absolute() {
                    PathBuf::from(pattern)
                } else {
                    base_dir.join(pattern)
                };
                let full_str = full.to_string_lossy().to_string();

                let mut matched = false;
                for entry in glob::glob(&full_str)
                    .with_context(|| format!("Invalid input pattern: {}", pattern))?
                {
                    let path = entry
                        .with_context(|| format!("Failed to read input matching {}", pattern))?;
                    if path.is_file() {
                        resolved.push(DeclaredInput::File { path });
                        matched = true;
                    }
                }

                if !matched {
                    resolved.push(DeclaredInput::Missing { pattern: full_str });
                }
            }
            InputSpec::Upstream { upstream: true } => {
                resolved.push(DeclaredInput::snapshot("upstream", upstream.clone()));
            }
            InputSpec::Upstream { upstream: false } => {}
            InputSpec::Static { value } => {
                resolved.push(DeclaredInput::snapshot(static_name(value)?, value.clone()));
            }
        }
    }

    Ok(resolved)
}

/// Name a static snapshot by its content so list position never matters
fn static_name(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(value).context("Failed to serialize static input")?;
    Ok(format!("static:{}", hex::encode(Sha256::digest(&bytes))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_input_spec_parsing() {
        let yaml = r#"
- docs/*.md
- upstream: true
- static:
    market: b2b
"#;
        let specs: Vec<InputSpec> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(specs[0], InputSpec::Path("docs/*.md".to_string()));
        assert_eq!(specs[1], InputSpec::Upstream { upstream: true });
        assert_eq!(
            specs[2],
            InputSpec::Static {
                value: json!({"market": "b2b"})
            }
        );
    }

    #[test]
    fn test_glob_resolution() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("docs")).unwrap();
        std::fs::write(temp.path().join("docs/a.md"), "a").unwrap();
        std::fs::write(temp.path().join("docs/b.md"), "b").unwrap();
        std::fs::write(temp.path().join("docs/c.txt"), "c").unwrap();

        let specs = vec![InputSpec::Path("docs/*.md".to_string())];
        let resolved = resolve_inputs(&specs, temp.path(), &json!(null)).unwrap();

        assert_eq!(resolved.len(), 2);
        assert!(resolved
            .iter()
            .all(|i| matches!(i, DeclaredInput::File { path } if path.extension().unwrap() == "md")));
    }

    #[test]
    fn test_unmatched_pattern_is_missing_marker() {
        let temp = TempDir::new().unwrap();
        let specs = vec![InputSpec::Path("nothing/*.yaml".to_string())];

        let resolved = resolve_inputs(&specs, temp.path(), &json!(null)).unwrap();

        assert_eq!(resolved.len(), 1);
        assert!(matches!(resolved[0], DeclaredInput::Missing { .. }));
    }

    #[test]
    fn test_upstream_snapshot() {
        let temp = TempDir::new().unwrap();
        let specs = vec![
            InputSpec::Upstream { upstream: true },
            InputSpec::Upstream { upstream: false },
        ];

        let resolved = resolve_inputs(&specs, temp.path(), &json!({"score": 8})).unwrap();

        assert_eq!(resolved, vec![DeclaredInput::snapshot("upstream", json!({"score": 8}))]);
    }

    #[test]
    fn test_static_identity_ignores_position() {
        let temp = TempDir::new().unwrap();
        let b2b = InputSpec::Static { value: json!({"market": "b2b"}) };
        let smb = InputSpec::Static { value: json!({"market": "smb"}) };

        let first = resolve_inputs(&[b2b.clone()], temp.path(), &json!(null)).unwrap();
        let later = resolve_inputs(&[smb.clone(), b2b], temp.path(), &json!(null)).unwrap();

        assert_eq!(first[0].identity(), later[1].identity());
        assert_ne!(later[0].identity(), later[1].identity());
    }
}
