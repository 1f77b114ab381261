//! Artifact predicates deciding whether a stage's output is present.
//!
//! The verifier looks only at the workspace filesystem. It never reads the
//! journal, so a stage counts as complete exactly when its artifact check
//! passes, whatever the journal claims.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stage::StageTable;
use crate::workspace::JobWorkspace;

/// Programmatic predicate over the workspace root.
///
/// Returns `Err(reason)` when the artifact is missing or incomplete.
pub type CustomPredicate = dyn Fn(&Path) -> std::result::Result<(), String> + Send + Sync;

#[derive(Clone)]
pub struct CustomCheck {
    pub name: String,
    predicate: Arc<CustomPredicate>,
}

impl CustomCheck {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Path) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCheck").field("name", &self.name).finish()
    }
}

fn one() -> u64 {
    1
}

fn one_entry() -> usize {
    1
}

/// What a stage must leave behind in the workspace.
///
/// Paths are relative to the workspace and may contain `{slug}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactCheck {
    /// A regular file of at least `min_bytes` bytes.
    File {
        path: String,
        #[serde(default = "one")]
        min_bytes: u64,
    },
    /// A directory with at least `min_entries` entries.
    Dir {
        path: String,
        #[serde(default = "one_entry")]
        min_entries: usize,
    },
    /// A JSON object containing every key in `keys` with a non-null value.
    Json {
        path: String,
        #[serde(default)]
        keys: Vec<String>,
    },
    AllOf { checks: Vec<ArtifactCheck> },
    #[serde(skip)]
    Custom(CustomCheck),
}

impl ArtifactCheck {
    pub fn file(path: impl Into<String>) -> Self {
        ArtifactCheck::File {
            path: path.into(),
            min_bytes: 1,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        ArtifactCheck::Dir {
            path: path.into(),
            min_entries: 1,
        }
    }

    pub fn json(path: impl Into<String>, keys: &[&str]) -> Self {
        ArtifactCheck::Json {
            path: path.into(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn custom(
        name: impl Into<String>,
        predicate: impl Fn(&Path) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        ArtifactCheck::Custom(CustomCheck::new(name, predicate))
    }

    /// Every path template this check refers to.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            ArtifactCheck::File { path, .. }
            | ArtifactCheck::Dir { path, .. }
            | ArtifactCheck::Json { path, .. } => vec![path.as_str()],
            ArtifactCheck::AllOf { checks } => checks.iter().flat_map(|c| c.paths()).collect(),
            ArtifactCheck::Custom(_) => Vec::new(),
        }
    }

    /// The first path, used as the journal's artifact locator.
    pub fn primary_path(&self) -> Option<&str> {
        self.paths().into_iter().next()
    }

    /// Evaluate against `workspace`, collecting a reason for each unmet part.
    pub fn evaluate(&self, workspace: &JobWorkspace) -> Vec<String> {
        let mut missing = Vec::new();
        self.collect(workspace, &mut missing);
        missing
    }

    fn collect(&self, ws: &JobWorkspace, missing: &mut Vec<String>) {
        match self {
            ArtifactCheck::File { path, min_bytes } => {
                let full = ws.path_for(path);
                match std::fs::metadata(&full) {
                    Ok(meta) if !meta.is_file() => missing.push(format!("{path} is not a file")),
                    Ok(meta) if meta.len() < *min_bytes => missing.push(format!(
                        "{path} has {} bytes, expected at least {min_bytes}",
                        meta.len()
                    )),
                    Ok(_) => {}
                    Err(_) => missing.push(format!("{path} does not exist")),
                }
            }
            ArtifactCheck::Dir { path, min_entries } => {
                let full = ws.path_for(path);
                match std::fs::read_dir(&full) {
                    Ok(entries) => {
                        let count = entries.filter_map(|e| e.ok()).count();
                        if count < *min_entries {
                            missing.push(format!(
                                "{path} has {count} entries, expected at least {min_entries}"
                            ));
                        }
                    }
                    Err(_) => missing.push(format!("{path} is not a directory")),
                }
            }
            ArtifactCheck::Json { path, keys } => {
                let full = ws.path_for(path);
                let value = std::fs::read(&full)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok());
                match value {
                    Some(serde_json::Value::Object(map)) => {
                        for key in keys {
                            if map.get(key).map_or(true, |v| v.is_null()) {
                                missing.push(format!("{path} lacks key '{key}'"));
                            }
                        }
                    }
                    Some(_) => missing.push(format!("{path} is not a JSON object")),
                    None => missing.push(format!("{path} is missing or not valid JSON")),
                }
            }
            ArtifactCheck::AllOf { checks } => {
                for check in checks {
                    check.collect(ws, missing);
                }
            }
            ArtifactCheck::Custom(custom) => {
                if let Err(reason) = (custom.predicate)(ws.root()) {
                    missing.push(format!("{}: {reason}", custom.name));
                }
            }
        }
    }
}

/// Result of verifying one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub ok: bool,
    pub missing: Vec<String>,
}

impl Verification {
    fn from_missing(missing: Vec<String>) -> Self {
        Self {
            ok: missing.is_empty(),
            missing,
        }
    }
}

/// Check whether `stage` is artifact-complete in `workspace`.
///
/// A stage that is not in `table` is never complete.
pub fn verify(workspace: &JobWorkspace, table: &StageTable, stage: &str) -> Verification {
    match table.get(stage) {
        Some(s) => Verification::from_missing(s.descriptor.check.evaluate(workspace)),
        None => Verification::from_missing(vec![format!("unknown stage '{stage}'")]),
    }
}
