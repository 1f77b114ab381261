//! Shared types, errors, and item keys for the Conveyor job engine.
//!
//! This crate provides the foundational types used across the other Conveyor crates:
//! - `ConveyorError`: unified error taxonomy
//! - `NaturalKey` / `ItemDescriptor`: identity of the logical item a job produces
//! - `ItemStatus`: registry lifecycle of a logical item
//! - `StageStatus`: journaled outcome of a single stage

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type for all Conveyor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    // === Stage Errors ===
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Stage '{stage}' failed permanently: {message}")]
    Permanent { stage: String, message: String },

    #[error("Stage '{stage}' artifact not found: {}", .missing.join("; "))]
    ArtifactMissing { stage: String, missing: Vec<String> },

    #[error("Stage '{stage}' failed after {attempts} attempts: {reason}")]
    FatalStageFailure {
        stage: String,
        attempts: usize,
        reason: String,
    },

    // === Registry Errors ===
    #[error("Item '{key}' is already done")]
    DuplicateItem { key: String },

    #[error("Item '{key}' is already registered with status {status}")]
    RegistryConflict { key: String, status: ItemStatus },

    #[error("Item '{key}' not found in registry")]
    NotFound { key: String },

    #[error("Timed out waiting for lock {path}")]
    LockTimeout { path: String },

    // === Workspace Errors ===
    #[error("Workspace {path} is in use by process {pid}")]
    WorkspaceBusy { path: String, pid: u32 },

    #[error("Validation failed: {0}")]
    Validation(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConveyorError {
    /// Returns `true` if another attempt of the same stage may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConveyorError::StageFailed { .. }
                | ConveyorError::ArtifactMissing { .. }
                | ConveyorError::Io(_)
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConveyorError::Permanent { .. } | ConveyorError::Validation(_)
        )
    }

    /// Convenience constructor for a transient stage failure.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        ConveyorError::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// A convenience alias for `Result<T, ConveyorError>`.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ---------------------------------------------------------------------------
// ItemStatus: registry lifecycle of a logical item
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Processing,
    Done,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Processing => "processing",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// StageStatus: journaled outcome of a stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
}

// ---------------------------------------------------------------------------
// NaturalKey: normalized identity of a logical item
// ---------------------------------------------------------------------------

/// Case-insensitive, whitespace-normalized composite of title and optional author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    title: String,
    author: Option<String>,
}

/// Separator between title and author in the flattened key form.
const KEY_SEPARATOR: char = '|';

fn normalize(raw: &str) -> String {
    raw.replace(KEY_SEPARATOR, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl NaturalKey {
    pub fn new(title: &str, author: Option<&str>) -> Self {
        let author = author.map(normalize).filter(|a| !a.is_empty());
        Self {
            title: normalize(title),
            author,
        }
    }

    /// Rebuild a key from its flattened `title|author` form.
    pub fn parse(flat: &str) -> Self {
        match flat.split_once(KEY_SEPARATOR) {
            Some((title, author)) => Self::new(title, Some(author)),
            None => Self::new(flat, None),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    /// The flattened form used as the registry map key.
    pub fn as_key(&self) -> String {
        match &self.author {
            Some(author) => format!("{}{}{}", self.title, KEY_SEPARATOR, author),
            None => self.title.clone(),
        }
    }

    /// Titles must match; a missing author on either side matches any author.
    pub fn matches(&self, other: &NaturalKey) -> bool {
        if self.title != other.title {
            return false;
        }
        match (&self.author, &other.author) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

// ---------------------------------------------------------------------------
// ItemDescriptor: what the operator asked for
// ---------------------------------------------------------------------------

/// The operator-facing description of a logical item, with display casing kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub title: String,
    pub author: Option<String>,
}

impl ItemDescriptor {
    /// Build a descriptor, rejecting titles that are empty after trimming.
    pub fn new(title: &str, author: Option<&str>) -> Result<Self> {
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if title.is_empty() {
            return Err(ConveyorError::Validation("item title is empty".into()));
        }
        let author = author
            .map(|a| a.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|a| !a.is_empty());
        Ok(Self { title, author })
    }

    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(&self.title, self.author.as_deref())
    }
}

impl fmt::Display for ItemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.author {
            Some(author) => write!(f, "{} by {}", self.title, author),
            None => f.write_str(&self.title),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_stage_failed() {
        let err = ConveyorError::stage("transcode", "ffmpeg exited 1");
        assert_eq!(err.to_string(), "Stage 'transcode' failed: ffmpeg exited 1");
    }

    #[test]
    fn error_display_artifact_missing_joins_reasons() {
        let err = ConveyorError::ArtifactMissing {
            stage: "merge".into(),
            missing: vec!["a.mp4 does not exist".into(), "b.json is empty".into()],
        };
        assert_eq!(
            err.to_string(),
            "Stage 'merge' artifact not found: a.mp4 does not exist; b.json is empty"
        );
    }

    #[test]
    fn error_display_fatal() {
        let err = ConveyorError::FatalStageFailure {
            stage: "upload".into(),
            attempts: 3,
            reason: "503".into(),
        };
        assert_eq!(err.to_string(), "Stage 'upload' failed after 3 attempts: 503");
    }

    #[test]
    fn error_display_conflict_includes_status() {
        let err = ConveyorError::RegistryConflict {
            key: "book a".into(),
            status: ItemStatus::Processing,
        };
        assert_eq!(
            err.to_string(),
            "Item 'book a' is already registered with status processing"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(ConveyorError::stage("s", "m").is_retryable());
        assert!(ConveyorError::ArtifactMissing {
            stage: "s".into(),
            missing: vec![],
        }
        .is_retryable());
        assert!(!ConveyorError::Permanent {
            stage: "s".into(),
            message: "m".into(),
        }
        .is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(ConveyorError::Permanent {
            stage: "s".into(),
            message: "bad input".into(),
        }
        .is_terminal());
        assert!(ConveyorError::Validation("x".into()).is_terminal());
        assert!(!ConveyorError::stage("s", "m").is_terminal());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConveyorError = io_err.into();
        assert!(matches!(err, ConveyorError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    // --- NaturalKey ---

    #[test]
    fn natural_key_normalizes_case_and_whitespace() {
        let a = NaturalKey::new("  The   Hobbit ", Some("J.R.R.  TOLKIEN"));
        let b = NaturalKey::new("the hobbit", Some("j.r.r. tolkien"));
        assert_eq!(a, b);
        assert_eq!(a.as_key(), "the hobbit|j.r.r. tolkien");
    }

    #[test]
    fn natural_key_empty_author_is_none() {
        let key = NaturalKey::new("Dune", Some("   "));
        assert_eq!(key.author(), None);
        assert_eq!(key.as_key(), "dune");
    }

    #[test]
    fn natural_key_parse_round_trips_flat_form() {
        let key = NaturalKey::new("Dune", Some("Frank Herbert"));
        assert_eq!(NaturalKey::parse(&key.as_key()), key);
        assert_eq!(NaturalKey::parse("dune"), NaturalKey::new("Dune", None));
    }

    #[test]
    fn natural_key_separator_in_title_is_neutralized() {
        let key = NaturalKey::new("A|B", None);
        assert_eq!(key.title(), "a b");
        assert_eq!(key.author(), None);
    }

    #[test]
    fn missing_author_matches_any_author() {
        let bare = NaturalKey::new("Dune", None);
        let with = NaturalKey::new("DUNE", Some("Frank Herbert"));
        assert!(bare.matches(&with));
        assert!(with.matches(&bare));
    }

    #[test]
    fn different_authors_do_not_match() {
        let a = NaturalKey::new("Dune", Some("Frank Herbert"));
        let b = NaturalKey::new("Dune", Some("Brian Herbert"));
        assert!(!a.matches(&b));
    }

    // --- ItemDescriptor ---

    #[test]
    fn descriptor_rejects_empty_title() {
        let err = ItemDescriptor::new("   ", None).unwrap_err();
        assert!(matches!(err, ConveyorError::Validation(_)));
    }

    #[test]
    fn descriptor_keeps_display_casing() {
        let item = ItemDescriptor::new(" Book  A ", Some("Jane Doe")).unwrap();
        assert_eq!(item.title, "Book A");
        assert_eq!(item.to_string(), "Book A by Jane Doe");
        assert_eq!(item.key().as_key(), "book a|jane doe");
    }

    // --- Status enums ---

    #[test]
    fn item_status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&ItemStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(serde_json::to_string(&ItemStatus::Done).unwrap(), "\"done\"");
        assert_eq!(
            serde_json::to_string(&ItemStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn stage_status_round_trip() {
        assert_eq!(serde_json::to_string(&StageStatus::Ok).unwrap(), "\"ok\"");
        let status: StageStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, StageStatus::Failed);
    }
}
