//! Per-workspace record of stage outcomes.
//!
//! The driver writes one [`JournalEntry`] per stage after every attempt outcome
//! and persists the whole journal before moving on. The journal is advisory:
//! resume decisions are made from artifacts, and the journal only reports what
//! the driver believed at the time.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conveyor_types::{Result, StageStatus};

use crate::persist::{read_json, write_json_atomic};
use crate::workspace::JOURNAL_FILE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub stage: String,
    pub status: StageStatus,
    pub duration_seconds: f64,
    /// Locator of the produced artifact, relative to the workspace when possible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default)]
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locators: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn ok(stage: &str, duration_seconds: f64, attempts: usize) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Ok,
            duration_seconds,
            artifact: None,
            attempts,
            error: None,
            locators: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(stage: &str, duration_seconds: f64, attempts: usize, error: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Failed,
            duration_seconds,
            artifact: None,
            attempts,
            error: Some(error.into()),
            locators: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_artifact(mut self, artifact: Option<String>) -> Self {
        self.artifact = artifact;
        self
    }

    pub fn with_locators(mut self, locators: BTreeMap<String, String>) -> Self {
        self.locators = locators;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub run_id: String,
    pub item_key: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new(item_key: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            item_key: item_key.into(),
            updated_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Insert or replace the entry for `entry.stage`.
    pub fn record(&mut self, entry: JournalEntry) {
        self.updated_at = Utc::now();
        match self.entries.iter_mut().find(|e| e.stage == entry.stage) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn entry(&self, stage: &str) -> Option<&JournalEntry> {
        self.entries.iter().find(|e| e.stage == stage)
    }

    /// Names of stages journaled as `ok`.
    pub fn ok_stages(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.status == StageStatus::Ok)
            .map(|e| e.stage.as_str())
            .collect()
    }

    /// Result locators from every `ok` entry; later stages win on name clashes.
    pub fn locators(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|e| e.status == StageStatus::Ok)
            .flat_map(|e| e.locators.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    /// Sort entries to follow `order`; stages not in `order` go last.
    pub fn sort_by_order(&mut self, order: &[&str]) {
        self.entries.sort_by_key(|e| {
            order
                .iter()
                .position(|name| *name == e.stage)
                .unwrap_or(usize::MAX)
        });
    }
}

/// Persist the journal as `journal.json` in the workspace root.
pub async fn save_journal(journal: &Journal, workspace_root: &Path) -> Result<()> {
    let path = workspace_root.join(JOURNAL_FILE);
    write_json_atomic(&path, journal).await?;
    tracing::debug!(path = %path.display(), entries = journal.entries.len(), "Journal saved");
    Ok(())
}

/// Load the workspace journal.
///
/// Returns `Ok(None)` when there is none yet. A journal that cannot be parsed
/// is reported and treated as absent, since artifacts remain authoritative.
pub async fn load_journal(workspace_root: &Path) -> Result<Option<Journal>> {
    let path = workspace_root.join(JOURNAL_FILE);
    match read_json::<Journal>(&path).await {
        Ok(journal) => Ok(journal),
        Err(conveyor_types::ConveyorError::Json(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable journal");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::new("book a");
        journal.record(JournalEntry::ok("fetch", 1.5, 1).with_artifact(Some("source.txt".into())));

        save_journal(&journal, dir.path()).await.unwrap();
        let loaded = load_journal(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, journal);
    }

    #[tokio::test]
    async fn missing_journal_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_journal(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_journal_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(JOURNAL_FILE), b"{ not json").unwrap();
        assert!(load_journal(dir.path()).await.unwrap().is_none());
    }

    #[test]
    fn later_record_replaces_earlier() {
        let mut journal = Journal::new("k");
        journal.record(JournalEntry::failed("merge", 2.0, 5, "ffmpeg exited 1"));
        journal.record(JournalEntry::ok("merge", 3.0, 1));

        assert_eq!(journal.entries.len(), 1);
        assert_eq!(journal.entry("merge").unwrap().status, StageStatus::Ok);
        assert_eq!(journal.ok_stages(), vec!["merge"]);
    }

    #[test]
    fn locators_from_ok_entries_only() {
        let mut journal = Journal::new("k");
        let mut a = BTreeMap::new();
        a.insert("video".to_string(), "v1".to_string());
        let mut b = BTreeMap::new();
        b.insert("video".to_string(), "v2".to_string());
        b.insert("shorts".to_string(), "s1".to_string());

        journal.record(JournalEntry::ok("upload", 1.0, 1).with_locators(a));
        journal.record(JournalEntry::failed("shorts", 1.0, 2, "quota").with_locators(b));

        let locators = journal.locators();
        assert_eq!(locators.len(), 1);
        assert_eq!(locators["video"], "v1");
    }

    #[test]
    fn sort_follows_stage_order() {
        let mut journal = Journal::new("k");
        journal.record(JournalEntry::ok("b", 0.0, 1));
        journal.record(JournalEntry::ok("extra", 0.0, 1));
        journal.record(JournalEntry::ok("a", 0.0, 1));
        journal.sort_by_order(&["a", "b"]);

        let names: Vec<_> = journal.entries.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "extra"]);
    }
}
