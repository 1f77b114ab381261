//! Per-job workspace directories.
//!
//! A workspace is `<slug>-<id8>` under the workspaces root. It holds every stage
//! artifact, the journal, a `workspace.json` metadata file identifying the item
//! it belongs to, and a `.lock` file while a driver owns it.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use conveyor_types::{ConveyorError, ItemDescriptor, NaturalKey, Result};

use crate::lock::{LockFile, TryLock};
use crate::persist::{read_json, write_json_atomic};

pub const JOURNAL_FILE: &str = "journal.json";
pub const METADATA_FILE: &str = "workspace.json";
pub const LOCK_FILE: &str = ".lock";

const MAX_SLUG_LEN: usize = 48;

/// Identity of a workspace, persisted as `workspace.json`.
///
/// `slug` is fixed at creation and is what `{slug}` artifact templates resolve
/// against. `dir_slug` tracks the directory name, which follows the canonical
/// name once a stage reports one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    pub id: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_slug: Option<String>,
    pub item: ItemDescriptor,
    pub item_key: String,
    #[serde(default)]
    pub canonical_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct JobWorkspace {
    root: PathBuf,
    meta: WorkspaceMetadata,
    lock: Option<LockFile>,
}

impl JobWorkspace {
    /// Create a fresh, uniquely named workspace for `item` under `parent`.
    pub async fn create(parent: &Path, item: &ItemDescriptor) -> Result<Self> {
        tokio::fs::create_dir_all(parent).await?;
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let slug = slugify(&item.title);
        let dir = parent.join(format!("{slug}-{id}"));
        tokio::fs::create_dir(&dir).await?;
        let root = tokio::fs::canonicalize(&dir).await?;

        let meta = WorkspaceMetadata {
            id,
            slug,
            dir_slug: None,
            item: item.clone(),
            item_key: item.key().as_key(),
            canonical_name: None,
            created_at: Utc::now(),
        };
        write_json_atomic(&root.join(METADATA_FILE), &meta).await?;
        tracing::info!(workspace = %root.display(), item = %item, "Workspace created");
        Ok(Self {
            root,
            meta,
            lock: None,
        })
    }

    /// Open an existing workspace by reading its metadata.
    pub async fn open(root: &Path) -> Result<Self> {
        let root = tokio::fs::canonicalize(root).await?;
        let meta: WorkspaceMetadata = read_json(&root.join(METADATA_FILE))
            .await?
            .ok_or_else(|| {
                ConveyorError::Validation(format!(
                    "{} is not a workspace (no {METADATA_FILE})",
                    root.display()
                ))
            })?;
        Ok(Self {
            root,
            meta,
            lock: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn slug(&self) -> &str {
        &self.meta.slug
    }

    /// Slug part of the current directory name.
    pub fn dir_slug(&self) -> &str {
        self.meta.dir_slug.as_deref().unwrap_or(&self.meta.slug)
    }

    pub fn metadata(&self) -> &WorkspaceMetadata {
        &self.meta
    }

    pub fn key(&self) -> NaturalKey {
        self.meta.item.key()
    }

    /// Resolve an artifact path template (`{slug}` substituted) inside the workspace.
    pub fn path_for(&self, template: &str) -> PathBuf {
        self.root.join(template.replace("{slug}", &self.meta.slug))
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Take exclusive ownership of the workspace for this process.
    pub async fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        match LockFile::try_acquire(&self.root.join(LOCK_FILE), None).await? {
            TryLock::Acquired(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            TryLock::Held(holder) => Err(ConveyorError::WorkspaceBusy {
                path: self.root.display().to_string(),
                pid: holder.pid,
            }),
        }
    }

    pub async fn unlock(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => lock.release().await,
            None => Ok(()),
        }
    }

    /// Point the workspace at a different descriptor of the same logical item.
    pub async fn retarget(&mut self, item: ItemDescriptor) -> Result<()> {
        self.meta.item_key = item.key().as_key();
        self.meta.item = item;
        write_json_atomic(&self.root.join(METADATA_FILE), &self.meta).await
    }

    /// Rename the directory after the item's canonical name.
    ///
    /// Only the directory moves; the artifact slug stays as created. Returns
    /// the previous root when the directory actually moved.
    pub async fn rename(&mut self, canonical: &str) -> Result<Option<PathBuf>> {
        let slug = slugify(canonical);
        self.meta.canonical_name = Some(canonical.to_string());
        if slug == self.dir_slug() {
            write_json_atomic(&self.root.join(METADATA_FILE), &self.meta).await?;
            return Ok(None);
        }

        let parent = self.root.parent().unwrap_or_else(|| Path::new("."));
        let target = parent.join(format!("{slug}-{}", self.meta.id));
        if tokio::fs::try_exists(&target).await? {
            return Err(ConveyorError::Validation(format!(
                "cannot rename workspace: {} already exists",
                target.display()
            )));
        }
        tokio::fs::rename(&self.root, &target).await?;
        let old = std::mem::replace(&mut self.root, target);
        if let Some(lock) = self.lock.as_mut() {
            lock.relocate(self.root.join(LOCK_FILE));
        }
        self.meta.dir_slug = Some(slug);
        write_json_atomic(&self.root.join(METADATA_FILE), &self.meta).await?;
        tracing::info!(from = %old.display(), to = %self.root.display(), "Workspace renamed");
        Ok(Some(old))
    }

    /// Remove the workspace directory and everything in it.
    pub async fn delete(mut self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.root).await?;
        // The lock file went with the directory.
        self.lock.take();
        tracing::info!(workspace = %self.root.display(), "Workspace deleted");
        Ok(())
    }
}

/// Lowercase, hyphen-separated directory name fragment.
pub fn slugify(raw: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern is valid"));
    let lowered = raw.to_lowercase();
    let mut slug = re.replace_all(&lowered, "-").trim_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        slug.push_str("item");
    }
    slug
}

/// Workspaces under `parent` whose metadata carries exactly `key`, newest first.
///
/// Directories without readable metadata are skipped.
pub async fn find_workspaces(
    parent: &Path,
    key: &NaturalKey,
    exclude: Option<&Path>,
) -> Result<Vec<JobWorkspace>> {
    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        match entry.file_type().await {
            Ok(kind) if kind.is_dir() => {}
            _ => continue,
        }
        let ws = match JobWorkspace::open(&entry.path()).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "Skipping directory");
                continue;
            }
        };
        if exclude.is_some_and(|ex| ex == ws.root()) {
            continue;
        }
        if ws.key() == *key {
            found.push(ws);
        }
    }
    found.sort_by(|a, b| b.meta.created_at.cmp(&a.meta.created_at));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str) -> ItemDescriptor {
        ItemDescriptor::new(title, Some("Ann Author")).unwrap()
    }

    #[test]
    fn slugify_examples() {
        assert_eq!(slugify("The Hobbit: There & Back"), "the-hobbit-there-back");
        assert_eq!(slugify("  ***  "), "item");
        assert_eq!(slugify("Déjà Vu"), "d-j-vu");
        assert!(slugify(&"x".repeat(200)).len() <= MAX_SLUG_LEN);
    }

    #[tokio::test]
    async fn create_writes_metadata_and_unique_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        let b = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();

        assert_ne!(a.root(), b.root());
        assert_eq!(a.id().len(), 8);
        let name = a.root().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("book-a-{}", a.id()));
        assert!(a.root().join(METADATA_FILE).exists());

        let reopened = JobWorkspace::open(a.root()).await.unwrap();
        assert_eq!(reopened.metadata(), a.metadata());
    }

    #[tokio::test]
    async fn open_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = JobWorkspace::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, ConveyorError::Validation(_)));
    }

    #[tokio::test]
    async fn path_for_substitutes_slug() {
        let dir = tempfile::tempdir().unwrap();
        let ws = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        assert_eq!(ws.path_for("{slug}.mp4"), ws.root().join("book-a.mp4"));
    }

    #[tokio::test]
    async fn second_lock_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        ws.lock().await.unwrap();

        let mut other = JobWorkspace::open(ws.root()).await.unwrap();
        let err = other.lock().await.unwrap_err();
        assert!(matches!(err, ConveyorError::WorkspaceBusy { .. }));

        ws.unlock().await.unwrap();
        other.lock().await.unwrap();
    }

    #[tokio::test]
    async fn rename_moves_directory_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = JobWorkspace::create(dir.path(), &item("book a draft")).await.unwrap();
        ws.lock().await.unwrap();
        std::fs::write(ws.path_for("notes.txt"), "hi").unwrap();

        let old = ws.rename("Book A (Unabridged)").await.unwrap().unwrap();
        assert!(!old.exists());
        assert_eq!(ws.dir_slug(), "book-a-unabridged");
        assert_eq!(ws.slug(), "book-a-draft");
        assert_eq!(ws.path_for("{slug}.txt"), ws.root().join("book-a-draft.txt"));
        let name = ws.root().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("book-a-unabridged-{}", ws.id()));
        assert!(ws.root().join("notes.txt").exists());
        assert!(ws.root().join(LOCK_FILE).exists());

        let reopened = JobWorkspace::open(ws.root()).await.unwrap();
        assert_eq!(
            reopened.metadata().canonical_name.as_deref(),
            Some("Book A (Unabridged)")
        );
        assert_eq!(reopened.slug(), "book-a-draft");
        assert_eq!(reopened.dir_slug(), "book-a-unabridged");

        // Same slug: nothing moves.
        assert!(ws.rename("book a unabridged").await.unwrap().is_none());

        ws.unlock().await.unwrap();
        assert!(!ws.root().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn find_matches_key_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let first = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        JobWorkspace::create(dir.path(), &item("Book B")).await.unwrap();
        std::fs::create_dir(dir.path().join("stray")).unwrap();

        let key = NaturalKey::new("book a", Some("ann author"));
        let found = find_workspaces(dir.path(), &key, None).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].root(), second.root());

        let found = find_workspaces(dir.path(), &key, Some(second.root()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].root(), first.root());

        // No tolerant matching: a title-only key names a different item.
        let title_only = NaturalKey::new("book a", None);
        assert!(find_workspaces(dir.path(), &title_only, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn retarget_rewrites_item_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        ws.retarget(ItemDescriptor::new("Book A", None).unwrap())
            .await
            .unwrap();

        let reopened = JobWorkspace::open(ws.root()).await.unwrap();
        assert_eq!(reopened.key(), NaturalKey::new("book a", None));
        assert_eq!(reopened.metadata().item_key, "book a");
    }

    #[tokio::test]
    async fn delete_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = JobWorkspace::create(dir.path(), &item("Book A")).await.unwrap();
        ws.lock().await.unwrap();
        let root = ws.root().to_path_buf();
        ws.delete().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn find_in_missing_parent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = find_workspaces(&dir.path().join("nope"), &NaturalKey::new("x", None), None)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
