//! Durable idempotency registry of logical items.
//!
//! The registry is a single JSON file keyed by normalized natural key. Every
//! mutation is one read-modify-write performed while holding an exclusive lock
//! file next to it, and the new state is persisted atomically before the call
//! returns. Reads go straight to the file; the atomic rename guarantees they see
//! either the old or the new state.
//!
//! The registry also owns the `latest` alias: an indirection table entry that
//! always names the most recently reserved or reassociated workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conveyor_types::{ConveyorError, ItemDescriptor, ItemStatus, NaturalKey, Result};

use crate::config::EngineConfig;
use crate::lock::LockFile;
use crate::persist::{read_json, write_json_atomic};

/// Alias that tracks the newest active workspace.
pub const LATEST_ALIAS: &str = "latest";

const REGISTRY_VERSION: u32 = 1;

/// The registry's record of a real-world deliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalItem {
    pub title: String,
    pub author: Option<String>,
    pub status: ItemStatus,
    pub workspace_ref: PathBuf,
    #[serde(default)]
    pub result_locators: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogicalItem {
    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(&self.title, self.author.as_deref())
    }
}

/// Outcome of [`Registry::reserve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// A new `processing` entry was created.
    Reserved(LogicalItem),
    /// An entry for this key already exists; it is returned unchanged.
    Conflict(LogicalItem),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    items: BTreeMap<String, LogicalItem>,
    #[serde(default)]
    aliases: BTreeMap<String, PathBuf>,
}

impl RegistryState {
    /// Exact key first, then the first entry whose key matches tolerantly.
    fn find_key(&self, key: &NaturalKey) -> Option<String> {
        let flat = key.as_key();
        if self.items.contains_key(&flat) {
            return Some(flat);
        }
        self.items
            .iter()
            .find(|(_, item)| item.key().matches(key))
            .map(|(k, _)| k.clone())
    }

    fn find(&self, key: &NaturalKey) -> Option<&LogicalItem> {
        self.find_key(key).and_then(|k| self.items.get(&k))
    }
}

/// Handle to a registry file. Cheap to construct; holds no open resources.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::open(config.registry_path());
        registry.lock_timeout = config.lock_timeout;
        registry.stale_after = config.stale_lock_after;
        registry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RegistryState> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    /// Run `f` as one atomic read-modify-write under the registry lock.
    ///
    /// `f` returns the value to hand back and whether the state changed.
    async fn transact<T>(
        &self,
        f: impl FnOnce(&mut RegistryState) -> Result<(T, bool)>,
    ) -> Result<T> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock = LockFile::acquire(&self.lock_path, self.lock_timeout, Some(self.stale_after)).await?;
        let mut state = self.load().await?;
        let (value, changed) = f(&mut state)?;
        if changed {
            state.version = REGISTRY_VERSION;
            write_json_atomic(&self.path, &state).await?;
        }
        lock.release().await?;
        Ok(value)
    }

    /// Find the entry for `key`. Case-insensitive; missing authors match any author.
    pub async fn lookup(&self, key: &NaturalKey) -> Result<Option<LogicalItem>> {
        Ok(self.load().await?.find(key).cloned())
    }

    /// Create a `processing` entry unless one already exists for the key, in any status.
    pub async fn reserve(&self, item: &ItemDescriptor, workspace: &Path) -> Result<Reservation> {
        let key = item.key();
        let reservation = self
            .transact(|state| {
                if let Some(existing) = state.find(&key) {
                    return Ok((Reservation::Conflict(existing.clone()), false));
                }
                let now = Utc::now();
                let entry = LogicalItem {
                    title: item.title.clone(),
                    author: item.author.clone(),
                    status: ItemStatus::Processing,
                    workspace_ref: workspace.to_path_buf(),
                    result_locators: BTreeMap::new(),
                    created_at: now,
                    updated_at: now,
                };
                state.items.insert(key.as_key(), entry.clone());
                state
                    .aliases
                    .insert(LATEST_ALIAS.to_string(), workspace.to_path_buf());
                Ok((Reservation::Reserved(entry), true))
            })
            .await?;
        match &reservation {
            Reservation::Reserved(_) => {
                tracing::info!(key = %key, workspace = %workspace.display(), "Item reserved")
            }
            Reservation::Conflict(existing) => {
                tracing::info!(key = %key, status = %existing.status, "Item already registered")
            }
        }
        Ok(reservation)
    }

    /// Move an entry to a terminal status and merge in its result locators.
    pub async fn finalize(
        &self,
        key: &NaturalKey,
        status: ItemStatus,
        locators: BTreeMap<String, String>,
    ) -> Result<LogicalItem> {
        if status == ItemStatus::Processing {
            return Err(ConveyorError::Validation(
                "finalize requires status done or failed".into(),
            ));
        }
        let updated = self
            .transact(|state| {
                let flat = state.find_key(key).ok_or_else(|| ConveyorError::NotFound {
                    key: key.as_key(),
                })?;
                let entry = state
                    .items
                    .get_mut(&flat)
                    .ok_or_else(|| ConveyorError::NotFound { key: flat.clone() })?;
                entry.status = status;
                entry.result_locators.extend(locators);
                entry.updated_at = Utc::now();
                Ok((entry.clone(), true))
            })
            .await?;
        tracing::info!(key = %key, status = %status, "Item finalized");
        Ok(updated)
    }

    /// Point an entry at a different workspace, carrying aliases along.
    ///
    /// A `failed` entry is reopened as `processing`; a `done` entry is rejected.
    pub async fn reassociate_workspace(
        &self,
        key: &NaturalKey,
        new_workspace: &Path,
    ) -> Result<LogicalItem> {
        self.transact(|state| {
            let flat = state.find_key(key).ok_or_else(|| ConveyorError::NotFound {
                key: key.as_key(),
            })?;
            let entry = state
                .items
                .get_mut(&flat)
                .ok_or_else(|| ConveyorError::NotFound { key: flat.clone() })?;
            if entry.status == ItemStatus::Done {
                return Err(ConveyorError::RegistryConflict {
                    key: flat,
                    status: ItemStatus::Done,
                });
            }
            let old = std::mem::replace(&mut entry.workspace_ref, new_workspace.to_path_buf());
            entry.status = ItemStatus::Processing;
            entry.updated_at = Utc::now();
            let updated = entry.clone();

            for target in state.aliases.values_mut() {
                if *target == old {
                    *target = new_workspace.to_path_buf();
                }
            }
            state
                .aliases
                .insert(LATEST_ALIAS.to_string(), new_workspace.to_path_buf());
            if old != new_workspace {
                tracing::debug!(key = %flat, from = %old.display(), to = %new_workspace.display(), "Workspace reassociated");
            }
            Ok((updated, true))
        })
        .await
    }

    /// Explicitly delete an entry. Returns the removed entry, if any.
    pub async fn remove(&self, key: &NaturalKey) -> Result<Option<LogicalItem>> {
        self.transact(|state| match state.find_key(key) {
            Some(flat) => Ok((state.items.remove(&flat), true)),
            None => Ok((None, false)),
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<LogicalItem>> {
        Ok(self.load().await?.items.into_values().collect())
    }

    pub async fn alias(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self.load().await?.aliases.get(name).cloned())
    }

    /// Drop every alias that points at `workspace` (used once it is deleted).
    pub async fn clear_alias_for(&self, workspace: &Path) -> Result<()> {
        self.transact(|state| {
            let before = state.aliases.len();
            state.aliases.retain(|_, target| target != workspace);
            Ok(((), state.aliases.len() != before))
        })
        .await
    }
}
