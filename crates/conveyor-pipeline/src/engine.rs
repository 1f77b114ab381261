//! Job driver: the top-level claim, resume, execute, finalize loop.
//!
//! A job moves through `claim → resume point → stages in order → completion`.
//! Each stage attempt invokes the handler and then the artifact verifier; the
//! journal is persisted after every stage outcome, before the next stage
//! starts. Only an exhausted critical stage halts the job, leaving the workspace
//! and a `processing` registry entry behind for a later resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use conveyor_types::{ConveyorError, ItemDescriptor, ItemStatus, NaturalKey, Result};

use crate::config::EngineConfig;
use crate::events::{EventEmitter, JobEvent};
use crate::journal::{load_journal, save_journal, Journal, JournalEntry};
use crate::registry::{LogicalItem, Registry, Reservation};
use crate::resume::plan_resume;
use crate::retry::{run_with_retry, Attempted, StageFailure};
use crate::stage::{JobContext, Stage, StageOutput, StageTable};
use crate::validation::validate_or_raise;
use crate::verifier::verify;
use crate::workspace::{find_workspaces, JobWorkspace};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Drives jobs through a fixed stage table.
pub struct JobDriver {
    table: StageTable,
    registry: Registry,
    config: EngineConfig,
    events: EventEmitter,
}

/// A workspace this driver now owns, ready to be driven.
#[derive(Debug)]
pub struct Claim {
    pub workspace: JobWorkspace,
    /// The registry already knew the item; work continues from an earlier run.
    pub resumed: bool,
}

/// Summary of a job that ran to completion.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub item: ItemDescriptor,
    pub workspace: PathBuf,
    pub resumed: bool,
    /// Stages invoked and verified during this run.
    pub executed: Vec<String>,
    /// Stages skipped because their artifacts were already present.
    pub skipped: Vec<String>,
    /// Optional stages that exhausted their attempts.
    pub soft_failed: Vec<String>,
    pub locators: BTreeMap<String, String>,
    pub workspace_deleted: bool,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// JobDriver
// ---------------------------------------------------------------------------

impl JobDriver {
    pub fn new(table: StageTable, config: EngineConfig) -> Self {
        Self {
            registry: Registry::from_config(&config),
            table,
            config,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn table(&self) -> &StageTable {
        &self.table
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Produce `item`, reusing an unfinished earlier attempt if one exists.
    pub async fn run(&self, item: &ItemDescriptor) -> Result<JobReport> {
        validate_or_raise(&self.table)?;
        let claim = self.claim(item).await?;
        self.drive(claim.workspace, claim.resumed).await
    }

    /// Continue the job held in an existing workspace directory.
    ///
    /// The registry entry is created or pointed at this workspace as needed;
    /// items already `done` are refused, as is taking over from a driver that
    /// still holds the entry's current workspace.
    pub async fn resume_workspace(&self, path: &Path) -> Result<JobReport> {
        validate_or_raise(&self.table)?;
        let mut ws = JobWorkspace::open(path).await?;
        ws.lock().await?;
        let item = ws.metadata().item.clone();

        match self.registry.reserve(&item, ws.root()).await? {
            Reservation::Reserved(_) => {
                tracing::info!(item = %item, "Workspace adopted into registry");
            }
            Reservation::Conflict(existing) if existing.status == ItemStatus::Done => {
                return Err(ConveyorError::DuplicateItem {
                    key: existing.key().as_key(),
                });
            }
            Reservation::Conflict(existing) => {
                // A live driver on the entry's current workspace keeps the item.
                let mut current = None;
                if existing.workspace_ref != ws.root() {
                    if let Ok(mut other) = JobWorkspace::open(&existing.workspace_ref).await {
                        other.lock().await?;
                        current = Some(other);
                    }
                }
                self.registry
                    .reassociate_workspace(&existing.key(), ws.root())
                    .await?;
                if let Some(mut other) = current {
                    other.unlock().await?;
                }
            }
        }
        self.drive(ws, true).await
    }

    /// Get exclusive use of a workspace for `item`.
    ///
    /// A fresh workspace is created and reserved. If the item is already
    /// registered and unfinished, the fresh workspace is discarded in favor of
    /// the earlier one; a `done` item fails with `DuplicateItem`.
    pub async fn claim(&self, item: &ItemDescriptor) -> Result<Claim> {
        let mut fresh = JobWorkspace::create(&self.config.workspaces_dir(), item).await?;
        fresh.lock().await?;

        let existing = match self.registry.reserve(item, fresh.root()).await {
            Ok(Reservation::Reserved(_)) => {
                return Ok(Claim {
                    workspace: fresh,
                    resumed: false,
                })
            }
            Ok(Reservation::Conflict(existing)) => existing,
            Err(e) => {
                discard(fresh).await;
                return Err(e);
            }
        };

        let key = existing.key();
        if existing.status == ItemStatus::Done {
            tracing::warn!(item = %item, "Item already produced; refusing duplicate job");
            discard(fresh).await;
            return Err(ConveyorError::DuplicateItem { key: key.as_key() });
        }

        let prior = match self.locate_prior(&existing, &key, fresh.root()).await {
            Ok(prior) => prior,
            Err(e) => {
                discard(fresh).await;
                return Err(e);
            }
        };

        let (workspace, is_fresh) = match prior {
            Some(mut prior) => match prior.lock().await {
                Ok(()) => {
                    discard(fresh).await;
                    tracing::info!(
                        item = %item,
                        workspace = %prior.root().display(),
                        status = %existing.status,
                        "Resuming earlier workspace"
                    );
                    (prior, false)
                }
                Err(e @ ConveyorError::WorkspaceBusy { .. }) => {
                    discard(fresh).await;
                    return Err(e);
                }
                Err(e) => {
                    // Typically the directory vanished between scan and lock.
                    tracing::warn!(
                        workspace = %prior.root().display(),
                        error = %e,
                        "Earlier workspace unusable; starting over in a fresh one"
                    );
                    (fresh, true)
                }
            },
            None => {
                tracing::warn!(
                    item = %item,
                    missing = %existing.workspace_ref.display(),
                    "Earlier workspace not found; starting over in a fresh one"
                );
                (fresh, true)
            }
        };

        let mut workspace = workspace;
        if is_fresh && workspace.key() != key {
            // The entry was found by a tolerant match; keep workspace metadata on its key.
            let adopted = match ItemDescriptor::new(&existing.title, existing.author.as_deref()) {
                Ok(descriptor) => workspace.retarget(descriptor).await,
                Err(e) => Err(e),
            };
            if let Err(e) = adopted {
                discard(workspace).await;
                return Err(e);
            }
        }

        match self.registry.reassociate_workspace(&key, workspace.root()).await {
            Ok(_) => Ok(Claim {
                workspace,
                resumed: !is_fresh,
            }),
            Err(e) => {
                if is_fresh {
                    discard(workspace).await;
                }
                // Another driver finished the item while we were looking.
                if let ConveyorError::RegistryConflict {
                    key,
                    status: ItemStatus::Done,
                } = e
                {
                    return Err(ConveyorError::DuplicateItem { key });
                }
                Err(e)
            }
        }
    }

    /// Find the workspace an earlier run used for `existing`.
    ///
    /// Workspaces must carry exactly `key`, the entry's own key. The registry
    /// pointer wins when it names such a workspace; otherwise the workspaces
    /// root is scanned, newest first.
    pub async fn locate_prior(
        &self,
        existing: &LogicalItem,
        key: &NaturalKey,
        exclude: &Path,
    ) -> Result<Option<JobWorkspace>> {
        if existing.workspace_ref != exclude {
            if let Ok(ws) = JobWorkspace::open(&existing.workspace_ref).await {
                if ws.key() == *key {
                    return Ok(Some(ws));
                }
            }
        }
        let mut found = find_workspaces(&self.config.workspaces_dir(), key, Some(exclude)).await?;
        if found.is_empty() {
            Ok(None)
        } else {
            Ok(Some(found.remove(0)))
        }
    }

    /// Run every stage from the resume point onward, then finalize.
    pub async fn drive(&self, mut ws: JobWorkspace, resumed: bool) -> Result<JobReport> {
        let started = Instant::now();
        ws.lock().await?;
        let item = ws.metadata().item.clone();
        let key = ws.key();
        let order = self.table.names();

        let plan = plan_resume(&ws, &self.table).await?;
        let resumed = resumed || plan.start_index > 0;
        self.events.emit(JobEvent::JobStarted {
            item: item.to_string(),
            workspace: ws.root().display().to_string(),
            resumed,
        });
        tracing::info!(
            item = %item,
            workspace = %ws.root().display(),
            point = ?plan.point,
            "Job started"
        );

        let mut journal = load_journal(ws.root())
            .await?
            .unwrap_or_else(|| Journal::new(key.as_key()));
        let mut locators = journal.locators();
        let mut report = JobReport {
            item: item.clone(),
            workspace: ws.root().to_path_buf(),
            resumed,
            executed: Vec::new(),
            skipped: Vec::new(),
            soft_failed: Vec::new(),
            locators: BTreeMap::new(),
            workspace_deleted: false,
            duration: Duration::ZERO,
        };

        for (index, stage) in self.table.iter().enumerate() {
            let name = stage.name().to_string();
            if index < plan.start_index {
                tracing::debug!(stage = %name, "Artifact present, skipping");
                self.events.emit(JobEvent::StageSkipped { stage: name.clone() });
                report.skipped.push(name);
                continue;
            }

            let stage_started = Instant::now();
            let Attempted { result, attempts } = self.run_stage(&ws, stage, &locators).await;
            let elapsed = stage_started.elapsed();

            match result {
                Ok(output) => {
                    let artifact = artifact_locator(&ws, stage, &output);
                    journal.record(
                        JournalEntry::ok(&name, elapsed.as_secs_f64(), attempts)
                            .with_artifact(artifact)
                            .with_locators(output.locators.clone()),
                    );
                    self.persist_journal(&mut journal, &ws, &order, &name).await?;
                    locators.extend(output.locators);
                    self.events.emit(JobEvent::StageCompleted {
                        stage: name.clone(),
                        attempts,
                        duration_ms: elapsed.as_millis() as u64,
                    });
                    tracing::info!(stage = %name, attempts, duration_ms = %elapsed.as_millis(), "Stage completed");
                    report.executed.push(name);

                    if let Some(canonical) = output.canonical_name {
                        self.rename_workspace(&mut ws, &key, &canonical).await?;
                        report.workspace = ws.root().to_path_buf();
                    }
                }
                Err(failure) => {
                    journal.record(JournalEntry::failed(
                        &name,
                        elapsed.as_secs_f64(),
                        attempts,
                        failure.last_error().to_string(),
                    ));
                    self.persist_journal(&mut journal, &ws, &order, &name).await?;
                    self.events.emit(JobEvent::StageFailed {
                        stage: name.clone(),
                        attempts,
                        critical: failure.is_fatal(),
                        error: failure.last_error().to_string(),
                    });

                    match failure {
                        StageFailure::Soft { last_error, .. } => {
                            tracing::warn!(stage = %name, attempts, error = %last_error, "Optional stage failed; continuing");
                            report.soft_failed.push(name);
                        }
                        StageFailure::Fatal { last_error, .. } => {
                            return Err(self.halt(ws, &key, &item, &name, attempts, last_error).await);
                        }
                    }
                }
            }
        }

        self.complete(ws, &key, &journal, report, started).await
    }

    /// One stage under the retry controller; each attempt invokes then verifies.
    async fn run_stage(
        &self,
        ws: &JobWorkspace,
        stage: &Stage,
        locators: &BTreeMap<String, String>,
    ) -> Attempted<StageOutput> {
        let name = stage.name();
        let max_attempts = self.config.retry.attempts_for(stage.descriptor.max_attempts);
        let item = &ws.metadata().item;
        let table = &self.table;
        let events = &self.events;

        run_with_retry(
            name,
            |attempt| {
                let job = JobContext {
                    item: item.clone(),
                    workspace: ws.root().to_path_buf(),
                    slug: ws.slug().to_string(),
                    stage: name.to_string(),
                    attempt,
                    locators: locators.clone(),
                };
                let handler = stage.handler.clone();
                async move {
                    events.emit(JobEvent::StageStarted {
                        stage: job.stage.clone(),
                        attempt,
                    });
                    let output = handler.invoke(&job).await?;
                    let verification = verify(ws, table, &job.stage);
                    if !verification.ok {
                        return Err(ConveyorError::ArtifactMissing {
                            stage: job.stage.clone(),
                            missing: verification.missing,
                        });
                    }
                    Ok(output)
                }
            },
            max_attempts,
            stage.descriptor.critical,
            &self.config.retry.backoff,
        )
        .await
    }

    async fn persist_journal(
        &self,
        journal: &mut Journal,
        ws: &JobWorkspace,
        order: &[&str],
        stage: &str,
    ) -> Result<()> {
        journal.sort_by_order(order);
        save_journal(journal, ws.root()).await?;
        self.events.emit(JobEvent::JournalSaved {
            stage: stage.to_string(),
        });
        Ok(())
    }

    async fn rename_workspace(
        &self,
        ws: &mut JobWorkspace,
        key: &NaturalKey,
        canonical: &str,
    ) -> Result<()> {
        if let Some(old) = ws.rename(canonical).await? {
            self.registry.reassociate_workspace(key, ws.root()).await?;
            self.events.emit(JobEvent::WorkspaceRenamed {
                from: old.display().to_string(),
                to: ws.root().display().to_string(),
            });
        }
        Ok(())
    }

    /// Leave the workspace and a `processing` entry behind for a later resume.
    async fn halt(
        &self,
        mut ws: JobWorkspace,
        key: &NaturalKey,
        item: &ItemDescriptor,
        stage: &str,
        attempts: usize,
        last_error: ConveyorError,
    ) -> ConveyorError {
        tracing::error!(
            stage = %stage,
            attempts,
            error = %last_error,
            workspace = %ws.root().display(),
            "Critical stage failed; job halted"
        );
        if let Err(e) = self.registry.reassociate_workspace(key, ws.root()).await {
            tracing::warn!(error = %e, "Could not update registry pointer after failure");
        }
        if let Err(e) = ws.unlock().await {
            tracing::warn!(error = %e, "Could not release workspace lock");
        }
        self.events.emit(JobEvent::JobHalted {
            item: item.to_string(),
            stage: stage.to_string(),
            error: last_error.to_string(),
        });
        ConveyorError::FatalStageFailure {
            stage: stage.to_string(),
            attempts,
            reason: last_error.to_string(),
        }
    }

    /// Re-verify, mark the item done, and only then remove the workspace.
    async fn complete(
        &self,
        mut ws: JobWorkspace,
        key: &NaturalKey,
        journal: &Journal,
        mut report: JobReport,
        started: Instant,
    ) -> Result<JobReport> {
        for stage in &self.table {
            if !(stage.descriptor.critical && stage.descriptor.final_check) {
                continue;
            }
            let verification = verify(&ws, &self.table, stage.name());
            if !verification.ok {
                tracing::error!(
                    stage = %stage.name(),
                    missing = %verification.missing.join("; "),
                    "Artifact vanished before completion; item stays processing"
                );
                ws.unlock().await?;
                return Err(ConveyorError::ArtifactMissing {
                    stage: stage.name().to_string(),
                    missing: verification.missing,
                });
            }
        }

        let locators = journal.locators();
        self.registry
            .finalize(key, ItemStatus::Done, locators.clone())
            .await?;
        self.events.emit(JobEvent::ItemFinalized {
            item: report.item.to_string(),
            status: ItemStatus::Done.to_string(),
        });
        report.locators = locators;

        let root = ws.root().to_path_buf();
        if self.config.retain_workspaces {
            ws.unlock().await?;
            tracing::info!(workspace = %root.display(), "Workspace retained");
        } else {
            match ws.delete().await {
                Ok(()) => {
                    report.workspace_deleted = true;
                    self.registry.clear_alias_for(&root).await?;
                    self.events.emit(JobEvent::WorkspaceDeleted {
                        workspace: root.display().to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(workspace = %root.display(), error = %e, "Could not delete workspace");
                }
            }
        }

        report.duration = started.elapsed();
        self.events.emit(JobEvent::JobCompleted {
            item: report.item.to_string(),
            duration_ms: report.duration.as_millis() as u64,
        });
        tracing::info!(
            item = %report.item,
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            soft_failed = report.soft_failed.len(),
            "Job completed"
        );
        Ok(report)
    }
}

/// Workspace-relative locator of what a stage produced.
fn artifact_locator(ws: &JobWorkspace, stage: &Stage, output: &StageOutput) -> Option<String> {
    if let Some(path) = &output.artifact {
        let relative = path.strip_prefix(ws.root()).unwrap_or(path);
        return Some(relative.display().to_string());
    }
    stage
        .descriptor
        .check
        .primary_path()
        .map(|template| template.replace("{slug}", ws.slug()))
}

async fn discard(ws: JobWorkspace) {
    let root = ws.root().to_path_buf();
    if let Err(e) = ws.delete().await {
        tracing::warn!(workspace = %root.display(), error = %e, "Could not remove unused workspace");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
