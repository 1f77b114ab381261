//! Stage handler trait, stage descriptors, and the ordered stage table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use conveyor_types::{ItemDescriptor, Result};

use crate::verifier::ArtifactCheck;

// ---------------------------------------------------------------------------
// JobContext / StageOutput
// ---------------------------------------------------------------------------

/// Everything a handler knows about the job it is working on.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub item: ItemDescriptor,
    pub workspace: PathBuf,
    pub slug: String,
    pub stage: String,
    /// 1-based attempt number for this stage.
    pub attempt: usize,
    /// Result locators recorded by earlier stages.
    pub locators: BTreeMap<String, String>,
}

impl JobContext {
    /// Resolve an artifact path template inside the workspace.
    pub fn path_for(&self, template: &str) -> PathBuf {
        self.workspace.join(template.replace("{slug}", &self.slug))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// What a handler reports back besides the files it wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    pub artifact: Option<PathBuf>,
    /// External identifiers for the produced result (e.g. an upload URL).
    pub locators: BTreeMap<String, String>,
    /// Authoritative name of the item, once a stage learns it.
    pub canonical_name: Option<String>,
    pub notes: String,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn with_locator(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.locators.insert(name.into(), value.into());
        self
    }

    pub fn with_canonical_name(mut self, name: impl Into<String>) -> Self {
        self.canonical_name = Some(name.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

// ---------------------------------------------------------------------------
// StageHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Perform one attempt of the stage.
    ///
    /// Handlers write their artifacts into `job.workspace`. Return
    /// [`conveyor_types::ConveyorError::Permanent`] for failures that another
    /// attempt cannot fix.
    async fn invoke(&self, job: &JobContext) -> Result<StageOutput>;
}

// ---------------------------------------------------------------------------
// StageDescriptor / StageTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub check: ArtifactCheck,
    /// Exhausting a critical stage halts the job.
    pub critical: bool,
    /// Overrides the engine-wide attempt limit.
    pub max_attempts: Option<usize>,
    /// Re-verify this artifact before the item is marked done.
    pub final_check: bool,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, check: ArtifactCheck) -> Self {
        Self {
            name: name.into(),
            check,
            critical: true,
            max_attempts: None,
            final_check: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// For intermediate artifacts that later stages may clean up.
    pub fn skip_final_check(mut self) -> Self {
        self.final_check = false;
        self
    }
}

#[derive(Clone)]
pub struct Stage {
    pub descriptor: StageDescriptor,
    pub handler: Arc<dyn StageHandler>,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Static, ordered list of stages making up a job.
#[derive(Debug, Clone, Default)]
pub struct StageTable {
    stages: Vec<Stage>,
}

impl StageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: StageDescriptor, handler: impl StageHandler + 'static) {
        self.push_shared(descriptor, Arc::new(handler));
    }

    pub fn push_shared(&mut self, descriptor: StageDescriptor, handler: Arc<dyn StageHandler>) {
        self.stages.push(Stage {
            descriptor,
            handler,
        });
    }

    pub fn with_stage(mut self, descriptor: StageDescriptor, handler: impl StageHandler + 'static) -> Self {
        self.push(descriptor, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Stage> {
        self.stages.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<'a> IntoIterator for &'a StageTable {
    type Item = &'a Stage;
    type IntoIter = std::slice::Iter<'a, Stage>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        async fn invoke(&self, _job: &JobContext) -> Result<StageOutput> {
            Ok(StageOutput::new().with_notes("noop"))
        }
    }

    #[test]
    fn descriptor_defaults_and_builders() {
        let d = StageDescriptor::new("fetch", ArtifactCheck::file("a.txt"));
        assert!(d.critical);
        assert!(d.final_check);
        assert_eq!(d.max_attempts, None);

        let d = d.optional().max_attempts(2).skip_final_check();
        assert!(!d.critical);
        assert!(!d.final_check);
        assert_eq!(d.max_attempts, Some(2));
    }

    #[test]
    fn table_keeps_order() {
        let table = StageTable::new()
            .with_stage(StageDescriptor::new("a", ArtifactCheck::file("a")), Noop)
            .with_stage(StageDescriptor::new("b", ArtifactCheck::file("b")), Noop);
        assert_eq!(table.names(), vec!["a", "b"]);
        assert_eq!(table.position("b"), Some(1));
        assert!(table.get("c").is_none());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn handler_is_callable_through_table() {
        let table = StageTable::new().with_stage(StageDescriptor::new("a", ArtifactCheck::file("a")), Noop);
        let job = JobContext {
            item: ItemDescriptor::new("T", None).unwrap(),
            workspace: PathBuf::from("/tmp/ws"),
            slug: "t".into(),
            stage: "a".into(),
            attempt: 1,
            locators: BTreeMap::new(),
        };
        let out = table.get("a").unwrap().handler.invoke(&job).await.unwrap();
        assert_eq!(out.notes, "noop");
        assert_eq!(job.path_for("{slug}.mp4"), PathBuf::from("/tmp/ws/t.mp4"));
    }
}
