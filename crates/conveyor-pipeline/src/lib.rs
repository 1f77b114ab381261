//! Checkpointed job execution engine.
//!
//! This crate implements the Conveyor job runner: the idempotency registry,
//! per-job workspaces and journals, artifact verification, bounded retry,
//! artifact-based resume, and the driver that ties them together.

pub mod config;
pub mod definition;
pub mod engine;
pub mod events;
pub mod handlers;
pub mod journal;
pub mod lock;
pub mod persist;
pub mod registry;
pub mod resume;
pub mod retry;
pub mod stage;
pub mod validation;
pub mod verifier;
pub mod workspace;

pub use config::{EngineConfig, DEFAULT_HOME};
pub use definition::{PipelineDefinition, RetrySettings, StageSpec};
pub use engine::{Claim, JobDriver, JobReport};
pub use events::{EventEmitter, JobEvent};
pub use handlers::CommandHandler;
pub use journal::{load_journal, save_journal, Journal, JournalEntry};
pub use lock::{LockFile, LockHolder, TryLock};
pub use registry::{LogicalItem, Registry, Reservation, LATEST_ALIAS};
pub use resume::{compute_resume_point, plan_resume, ResumePlan, ResumePoint};
pub use retry::{run_with_retry, Attempted, BackoffPolicy, RetryPolicy, StageFailure};
pub use stage::{JobContext, Stage, StageDescriptor, StageHandler, StageOutput, StageTable};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use verifier::{verify, ArtifactCheck, CustomCheck, Verification};
pub use workspace::{find_workspaces, slugify, JobWorkspace, WorkspaceMetadata};
