//! Stage table validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail
//! on any `Error`-severity issue before a job touches the registry.

use std::collections::HashSet;
use std::path::{Component, Path};

use conveyor_types::{ConveyorError, Result};

use crate::stage::StageTable;
use crate::verifier::ArtifactCheck;
use crate::workspace::{JOURNAL_FILE, LOCK_FILE, METADATA_FILE};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub stage: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic>;
}

fn error(rule: &dyn LintRule, stage: Option<&str>, message: String, fix: Option<&str>) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity: Severity::Error,
        message,
        stage: stage.map(String::from),
        fix: fix.map(String::from),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        if table.is_empty() {
            vec![error(self, None, "Pipeline has no stages".into(), Some("Add at least one stage"))]
        } else {
            vec![]
        }
    }
}

struct UniqueNamesRule;
impl LintRule for UniqueNamesRule {
    fn name(&self) -> &str { "unique_names" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        table
            .iter()
            .filter(|s| !seen.insert(s.name()))
            .map(|s| {
                error(
                    self,
                    Some(s.name()),
                    format!("Stage name '{}' is used more than once", s.name()),
                    Some("Give every stage a distinct name"),
                )
            })
            .collect()
    }
}

struct NameCharsetRule;
impl LintRule for NameCharsetRule {
    fn name(&self) -> &str { "name_charset" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        table
            .iter()
            .filter(|s| {
                s.name().is_empty()
                    || !s
                        .name()
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            })
            .map(|s| {
                error(
                    self,
                    Some(s.name()),
                    format!("Stage name '{}' must be non-empty [A-Za-z0-9_-]", s.name()),
                    None,
                )
            })
            .collect()
    }
}

struct AttemptsRule;
impl LintRule for AttemptsRule {
    fn name(&self) -> &str { "max_attempts" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        table
            .iter()
            .filter(|s| s.descriptor.max_attempts == Some(0))
            .map(|s| {
                error(
                    self,
                    Some(s.name()),
                    format!("Stage '{}' allows zero attempts", s.name()),
                    Some("Set max_attempts to 1 or more"),
                )
            })
            .collect()
    }
}

struct ArtifactPathRule;

impl ArtifactPathRule {
    fn problem(path: &str) -> Option<String> {
        if path.trim().is_empty() {
            return Some("artifact path is empty".into());
        }
        let p = Path::new(path);
        if p.is_absolute() {
            return Some(format!("artifact path '{path}' must be relative to the workspace"));
        }
        if p.components().any(|c| matches!(c, Component::ParentDir)) {
            return Some(format!("artifact path '{path}' escapes the workspace"));
        }
        let first = p.components().next().and_then(|c| c.as_os_str().to_str());
        if matches!(first, Some(JOURNAL_FILE | METADATA_FILE | LOCK_FILE)) {
            return Some(format!("artifact path '{path}' collides with engine bookkeeping"));
        }
        None
    }

    fn empty_all_of(check: &ArtifactCheck) -> bool {
        match check {
            ArtifactCheck::AllOf { checks } => checks.is_empty() || checks.iter().any(Self::empty_all_of),
            _ => false,
        }
    }
}

impl LintRule for ArtifactPathRule {
    fn name(&self) -> &str { "artifact_paths" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for stage in table {
            let check = &stage.descriptor.check;
            if Self::empty_all_of(check) {
                diags.push(error(
                    self,
                    Some(stage.name()),
                    format!("Stage '{}' has an empty all_of check", stage.name()),
                    None,
                ));
            }
            for path in check.paths() {
                if let Some(problem) = Self::problem(path) {
                    diags.push(error(
                        self,
                        Some(stage.name()),
                        format!("Stage '{}': {problem}", stage.name()),
                        None,
                    ));
                }
            }
        }
        diags
    }
}

struct LastStageCriticalRule;
impl LintRule for LastStageCriticalRule {
    fn name(&self) -> &str { "last_stage_critical" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        match table.iter().last() {
            Some(last) if !last.descriptor.critical => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Final stage '{}' is optional; the item can be marked done without it",
                    last.name()
                ),
                stage: Some(last.name().into()),
                fix: Some("Make the final stage critical".into()),
            }],
            _ => vec![],
        }
    }
}

struct FinalCheckRule;
impl LintRule for FinalCheckRule {
    fn name(&self) -> &str { "final_check" }
    fn apply(&self, table: &StageTable) -> Vec<Diagnostic> {
        let any_final = table
            .iter()
            .any(|s| s.descriptor.critical && s.descriptor.final_check);
        if !table.is_empty() && !any_final {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Info,
                message: "No critical stage is re-verified at completion".into(),
                stage: None,
                fix: None,
            }]
        } else {
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(table: &StageTable) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NonEmptyRule),
        Box::new(UniqueNamesRule),
        Box::new(NameCharsetRule),
        Box::new(AttemptsRule),
        Box::new(ArtifactPathRule),
        Box::new(LastStageCriticalRule),
        Box::new(FinalCheckRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(table));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(table: &StageTable) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(table);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(ConveyorError::Validation(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{JobContext, StageDescriptor, StageHandler, StageOutput};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl StageHandler for Noop {
        async fn invoke(&self, _job: &JobContext) -> Result<StageOutput> {
            Ok(StageOutput::new())
        }
    }

    fn stage(name: &str, path: &str) -> StageDescriptor {
        StageDescriptor::new(name, ArtifactCheck::file(path))
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn valid_table_passes() {
        let table = StageTable::new()
            .with_stage(stage("fetch", "source.txt"), Noop)
            .with_stage(stage("render", "{slug}.mp4"), Noop);
        let diags = validate(&table);
        assert!(diags.iter().all(|d| d.severity != Severity::Error), "{diags:?}");
        assert!(validate_or_raise(&table).is_ok());
    }

    #[test]
    fn empty_table_is_error() {
        assert!(has(&validate(&StageTable::new()), "non_empty", Severity::Error));
    }

    #[test]
    fn duplicate_names_are_errors() {
        let table = StageTable::new()
            .with_stage(stage("fetch", "a"), Noop)
            .with_stage(stage("fetch", "b"), Noop);
        assert!(has(&validate(&table), "unique_names", Severity::Error));
    }

    #[test]
    fn bad_name_is_error() {
        let table = StageTable::new().with_stage(stage("has space", "a"), Noop);
        assert!(has(&validate(&table), "name_charset", Severity::Error));
    }

    #[test]
    fn zero_attempts_is_error() {
        let table = StageTable::new().with_stage(stage("a", "a").max_attempts(0), Noop);
        assert!(has(&validate(&table), "max_attempts", Severity::Error));
    }

    #[test]
    fn escaping_and_reserved_paths_are_errors() {
        for path in ["/etc/passwd", "../up.txt", "journal.json", ".lock", "workspace.json", " "] {
            let table = StageTable::new().with_stage(stage("a", path), Noop);
            assert!(
                has(&validate(&table), "artifact_paths", Severity::Error),
                "expected error for {path:?}"
            );
        }
    }

    #[test]
    fn empty_all_of_is_error() {
        let table = StageTable::new().with_stage(
            StageDescriptor::new("a", ArtifactCheck::AllOf { checks: vec![] }),
            Noop,
        );
        assert!(has(&validate(&table), "artifact_paths", Severity::Error));
    }

    #[test]
    fn optional_last_stage_warns() {
        let table = StageTable::new()
            .with_stage(stage("a", "a"), Noop)
            .with_stage(stage("b", "b").optional(), Noop);
        let diags = validate(&table);
        assert!(has(&diags, "last_stage_critical", Severity::Warning));
        assert!(validate_or_raise(&table).is_ok());
    }

    #[test]
    fn raise_joins_messages() {
        let table = StageTable::new()
            .with_stage(stage("a", "/abs"), Noop)
            .with_stage(stage("a", "b"), Noop);
        match validate_or_raise(&table) {
            Err(ConveyorError::Validation(msg)) => {
                assert!(msg.contains("used more than once"));
                assert!(msg.contains("must be relative"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
