//! JSON pipeline definitions that build a [`StageTable`] of command stages.
//!
//! ```json
//! {
//!   "name": "audiobook",
//!   "retry": { "base_seconds": 5, "cap_seconds": 60, "max_attempts": 5 },
//!   "stages": [
//!     { "name": "fetch", "command": "./fetch.sh",
//!       "artifact": { "kind": "file", "path": "{slug}.txt" } }
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conveyor_types::{ConveyorError, Result};

use crate::handlers::CommandHandler;
use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::stage::{StageDescriptor, StageTable};
use crate::verifier::ArtifactCheck;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "RetrySettings::default_base")]
    pub base_seconds: f64,
    #[serde(default = "RetrySettings::default_cap")]
    pub cap_seconds: f64,
    #[serde(default = "RetrySettings::default_attempts")]
    pub max_attempts: usize,
}

impl RetrySettings {
    fn default_base() -> f64 {
        5.0
    }

    fn default_cap() -> f64 {
        60.0
    }

    fn default_attempts() -> usize {
        5
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_seconds: Self::default_base(),
            cap_seconds: Self::default_cap(),
            max_attempts: Self::default_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub command: String,
    pub artifact: ArtifactCheck,
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,
    #[serde(default = "default_true")]
    pub final_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub retry: RetrySettings,
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConveyorError::Validation(format!("cannot read pipeline {}: {e}", path.display()))
        })?;
        let definition = Self::from_json(&json)?;
        tracing::debug!(pipeline = %definition.name, stages = definition.stages.len(), "Pipeline loaded");
        Ok(definition)
    }

    /// Build the ordered stage table, one [`CommandHandler`] per stage.
    pub fn stage_table(&self) -> StageTable {
        let mut table = StageTable::new();
        for spec in &self.stages {
            let mut descriptor = StageDescriptor::new(&spec.name, spec.artifact.clone());
            descriptor.critical = spec.critical;
            descriptor.max_attempts = spec.max_attempts;
            descriptor.final_check = spec.final_check;

            let mut handler = CommandHandler::new(&spec.command);
            if let Some(secs) = spec.timeout_seconds {
                handler = handler.with_timeout(Duration::from_secs(secs));
            }
            table.push(descriptor, handler);
        }
        table
    }

    /// Engine retry policy described by the `retry` block.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let r = &self.retry;
        if !(r.base_seconds.is_finite() && r.base_seconds >= 0.0)
            || !(r.cap_seconds.is_finite() && r.cap_seconds >= 0.0)
        {
            return Err(ConveyorError::Validation(
                "retry base_seconds and cap_seconds must be non-negative".into(),
            ));
        }
        if r.max_attempts == 0 {
            return Err(ConveyorError::Validation(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        Ok(RetryPolicy::new(
            r.max_attempts,
            BackoffPolicy::Linear {
                base: seconds("base_seconds", r.base_seconds)?,
                cap: seconds("cap_seconds", r.cap_seconds)?,
            },
        ))
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ConveyorError::Validation(format!("retry {field} {value} is out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "audiobook",
        "retry": { "base_seconds": 1, "cap_seconds": 4, "max_attempts": 3 },
        "stages": [
            { "name": "fetch", "command": "echo hi > source.txt",
              "artifact": { "kind": "file", "path": "source.txt" } },
            { "name": "frames", "command": "mkdir -p frames && touch frames/1.png",
              "artifact": { "kind": "dir", "path": "frames" },
              "final_check": false, "max_attempts": 2 },
            { "name": "thumbnail", "command": "true",
              "artifact": { "kind": "file", "path": "thumb.png" },
              "critical": false, "timeout_seconds": 10 }
        ]
    }"#;

    #[test]
    fn parses_and_builds_table() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        let table = def.stage_table();
        assert_eq!(table.names(), vec!["fetch", "frames", "thumbnail"]);

        let frames = &table.get("frames").unwrap().descriptor;
        assert!(frames.critical);
        assert!(!frames.final_check);
        assert_eq!(frames.max_attempts, Some(2));

        assert!(!table.get("thumbnail").unwrap().descriptor.critical);
    }

    #[test]
    fn retry_block_becomes_policy() {
        let policy = PipelineDefinition::from_json(SAMPLE).unwrap().retry_policy().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.backoff.delay_for_attempt(9), Duration::from_secs(4));
    }

    #[test]
    fn retry_block_defaults() {
        let def = PipelineDefinition::from_json(
            r#"{"name": "x", "stages": []}"#,
        )
        .unwrap();
        assert_eq!(def.retry, RetrySettings::default());
        assert_eq!(def.retry_policy().unwrap(), RetryPolicy::default());
    }

    #[test]
    fn zero_attempts_rejected() {
        let def = PipelineDefinition::from_json(
            r#"{"name": "x", "retry": {"max_attempts": 0}, "stages": []}"#,
        )
        .unwrap();
        assert!(matches!(def.retry_policy(), Err(ConveyorError::Validation(_))));
    }

    #[test]
    fn oversized_backoff_rejected() {
        for retry in [r#"{"base_seconds": 1e30}"#, r#"{"cap_seconds": 1e300}"#] {
            let def = PipelineDefinition::from_json(&format!(
                r#"{{"name": "x", "retry": {retry}, "stages": []}}"#
            ))
            .unwrap();
            let err = def.retry_policy().unwrap_err();
            assert!(matches!(err, ConveyorError::Validation(ref msg) if msg.contains("out of range")), "{err}");
        }
    }

    #[test]
    fn unknown_check_kind_is_json_error() {
        let err = PipelineDefinition::from_json(
            r#"{"name": "x", "stages": [{"name": "a", "command": "true", "artifact": {"kind": "glob", "path": "*"}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConveyorError::Json(_)));
    }

    #[tokio::test]
    async fn load_missing_file_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineDefinition::load(&dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Validation(_)));
    }
}
