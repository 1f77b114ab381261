use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_types::{ConveyorError, Result};

use crate::stage::{JobContext, StageHandler, StageOutput};

/// Default limit for a single command attempt.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const NOTES_LIMIT: usize = 4096;

const LOCATOR_DIRECTIVE: &str = "::locator ";
const CANONICAL_DIRECTIVE: &str = "::canonical-name ";

// ---------------------------------------------------------------------------
// CommandHandler: runs a shell command inside the workspace
// ---------------------------------------------------------------------------

/// Stage handler that runs `sh -c <command>` with the workspace as cwd.
///
/// The command sees `CONVEYOR_TITLE`, `CONVEYOR_AUTHOR`, `CONVEYOR_SLUG`,
/// `CONVEYOR_WORKSPACE`, `CONVEYOR_STAGE`, `CONVEYOR_ATTEMPT`, and one
/// `CONVEYOR_LOCATOR_<NAME>` per locator recorded by earlier stages. Stdout
/// lines `::locator <name> <value>` and `::canonical-name <value>` are
/// reported back to the driver.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: String,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn env(job: &JobContext) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CONVEYOR_TITLE".into(), job.item.title.clone());
        env.insert(
            "CONVEYOR_AUTHOR".into(),
            job.item.author.clone().unwrap_or_default(),
        );
        env.insert("CONVEYOR_SLUG".into(), job.slug.clone());
        env.insert(
            "CONVEYOR_WORKSPACE".into(),
            job.workspace.display().to_string(),
        );
        env.insert("CONVEYOR_STAGE".into(), job.stage.clone());
        env.insert("CONVEYOR_ATTEMPT".into(), job.attempt.to_string());
        for (name, value) in &job.locators {
            env.insert(format!("CONVEYOR_LOCATOR_{}", env_suffix(name)), value.clone());
        }
        env
    }
}

#[async_trait]
impl StageHandler for CommandHandler {
    async fn invoke(&self, job: &JobContext) -> Result<StageOutput> {
        tracing::info!(stage = %job.stage, attempt = job.attempt, command = %self.command, "Executing stage command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&self.command);
        cmd.current_dir(&job.workspace);
        cmd.envs(Self::env(job));
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ConveyorError::stage(&job.stage, format!("failed to spawn command: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ConveyorError::stage(
                    &job.stage,
                    format!("command timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| ConveyorError::stage(&job.stage, format!("command execution failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            stage = %job.stage,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Stage command finished"
        );

        if !output.status.success() {
            let detail = last_line(&stderr).or_else(|| last_line(&stdout)).unwrap_or_default();
            return Err(ConveyorError::stage(
                &job.stage,
                format!("command exited with code {exit_code}: {detail}"),
            ));
        }

        let mut result = parse_directives(&stdout);
        let combined = if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };
        result.notes = truncate(&combined, NOTES_LIMIT);
        Ok(result)
    }
}

/// Pick `::locator` and `::canonical-name` lines out of command output.
pub fn parse_directives(stdout: &str) -> StageOutput {
    let mut out = StageOutput::new();
    for line in stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(LOCATOR_DIRECTIVE) {
            if let Some((name, value)) = rest.trim().split_once(char::is_whitespace) {
                out.locators.insert(name.to_string(), value.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix(CANONICAL_DIRECTIVE) {
            let name = rest.trim();
            if !name.is_empty() {
                out.canonical_name = Some(name.to_string());
            }
        }
    }
    out
}

fn env_suffix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(String::from)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..cut])
}
