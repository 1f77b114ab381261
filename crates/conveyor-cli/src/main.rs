//! CLI binary for running, resuming and inspecting Conveyor jobs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conveyor_pipeline::{
    plan_resume, EngineConfig, JobDriver, JobReport, JobWorkspace, PipelineDefinition, Registry,
    Severity, DEFAULT_HOME,
};
use conveyor_types::{ConveyorError, ItemDescriptor, NaturalKey};

/// Exit code for setup and validation failures.
const EXIT_SETUP: u8 = 2;
/// Exit code for a job halted by a failed stage.
const EXIT_STAGE: u8 = 3;

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Checkpointed, resumable multi-stage content jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State directory holding the registry and workspaces
    #[arg(long, global = true, default_value = DEFAULT_HOME)]
    home: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Produce an item, resuming an unfinished earlier job if there is one
    Run {
        /// Item title
        title: String,

        /// Item author
        #[arg(short, long)]
        author: Option<String>,

        /// Path to the pipeline definition (.json)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Keep the workspace after the item is done
        #[arg(long)]
        retain: bool,
    },

    /// Continue the job in an existing workspace directory
    Resume {
        /// Workspace directory
        #[arg(short, long)]
        workspace: PathBuf,

        /// Path to the pipeline definition (.json)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Keep the workspace after the item is done
        #[arg(long)]
        retain: bool,
    },

    /// Show the registry entry for an item
    Status {
        title: String,

        #[arg(short, long)]
        author: Option<String>,

        /// Also report which stages are complete in the workspace
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
    },

    /// List every registered item
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove an item from the registry
    Forget {
        title: String,

        #[arg(short, long)]
        author: Option<String>,
    },

    /// Validate a pipeline definition
    Validate {
        #[arg(short, long)]
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let home = cli.home;
    match cli.command {
        Commands::Run {
            title,
            author,
            pipeline,
            retain,
        } => {
            let item = ItemDescriptor::new(&title, author.as_deref())?;
            let driver = load_driver(&pipeline, &home, retain).await?;
            println!("Running: {item}");
            let report = driver.run(&item).await?;
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resume {
            workspace,
            pipeline,
            retain,
        } => {
            let driver = load_driver(&pipeline, &home, retain).await?;
            println!("Resuming: {}", workspace.display());
            let report = driver.resume_workspace(&workspace).await?;
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status {
            title,
            author,
            pipeline,
        } => cmd_status(&home, &title, author.as_deref(), pipeline.as_deref()).await,
        Commands::List { json } => cmd_list(&home, json).await,
        Commands::Forget { title, author } => {
            let key = NaturalKey::new(&title, author.as_deref());
            let registry = Registry::from_config(&EngineConfig::new(&home));
            match registry.remove(&key).await? {
                Some(removed) => {
                    println!(
                        "Forgot '{}' (was {}); workspace left at {}",
                        removed.title,
                        removed.status,
                        removed.workspace_ref.display()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                None => Err(ConveyorError::NotFound { key: key.as_key() }.into()),
            }
        }
        Commands::Validate { pipeline } => cmd_validate(&pipeline).await,
    }
}

/// Map a failure to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ConveyorError>() {
        Some(ConveyorError::FatalStageFailure { .. }) | Some(ConveyorError::ArtifactMissing { .. }) => {
            EXIT_STAGE
        }
        _ => EXIT_SETUP,
    }
}

async fn load_driver(pipeline: &Path, home: &Path, retain: bool) -> anyhow::Result<JobDriver> {
    let definition = PipelineDefinition::load(pipeline).await?;
    let config = EngineConfig::new(home)
        .with_retry(definition.retry_policy()?)
        .retain_workspaces(retain);
    tracing::debug!(pipeline = %definition.name, home = %home.display(), "Driver configured");
    Ok(JobDriver::new(definition.stage_table(), config))
}

fn print_report(report: &JobReport) {
    println!("Completed: {} in {:.1}s", report.item, report.duration.as_secs_f64());
    if report.resumed {
        println!("  resumed, skipped: {}", join_or_dash(&report.skipped));
    }
    println!("  executed: {}", join_or_dash(&report.executed));
    if !report.soft_failed.is_empty() {
        println!("  optional stages failed: {}", report.soft_failed.join(", "));
    }
    for (name, locator) in &report.locators {
        println!("  {name}: {locator}");
    }
    if report.workspace_deleted {
        println!("  workspace removed");
    } else {
        println!("  workspace: {}", report.workspace.display());
    }
}

fn join_or_dash(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

async fn cmd_status(
    home: &Path,
    title: &str,
    author: Option<&str>,
    pipeline: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let key = NaturalKey::new(title, author);
    let registry = Registry::from_config(&EngineConfig::new(home));
    let entry = registry
        .lookup(&key)
        .await?
        .ok_or_else(|| ConveyorError::NotFound { key: key.as_key() })?;

    println!("Item:      {}", entry.title);
    if let Some(author) = &entry.author {
        println!("Author:    {author}");
    }
    println!("Status:    {}", entry.status);
    println!("Workspace: {}", entry.workspace_ref.display());
    println!("Updated:   {}", entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    for (name, locator) in &entry.result_locators {
        println!("  {name}: {locator}");
    }

    if let Some(pipeline) = pipeline {
        let definition = PipelineDefinition::load(pipeline).await?;
        let table = definition.stage_table();
        match JobWorkspace::open(&entry.workspace_ref).await {
            Ok(ws) => {
                let plan = plan_resume(&ws, &table).await?;
                println!("Complete:  {}", join_or_dash(&plan.artifact_complete));
                match &plan.point {
                    conveyor_pipeline::ResumePoint::At(stage) => println!("Next:      {stage}"),
                    conveyor_pipeline::ResumePoint::AllComplete => println!("Next:      (all stages complete)"),
                }
                if !plan.stale.is_empty() {
                    println!("Stale:     {}", plan.stale.join(", "));
                }
            }
            Err(_) => println!("Workspace is gone"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(home: &Path, json: bool) -> anyhow::Result<ExitCode> {
    let registry = Registry::from_config(&EngineConfig::new(home));
    let items = registry.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(ExitCode::SUCCESS);
    }
    if items.is_empty() {
        println!("No items registered");
        return Ok(ExitCode::SUCCESS);
    }
    for item in &items {
        let who = item
            .author
            .as_deref()
            .map(|a| format!(" by {a}"))
            .unwrap_or_default();
        println!(
            "{:<10} {}{}  ({})",
            item.status.to_string(),
            item.title,
            who,
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_validate(path: &Path) -> anyhow::Result<ExitCode> {
    let definition = PipelineDefinition::load(path).await?;
    definition.retry_policy()?;
    let diagnostics = conveyor_pipeline::validate(&definition.stage_table());

    if diagnostics.is_empty() {
        println!("Pipeline '{}' is valid ({} stages)", definition.name, definition.stages.len());
        return Ok(ExitCode::SUCCESS);
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.stage {
            Some(stage) => println!("[{severity}] {} ({stage}): {}", diag.rule, diag.message),
            None => println!("[{severity}] {}: {}", diag.rule, diag.message),
        }
    }

    if has_error {
        return Ok(ExitCode::from(EXIT_SETUP));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failures_exit_three() {
        let err = anyhow::Error::from(ConveyorError::FatalStageFailure {
            stage: "upload".into(),
            attempts: 5,
            reason: "503".into(),
        });
        assert_eq!(exit_code_for(&err), EXIT_STAGE);

        let err = anyhow::Error::from(ConveyorError::ArtifactMissing {
            stage: "render".into(),
            missing: vec!["a.mp4 does not exist".into()],
        });
        assert_eq!(exit_code_for(&err), EXIT_STAGE);
    }

    #[test]
    fn setup_failures_exit_two() {
        for err in [
            ConveyorError::DuplicateItem { key: "book a".into() },
            ConveyorError::WorkspaceBusy {
                path: "/w".into(),
                pid: 1,
            },
            ConveyorError::LockTimeout { path: "/r".into() },
            ConveyorError::Validation("bad".into()),
        ] {
            assert_eq!(exit_code_for(&anyhow::Error::from(err)), EXIT_SETUP);
        }
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), EXIT_SETUP);
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conveyor", "--home", "/tmp/h", "run", "Book A", "--author", "Ann", "--pipeline", "p.json",
        ])
        .unwrap();
        assert_eq!(cli.home, PathBuf::from("/tmp/h"));
        match cli.command {
            Commands::Run { title, author, .. } => {
                assert_eq!(title, "Book A");
                assert_eq!(author.as_deref(), Some("Ann"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_home_defaults() {
        let cli = Cli::try_parse_from(["conveyor", "list"]).unwrap();
        assert_eq!(cli.home, PathBuf::from(DEFAULT_HOME));
    }
}
