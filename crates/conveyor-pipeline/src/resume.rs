//! Where an interrupted job picks up again.
//!
//! The resume point is the first stage, in table order, whose artifact check
//! fails. The journal is read only to report where it disagrees with the
//! workspace.

use conveyor_types::Result;

use crate::journal::load_journal;
use crate::stage::StageTable;
use crate::verifier::verify;
use crate::workspace::JobWorkspace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Run from this stage onward.
    At(String),
    AllComplete,
}

/// Resume point together with what the journal and the artifacts each say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub point: ResumePoint,
    /// Index of the resume stage; equals the table length when all are complete.
    pub start_index: usize,
    pub journal_ok: Vec<String>,
    pub artifact_complete: Vec<String>,
    /// Journaled `ok` but the artifact is gone.
    pub stale: Vec<String>,
    /// Artifact present without an `ok` journal entry.
    pub unjournaled: Vec<String>,
}

impl ResumePlan {
    pub fn is_complete(&self) -> bool {
        self.point == ResumePoint::AllComplete
    }
}

pub async fn plan_resume(workspace: &JobWorkspace, table: &StageTable) -> Result<ResumePlan> {
    let journal = load_journal(workspace.root()).await?;
    let journal_ok: Vec<String> = journal
        .as_ref()
        .map(|j| j.ok_stages().into_iter().map(String::from).collect())
        .unwrap_or_default();

    let mut artifact_complete = Vec::new();
    let mut stale = Vec::new();
    let mut unjournaled = Vec::new();
    let mut start_index = None;

    for (index, stage) in table.iter().enumerate() {
        let name = stage.name();
        let verification = verify(workspace, table, name);
        let journaled = journal_ok.iter().any(|s| s == name);
        if verification.ok {
            artifact_complete.push(name.to_string());
            if !journaled {
                unjournaled.push(name.to_string());
            }
        } else {
            if journaled {
                tracing::warn!(
                    stage = %name,
                    missing = %verification.missing.join("; "),
                    "Journal says ok but artifact is missing; stage will rerun"
                );
                stale.push(name.to_string());
            }
            start_index.get_or_insert(index);
        }
    }

    let (point, start_index) = match start_index {
        Some(index) => {
            let name = table.names()[index].to_string();
            (ResumePoint::At(name), index)
        }
        None => (ResumePoint::AllComplete, table.len()),
    };
    tracing::debug!(
        workspace = %workspace.root().display(),
        point = ?point,
        complete = artifact_complete.len(),
        "Resume plan computed"
    );

    Ok(ResumePlan {
        point,
        start_index,
        journal_ok,
        artifact_complete,
        stale,
        unjournaled,
    })
}

pub async fn compute_resume_point(workspace: &JobWorkspace, table: &StageTable) -> Result<ResumePoint> {
    Ok(plan_resume(workspace, table).await?.point)
}
