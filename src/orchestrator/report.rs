//! What an update run tells its caller: the remediation message when a human
//! has to finish the job, the error type, and the JSON run report.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::integration::{IntegrationStep, PatchConflict, Verdict};

use super::UpdateStep;

/// Why the search stopped short of a pushed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    /// Not a single new commit integrates cleanly.
    NothingClean,
    /// A clean commit exists and more than one commit follows it.
    Partial,
    /// A clean commit exists and only the upstream head follows it.
    PartialAtHead,
}

/// Human-actionable description of partial work left in the checkout.
#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub kind: RemediationKind,
    pub upstream: String,
    /// The commit whose partial integration is left in the workspace.
    pub commit: String,
    pub commit_url: String,
    pub branch: String,
    pub project_dir: PathBuf,
    pub push_remote: String,
    /// Newest commit that integrated cleanly, if any.
    pub best_commit: Option<String>,
    /// Commits after `commit` that still need integrating.
    pub remaining: usize,
    /// Suggested message for committing the manual fix.
    pub commit_message: String,
    pub patch_conflict: Option<PatchConflict>,
    /// Step results of the partial integration.
    pub step_summary: String,
}

fn quote(s: &str) -> String {
    shell_escape::escape(Cow::Borrowed(s)).into_owned()
}

impl RemediationReport {
    /// Commands that stage, commit and push the manual fix.
    pub fn follow_up_commands(&self) -> Vec<String> {
        let dir = quote(&self.project_dir.display().to_string());
        vec![
            format!(
                "git -C {dir} add . && git -C {dir} commit -m {}",
                quote(&self.commit_message)
            ),
            format!(
                "git -C {dir} push --force --set-upstream {} {}",
                quote(&self.push_remote),
                quote(&self.branch)
            ),
        ]
    }
}

impl fmt::Display for RemediationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Ran partial integration of {} commit {}.",
            self.upstream, self.commit
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "Branch {} in {} has been left with this integration applied. It introduced \
             merge conflicts, returned tooling errors, or failed to build and pass its tests.",
            self.branch,
            self.project_dir.display()
        )?;
        match (self.kind, &self.best_commit) {
            (RemediationKind::NothingClean, _) | (_, None) => writeln!(
                f,
                "None of the new upstream commits integrates cleanly; {} is the oldest of them.",
                self.commit
            )?,
            (RemediationKind::PartialAtHead, Some(best)) => writeln!(
                f,
                "{best} is the newest commit that integrates cleanly. {} is the upstream head, \
                 so no further commits remain after it.",
                self.commit
            )?,
            (RemediationKind::Partial, Some(best)) => writeln!(
                f,
                "{best} is the newest commit that integrates cleanly. {} more upstream \
                 commit(s) follow {}.",
                self.remaining, self.commit
            )?,
        }
        writeln!(f, "See {}.", self.commit_url)?;

        if let Some(conflict) = &self.patch_conflict {
            writeln!(f)?;
            writeln!(f, "{conflict}")?;
        }

        writeln!(f)?;
        writeln!(
            f,
            "Address the merge conflicts, tooling failures, and build or test failures. \
             Once all errors are resolved, commit and push the change:"
        )?;
        writeln!(f)?;
        for command in self.follow_up_commands() {
            writeln!(f, "  {command}")?;
        }
        if self.remaining > 0 {
            writeln!(f)?;
            writeln!(
                f,
                "Then run the update again to integrate the remaining commits."
            )?;
        }

        writeln!(f)?;
        writeln!(f, "Integration results for {}:", self.commit)?;
        write!(f, "{}", self.step_summary)
    }
}

impl std::error::Error for RemediationReport {}

/// Why an update run did not finish with a pushed branch or a no-op.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("precondition `{step}` failed: {message}")]
    Precondition { step: UpdateStep, message: String },

    #[error(transparent)]
    Remediation(Box<RemediationReport>),

    #[error("update step `{step}` failed:\n{summary}")]
    Step { step: UpdateStep, summary: String },
}

/// One probe as recorded in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub index: usize,
    pub commit: String,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<IntegrationStep>,
    pub agent_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRun,
    UpToDate,
    Pushed,
    Remediation,
    Failed,
}

/// Machine-readable summary of one update run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateReport {
    pub upstream: String,
    pub project_dir: PathBuf,
    pub branch: String,
    pub status: RunStatus,
    pub current_pin: Option<String>,
    pub commits: Vec<String>,
    pub probes: Vec<ProbeRecord>,
    pub best_commit: Option<String>,
    pub first_bad_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
