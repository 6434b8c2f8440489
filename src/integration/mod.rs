//! Commit integration pipeline
//!
//! One probe of the search: starting from a checkout pinned at `from_commit`,
//! try to adopt upstream `to_commit`. The pipeline resets the project, moves
//! the pin, syncs the shared files, then builds, tests, regenerates docs,
//! formats and stages. The verdict is clean only if every step succeeds.

pub mod checksum;
pub mod pin_file;
pub mod shared_files;
pub mod steps;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::models::step::{format_step_results, StepResult};
use crate::process::{git, CommandRunner};
use crate::steps::{RecoveryConfig, RunOutcome, Step, StepContext, StepError, StepHandler};

pub use checksum::{ArchiveSource, HttpArchiveSource, StaticArchiveSource};
pub use shared_files::PatchConflict;

/// File name of the generated shared-files patch inside the upstream clone.
pub const PATCH_FILE_NAME: &str = "shared_files.patch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStep {
    ResetWorkspace,
    ComputeChecksum,
    RewritePin,
    CopyVerbatimFiles,
    PatchSharedFiles,
    RefreshRequirements,
    Build,
    Test,
    RegenerateDocs,
    FixFormat,
    StageChanges,
}

impl IntegrationStep {
    pub const ALL: [IntegrationStep; 11] = [
        IntegrationStep::ResetWorkspace,
        IntegrationStep::ComputeChecksum,
        IntegrationStep::RewritePin,
        IntegrationStep::CopyVerbatimFiles,
        IntegrationStep::PatchSharedFiles,
        IntegrationStep::RefreshRequirements,
        IntegrationStep::Build,
        IntegrationStep::Test,
        IntegrationStep::RegenerateDocs,
        IntegrationStep::FixFormat,
        IntegrationStep::StageChanges,
    ];
}

impl fmt::Display for IntegrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrationStep::ResetWorkspace => "reset workspace",
            IntegrationStep::ComputeChecksum => "compute archive checksum",
            IntegrationStep::RewritePin => "rewrite pin",
            IntegrationStep::CopyVerbatimFiles => "copy verbatim files",
            IntegrationStep::PatchSharedFiles => "patch shared files",
            IntegrationStep::RefreshRequirements => "refresh requirements",
            IntegrationStep::Build => "build",
            IntegrationStep::Test => "test",
            IntegrationStep::RegenerateDocs => "regenerate docs",
            IntegrationStep::FixFormat => "fix format",
            IntegrationStep::StageChanges => "stage changes",
        };
        write!(f, "{name}")
    }
}

/// Immutable inputs of one probe.
#[derive(Debug, Clone)]
pub struct IntegrationConfig<'a> {
    pub layout: &'a Config,
    pub project_dir: PathBuf,
    pub upstream_dir: PathBuf,
    /// The commit the project is pinned at before the probe.
    pub from_commit: String,
    pub to_commit: String,
}

/// Values derived while the pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct IntegrationScratch {
    pub checksum: Option<String>,
    pub patch_file: Option<PathBuf>,
}

pub struct IntegrationContext<'a> {
    pub config: IntegrationConfig<'a>,
    pub scratch: IntegrationScratch,
    runner: &'a dyn CommandRunner,
    archives: &'a dyn ArchiveSource,
}

impl<'a> IntegrationContext<'a> {
    pub fn new(
        config: IntegrationConfig<'a>,
        runner: &'a dyn CommandRunner,
        archives: &'a dyn ArchiveSource,
    ) -> Self {
        Self {
            config,
            scratch: IntegrationScratch::default(),
            runner,
            archives,
        }
    }

    pub fn archives(&self) -> &dyn ArchiveSource {
        self.archives
    }

    pub fn project_dir(&self) -> &Path {
        &self.config.project_dir
    }
}

impl StepContext for IntegrationContext<'_> {
    fn runner(&self) -> &dyn CommandRunner {
        self.runner
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        let mut state = vec![
            ("project_dir".to_string(), self.config.project_dir.display().to_string()),
            ("upstream_dir".to_string(), self.config.upstream_dir.display().to_string()),
            ("current_commit".to_string(), self.config.from_commit.clone()),
            ("target_commit".to_string(), self.config.to_commit.clone()),
        ];
        if let Some(checksum) = &self.scratch.checksum {
            state.push(("archive_checksum".to_string(), checksum.clone()));
        }
        if let Some(patch) = &self.scratch.patch_file {
            state.push(("patch_file".to_string(), patch.display().to_string()));
        }
        state
    }

    fn agent_dir(&self) -> Option<&Path> {
        self.config.project_dir.parent()
    }

    fn agent_supplement(&self) -> Option<String> {
        match self.runner.run(&git(&self.config.project_dir, ["diff"])) {
            Ok(diff) => Some(diff),
            Err(e) => {
                tracing::warn!(error = %e, "could not collect diff for the recovery agent");
                None
            }
        }
    }

    fn agent_instructions(&self) -> String {
        let upstream = &self.config.layout.upstream.name;
        format!(
            "The {upstream} dependency of the project checked out at {project} is being \
             moved from commit {from} to commit {to}, and the step above failed.\n\n\
             - Fix the files in {project} so that the failing step passes.\n\
             - Do not disable or rewrite tests, and do not change compiler flags, to make it pass.\n\
             - {upstream} sources are cloned in {upstream_dir}; \
             `git -C {upstream_dir} diff {from}..{to}` shows how upstream changed.\n\
             - Do not stage or commit anything; leave the changes in the working tree.",
            project = self.config.project_dir.display(),
            upstream_dir = self.config.upstream_dir.display(),
            from = self.config.from_commit,
            to = self.config.to_commit,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    Dirty,
}

impl Verdict {
    pub fn is_clean(self) -> bool {
        self == Verdict::Clean
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Clean => write!(f, "PASSED"),
            Verdict::Dirty => write!(f, "FAILED"),
        }
    }
}

/// Outcome of one probe.
#[derive(Debug)]
pub struct ProbeReport {
    pub commit: String,
    pub verdict: Verdict,
    pub results: Vec<(IntegrationStep, StepResult)>,
    /// The step that ended the run dirty, with its error.
    pub failure: Option<(IntegrationStep, StepError)>,
    pub agent_attempts: u32,
}

impl ProbeReport {
    /// Per-step summary for logs and remediation messages.
    pub fn summary(&self) -> String {
        format_step_results(self.results.iter().map(|(step, result)| (*step, result)))
    }

    pub fn patch_conflict(&self) -> Option<&PatchConflict> {
        match &self.failure {
            Some((_, StepError::PatchConflict(conflict))) => Some(conflict.as_ref()),
            _ => None,
        }
    }
}

/// The pipeline for one candidate commit.
pub struct CommitIntegration<'a> {
    handler: StepHandler<IntegrationStep, IntegrationContext<'a>>,
    ctx: IntegrationContext<'a>,
}

impl<'a> CommitIntegration<'a> {
    pub fn new(
        config: IntegrationConfig<'a>,
        runner: &'a dyn CommandRunner,
        archives: &'a dyn ArchiveSource,
        recovery: Option<RecoveryConfig>,
    ) -> Self {
        Self {
            handler: StepHandler::new(pipeline_steps(), recovery),
            ctx: IntegrationContext::new(config, runner, archives),
        }
    }

    pub fn run(mut self) -> ProbeReport {
        let commit = self.ctx.config.to_commit.clone();
        tracing::info!(commit = %commit, from = %self.ctx.config.from_commit, "integrating commit");

        let outcome = self.handler.run(&mut self.ctx);
        let agent_attempts = self.handler.agent_attempts();
        let (verdict, failure) = match outcome {
            RunOutcome::Clean => (Verdict::Clean, None),
            RunOutcome::Dirty { step, error } => (Verdict::Dirty, Some((step, error))),
        };
        tracing::info!(commit = %commit, %verdict, "integration finished");

        ProbeReport {
            commit,
            verdict,
            results: self.handler.into_results(),
            failure,
            agent_attempts,
        }
    }
}

fn pipeline_steps<'a>() -> Vec<Step<IntegrationStep, IntegrationContext<'a>>> {
    IntegrationStep::ALL
        .into_iter()
        .map(|id| Step::new(id, steps::step_fn(id)))
        .collect()
}
