//! Update orchestration
//!
//! Validates the project checkout, prepares the update branch, finds the
//! upstream commits past the current pin, searches them for the newest one
//! that integrates cleanly, then either pushes the update or leaves the next
//! unresolved commit staged for a human.
//!
//! The orchestrator is itself a step pipeline without recovery: every one of
//! its failures is fatal.

pub mod bisect;
pub mod finalize;
pub mod preconditions;
pub mod report;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::config::{Config, UpstreamConfig};
use crate::integration::pin_file::read_pinned_commit;
use crate::integration::{
    ArchiveSource, CommitIntegration, IntegrationConfig, ProbeReport, Verdict,
};
use crate::models::StepResult;
use crate::process::{git, CommandRunner, CommandSpec};
use crate::steps::{
    error_chain, RecoveryConfig, RunOutcome, Step, StepContext, StepControl, StepError,
    StepHandler,
};

pub use bisect::{bisect, max_probes, SearchOutcome};
pub use finalize::Finalization;
pub use report::{
    ProbeRecord, RemediationKind, RemediationReport, RunStatus, UpdateError, UpdateReport,
};

pub const DEFAULT_CLONE_DEPTH: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStep {
    CheckProjectDir,
    CheckGitRepo,
    CheckSigning,
    CheckCleanTree,
    CheckUpstreamRemote,
    CheckPushRemote,
    SyncDefaultBranch,
    CheckoutUpdateBranch,
    ReadCurrentPin,
    CloneUpstream,
    DiscoverCommitRange,
    CleanBuildCache,
    FindLatestCleanCommit,
    CommitAndPush,
    ApplyPartialIntegration,
}

impl fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStep::CheckProjectDir => "check-project-dir",
            UpdateStep::CheckGitRepo => "check-git-repo",
            UpdateStep::CheckSigning => "check-signing",
            UpdateStep::CheckCleanTree => "check-clean-tree",
            UpdateStep::CheckUpstreamRemote => "check-upstream-remote",
            UpdateStep::CheckPushRemote => "check-push-remote",
            UpdateStep::SyncDefaultBranch => "sync-default-branch",
            UpdateStep::CheckoutUpdateBranch => "checkout-update-branch",
            UpdateStep::ReadCurrentPin => "read-current-pin",
            UpdateStep::CloneUpstream => "clone-upstream",
            UpdateStep::DiscoverCommitRange => "discover-commit-range",
            UpdateStep::CleanBuildCache => "clean-build-cache",
            UpdateStep::FindLatestCleanCommit => "find-latest-clean-commit",
            UpdateStep::CommitAndPush => "commit-and-push",
            UpdateStep::ApplyPartialIntegration => "apply-partial-integration",
        };
        write!(f, "{name}")
    }
}

/// Per-run choices, as opposed to the project layout in [`Config`].
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub project_dir: PathBuf,
    pub branch_name: String,
    pub clone_depth: u32,
    pub sync_default_branch: bool,
    /// Probe only the newest upstream commit.
    pub skip_bisection: bool,
    pub recovery: Option<RecoveryConfig>,
}

impl UpdateOptions {
    /// A relative `project_dir` is resolved against the current directory.
    pub fn new(project_dir: impl Into<PathBuf>, upstream: &UpstreamConfig) -> Self {
        let project_dir = project_dir.into();
        Self {
            project_dir: std::path::absolute(&project_dir).unwrap_or(project_dir),
            branch_name: default_branch_name(upstream, Utc::now().date_naive()),
            clone_depth: DEFAULT_CLONE_DEPTH,
            sync_default_branch: true,
            skip_bisection: false,
            recovery: None,
        }
    }
}

/// `update-<upstream>-YYYYMMDD`.
pub fn default_branch_name(upstream: &UpstreamConfig, date: NaiveDate) -> String {
    format!("update-{}-{}", upstream.slug(), date.format("%Y%m%d"))
}

/// The result of a run that needs no human follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// No upstream commits past the pin.
    UpToDate { pin: String },
    /// The update branch was committed and pushed for review.
    Pushed { branch: String, commit: String },
}

/// Values discovered while the orchestrator runs.
#[derive(Debug, Default)]
pub struct UpdateState {
    pub current_pin: Option<String>,
    /// Removed on drop.
    pub upstream_clone: Option<TempDir>,
    /// Upstream commits after the pin, oldest first.
    pub commits: Vec<String>,
    pub probes: Vec<ProbeRecord>,
    /// Latest probe report per commit index.
    pub reports: BTreeMap<usize, ProbeReport>,
    pub last_probed: Option<usize>,
    pub search: Option<SearchOutcome>,
    pub finalization: Option<Finalization>,
    pub outcome: Option<UpdateOutcome>,
}

pub struct UpdateContext<'a> {
    pub options: &'a UpdateOptions,
    pub layout: &'a Config,
    pub state: UpdateState,
    runner: &'a dyn CommandRunner,
    archives: &'a dyn ArchiveSource,
}

impl<'a> UpdateContext<'a> {
    pub fn project_dir(&self) -> &Path {
        &self.options.project_dir
    }

    pub fn upstream_dir(&self) -> Result<PathBuf, StepError> {
        self.state
            .upstream_clone
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| StepError::Runtime("upstream repository was not cloned".to_string()))
    }

    pub fn current_pin(&self) -> Result<String, StepError> {
        self.state
            .current_pin
            .clone()
            .ok_or_else(|| StepError::Runtime("current pin was not read".to_string()))
    }

    pub fn commit_url(&self, commit: &str) -> String {
        self.layout.upstream.commit_url_for(commit)
    }

    /// Run the integration pipeline for `commits[index]` from the current pin.
    pub fn probe(&mut self, index: usize) -> Result<Verdict, StepError> {
        let commit = self
            .state
            .commits
            .get(index)
            .cloned()
            .ok_or_else(|| StepError::Runtime(format!("no upstream commit at index {index}")))?;
        let config = IntegrationConfig {
            layout: self.layout,
            project_dir: self.options.project_dir.clone(),
            upstream_dir: self.upstream_dir()?,
            from_commit: self.current_pin()?,
            to_commit: commit,
        };

        let report = CommitIntegration::new(
            config,
            self.runner,
            self.archives,
            self.options.recovery.clone(),
        )
        .run();

        if !report.verdict.is_clean() {
            tracing::warn!(
                commit = %report.commit,
                "integration is not clean\n{}",
                report.summary()
            );
        }
        let verdict = report.verdict;
        self.state.probes.push(ProbeRecord {
            index,
            commit: report.commit.clone(),
            verdict,
            failed_step: report.failure.as_ref().map(|(step, _)| *step),
            agent_attempts: report.agent_attempts,
        });
        self.state.reports.insert(index, report);
        self.state.last_probed = Some(index);
        Ok(verdict)
    }
}

impl StepContext for UpdateContext<'_> {
    fn runner(&self) -> &dyn CommandRunner {
        self.runner
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        let mut state = vec![
            ("project_dir".to_string(), self.options.project_dir.display().to_string()),
            ("branch".to_string(), self.options.branch_name.clone()),
            ("clone_depth".to_string(), self.options.clone_depth.to_string()),
        ];
        if let Some(pin) = &self.state.current_pin {
            state.push(("current_pin".to_string(), pin.clone()));
        }
        if let Some(clone) = &self.state.upstream_clone {
            state.push(("upstream_dir".to_string(), clone.path().display().to_string()));
        }
        if !self.state.commits.is_empty() {
            state.push(("new_commits".to_string(), self.state.commits.len().to_string()));
        }
        state
    }
}

type Control = StepControl<UpdateStep>;

fn read_current_pin(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let pin = &ctx.layout.pin;
    let commit = read_pinned_commit(&ctx.project_dir().join(&pin.file), &pin.commit_key)?;
    tracing::info!(pin = %commit, "current upstream pin");
    ctx.state.current_pin = Some(commit);
    Ok(())
}

/// Next to the checkout rather than in /tmp, which is often too small, and
/// never inside it.
fn clone_parent(project_dir: &Path) -> PathBuf {
    project_dir
        .parent()
        .filter(|parent| parent.is_absolute())
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
}

fn clone_upstream(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let parent = clone_parent(ctx.project_dir());
    let dir = tempfile::Builder::new()
        .prefix("upstream-clone-")
        .tempdir_in(&parent)
        .map_err(|e| StepError::io(&parent, format!("creating clone directory in {}", parent.display()), e))?;

    ctx.runner().run(
        &CommandSpec::new("git")
            .arg("clone")
            .arg(format!("--depth={}", ctx.options.clone_depth))
            .arg(ctx.layout.upstream.repository.as_str())
            .arg(dir.path().display().to_string()),
    )?;
    ctx.state.upstream_clone = Some(dir);
    Ok(())
}

fn discover_commit_range(ctx: &mut UpdateContext<'_>, control: &mut Control) -> Result<(), StepError> {
    let pin = ctx.current_pin()?;
    let upstream_dir = ctx.upstream_dir()?;
    let range = format!("{pin}..HEAD");
    let log = git(&upstream_dir, ["log", "--reverse", "--pretty=%H", range.as_str()]);
    let output = ctx.runner().run(&log).map_err(|e| {
        tracing::debug!(error = %e, "git log failed");
        StepError::InvalidValue(format!(
            "the current pin {pin} was not found in the cloned {} history; \
             try again with a --clone-depth larger than {}",
            ctx.layout.upstream.name, ctx.options.clone_depth
        ))
    })?;

    let mut commits: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if commits.is_empty() {
        tracing::info!(pin = %pin, "already up to date, no new upstream commits");
        ctx.state.outcome = Some(UpdateOutcome::UpToDate { pin });
        control.skip(UpdateStep::CleanBuildCache);
        control.skip(UpdateStep::FindLatestCleanCommit);
        control.skip(UpdateStep::CommitAndPush);
        control.skip(UpdateStep::ApplyPartialIntegration);
        return Ok(());
    }

    tracing::info!(count = commits.len(), "new upstream commits");
    if ctx.options.skip_bisection {
        commits = commits.split_off(commits.len() - 1);
        tracing::info!(commit = %commits[0], "bisection skipped, trying the newest commit only");
    }
    ctx.state.commits = commits;
    Ok(())
}

fn clean_build_cache(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let Some(argv) = &ctx.layout.commands.clean_cache else {
        return Ok(());
    };
    ctx.runner()
        .run(&CommandSpec::from_argv(argv).current_dir(ctx.project_dir()))?;
    Ok(())
}

fn update_steps<'a>() -> Vec<Step<UpdateStep, UpdateContext<'a>>> {
    vec![
        Step::new(UpdateStep::CheckProjectDir, preconditions::check_project_dir),
        Step::new(UpdateStep::CheckGitRepo, preconditions::check_git_repo),
        Step::new(UpdateStep::CheckSigning, preconditions::check_signing),
        Step::new(UpdateStep::CheckCleanTree, preconditions::check_clean_tree),
        Step::new(UpdateStep::CheckUpstreamRemote, preconditions::check_upstream_remote),
        Step::new(UpdateStep::CheckPushRemote, preconditions::check_push_remote),
        Step::new(UpdateStep::SyncDefaultBranch, preconditions::sync_default_branch),
        Step::new(UpdateStep::CheckoutUpdateBranch, preconditions::checkout_update_branch),
        Step::new(UpdateStep::ReadCurrentPin, read_current_pin),
        Step::new(UpdateStep::CloneUpstream, clone_upstream),
        Step::new(UpdateStep::DiscoverCommitRange, discover_commit_range),
        Step::new(UpdateStep::CleanBuildCache, clean_build_cache),
        Step::new(UpdateStep::FindLatestCleanCommit, finalize::find_latest_clean_commit),
        Step::new(UpdateStep::CommitAndPush, finalize::commit_and_push),
        Step::new(UpdateStep::ApplyPartialIntegration, finalize::apply_partial_integration),
    ]
}

/// Rolls the upstream pin of one project checkout forward.
pub struct Updater<'a> {
    handler: StepHandler<UpdateStep, UpdateContext<'a>>,
    ctx: UpdateContext<'a>,
    status: RunStatus,
    message: Option<String>,
}

impl<'a> Updater<'a> {
    pub fn new(
        options: &'a UpdateOptions,
        layout: &'a Config,
        runner: &'a dyn CommandRunner,
        archives: &'a dyn ArchiveSource,
    ) -> Self {
        let mut handler = StepHandler::new(update_steps(), None);
        if !options.sync_default_branch {
            handler.mark_not_planned(UpdateStep::SyncDefaultBranch);
        }
        if layout.commands.clean_cache.is_none() {
            handler.mark_not_planned(UpdateStep::CleanBuildCache);
        }
        Self {
            handler,
            ctx: UpdateContext {
                options,
                layout,
                state: UpdateState::default(),
                runner,
                archives,
            },
            status: RunStatus::NotRun,
            message: None,
        }
    }

    pub fn run(&mut self) -> Result<UpdateOutcome, UpdateError> {
        let result = match self.handler.run(&mut self.ctx) {
            RunOutcome::Clean => self.ctx.state.outcome.clone().ok_or_else(|| UpdateError::Step {
                step: UpdateStep::CommitAndPush,
                summary: "the update finished without an outcome".to_string(),
            }),
            RunOutcome::Dirty { step, error } => Err(self.classify(step, error)),
        };

        match &result {
            Ok(UpdateOutcome::UpToDate { .. }) => self.status = RunStatus::UpToDate,
            Ok(UpdateOutcome::Pushed { branch, .. }) => {
                self.status = RunStatus::Pushed;
                self.message = Some(format!("pushed branch {branch}"));
            }
            Err(err) => {
                self.status = match err {
                    UpdateError::Remediation(_) => RunStatus::Remediation,
                    _ => RunStatus::Failed,
                };
                self.message = Some(err.to_string());
            }
        }
        result
    }

    fn classify(&self, step: UpdateStep, error: StepError) -> UpdateError {
        match error {
            StepError::Precondition(message) => UpdateError::Precondition { step, message },
            StepError::Remediation(report) => UpdateError::Remediation(report),
            other => {
                let summary = format!("{}\n\n{}", error_chain(&other), self.handler.format_results());
                tracing::error!(step = %step, "update failed\n{summary}");
                UpdateError::Step { step, summary }
            }
        }
    }

    pub fn step_results(&self) -> Vec<(UpdateStep, &StepResult)> {
        self.handler.results().collect()
    }

    pub fn state(&self) -> &UpdateState {
        &self.ctx.state
    }

    pub fn report(&self) -> UpdateReport {
        let state = &self.ctx.state;
        let commit_at = |index: Option<usize>| index.and_then(|i| state.commits.get(i).cloned());
        let search = state.search.as_ref();
        UpdateReport {
            upstream: self.ctx.layout.upstream.name.clone(),
            project_dir: self.ctx.options.project_dir.clone(),
            branch: self.ctx.options.branch_name.clone(),
            status: self.status,
            current_pin: state.current_pin.clone(),
            commits: state.commits.clone(),
            probes: state.probes.clone(),
            best_commit: commit_at(search.and_then(|s| s.best_good)),
            first_bad_commit: commit_at(search.and_then(|s| s.first_bad)),
            message: self.message.clone(),
        }
    }
}
