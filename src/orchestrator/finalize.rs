//! Running the search and acting on its result.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::integration::Verdict;
use crate::process::git;
use crate::steps::{StepContext, StepControl, StepError};

use super::bisect::{bisect, SearchOutcome};
use super::report::{RemediationKind, RemediationReport};
use super::{UpdateContext, UpdateOutcome, UpdateStep};

type Control = StepControl<UpdateStep>;

/// What to do once the search is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finalization {
    /// No commit integrates cleanly; `first_bad` is the oldest commit.
    NothingClean { first_bad: usize },
    /// The newest commit integrates cleanly.
    Newest { best: usize },
    /// A clean commit exists, and the one after it is the upstream head.
    PartialAtHead { best: usize, head: usize },
    /// A clean commit exists, and further commits follow the first bad one.
    Partial { best: usize, first_bad: usize },
}

impl Finalization {
    /// Decide from a finished search over `len` commits.
    pub fn plan(outcome: &SearchOutcome, len: usize) -> Option<Self> {
        let last = len.checked_sub(1)?;
        Some(match outcome.best_good {
            None => Finalization::NothingClean { first_bad: 0 },
            Some(best) if best >= last => Finalization::Newest { best: last },
            Some(best) if best + 1 == last => Finalization::PartialAtHead { best, head: last },
            Some(best) => Finalization::Partial {
                best,
                first_bad: best + 1,
            },
        })
    }
}

/// One log line per commit worth showing: probed ones with their verdict,
/// the one about to be probed, and both ends of the range.
pub fn status_table(
    commits: &[String],
    verdicts: impl Fn(usize) -> Option<Verdict>,
    next: Option<usize>,
    commit_url: impl Fn(&str) -> String,
) -> Vec<String> {
    let last = commits.len().saturating_sub(1);
    commits
        .iter()
        .enumerate()
        .filter_map(|(i, commit)| {
            let status = match verdicts(i) {
                Some(verdict) => verdict.to_string(),
                None if next == Some(i) => "---->".to_string(),
                None if i == 0 || i == last => String::new(),
                None => return None,
            };
            Some(format!("[{status:^8}] {}", commit_url(commit)))
        })
        .collect()
}

fn log_status(ctx: &UpdateContext<'_>, next: Option<usize>) {
    let lines = status_table(
        &ctx.state.commits,
        |i| ctx.state.reports.get(&i).map(|r| r.verdict),
        next,
        |commit| ctx.commit_url(commit),
    );
    tracing::info!("bisection status:\n{}", lines.join("\n"));
}

pub fn find_latest_clean_commit(ctx: &mut UpdateContext<'_>, control: &mut Control) -> Result<(), StepError> {
    ctx.current_pin()?;
    ctx.upstream_dir()?;
    let len = ctx.state.commits.len();

    let mut probe_error = None;
    let outcome = bisect(len, |index| {
        log_status(ctx, Some(index));
        match ctx.probe(index) {
            Ok(verdict) => verdict,
            Err(e) => {
                probe_error.get_or_insert(e);
                Verdict::Dirty
            }
        }
    });
    if let Some(e) = probe_error {
        return Err(e);
    }
    log_status(ctx, None);

    let finalization = Finalization::plan(&outcome, len)
        .ok_or_else(|| StepError::Runtime("no upstream commits to search".to_string()))?;
    tracing::info!(
        probes = outcome.probes.len(),
        ?finalization,
        "search finished"
    );
    match finalization {
        Finalization::Newest { .. } => {
            tracing::info!("the newest upstream commit integrates cleanly");
            control.skip(UpdateStep::ApplyPartialIntegration);
        }
        Finalization::NothingClean { .. } => {
            tracing::info!("no upstream commit integrates cleanly");
            control.skip(UpdateStep::CommitAndPush);
        }
        Finalization::PartialAtHead { .. } | Finalization::Partial { .. } => {
            tracing::info!("a clean commit was found, with further upstream commits after it");
            control.skip(UpdateStep::CommitAndPush);
        }
    }
    ctx.state.search = Some(outcome);
    ctx.state.finalization = Some(finalization);
    Ok(())
}

/// `Updating <Upstream> version to <sha7> (<date>)`, a blank line, and a
/// link to the commit. The date is left out when it is unknown.
pub fn format_commit_message(
    upstream: &str,
    commit: &str,
    date: Option<DateTime<Utc>>,
    url: &str,
) -> String {
    let short = commit.get(..7).unwrap_or(commit);
    match date {
        Some(date) => format!(
            "Updating {upstream} version to {short} ({})\n\nSee {url}.",
            date.format("%Y-%m-%dT%H:%M:%SZ")
        ),
        None => format!("Updating {upstream} version to {short}\n\nSee {url}."),
    }
}

fn commit_message(ctx: &UpdateContext<'_>, commit: &str) -> Result<String, StepError> {
    let upstream_dir = ctx.upstream_dir()?;
    let raw = ctx
        .runner()
        .run(&git(&upstream_dir, ["show", "-s", "--pretty=format:%ct", commit]))?;
    let seconds: i64 = raw
        .trim()
        .parse()
        .map_err(|_| StepError::InvalidValue(format!("commit time of {commit} is {raw:?}")))?;
    let date = DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| StepError::InvalidValue(format!("commit time of {commit} is out of range")))?;
    Ok(format_commit_message(
        &ctx.layout.upstream.name,
        commit,
        Some(date),
        &ctx.commit_url(commit),
    ))
}

fn commit_at(ctx: &UpdateContext<'_>, index: usize) -> Result<String, StepError> {
    ctx.state
        .commits
        .get(index)
        .cloned()
        .ok_or_else(|| StepError::Runtime(format!("no upstream commit at index {index}")))
}

pub fn commit_and_push(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let Some(Finalization::Newest { best }) = ctx.state.finalization else {
        return Err(StepError::Runtime(
            "attempted to commit without a cleanly integrating commit".to_string(),
        ));
    };
    let commit = commit_at(ctx, best)?;

    // The workspace holds whatever the last probe left.
    if ctx.state.last_probed != Some(best) && !ctx.probe(best)?.is_clean() {
        return Err(StepError::Runtime(format!(
            "{commit} did not integrate cleanly when re-run"
        )));
    }

    let message = commit_message(ctx, &commit)?;
    let project_dir = ctx.project_dir();
    let branch = ctx.options.branch_name.as_str();
    ctx.runner()
        .run(&git(project_dir, ["commit", "-m", message.as_str()]).interactive())?;
    ctx.runner().run(
        &git(
            project_dir,
            [
                "push",
                "--force",
                "--set-upstream",
                ctx.layout.remotes.push.as_str(),
                branch,
            ],
        )
        .interactive(),
    )?;

    tracing::info!(branch, commit = %commit, "update branch pushed, ready for review");
    ctx.state.outcome = Some(UpdateOutcome::Pushed {
        branch: branch.to_string(),
        commit,
    });
    Ok(())
}

pub fn apply_partial_integration(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let (kind, target, best) = match ctx.state.finalization {
        Some(Finalization::NothingClean { first_bad }) => (RemediationKind::NothingClean, first_bad, None),
        Some(Finalization::Partial { best, first_bad }) => (RemediationKind::Partial, first_bad, Some(best)),
        Some(Finalization::PartialAtHead { best, head }) => {
            (RemediationKind::PartialAtHead, head, Some(best))
        }
        Some(Finalization::Newest { .. }) | None => {
            return Err(StepError::Runtime(
                "attempted a partial integration without an unresolved commit".to_string(),
            ))
        }
    };
    let commit = commit_at(ctx, target)?;

    // Leave the first unresolved commit's partial state in the workspace,
    // not the last clean one.
    if ctx.state.last_probed != Some(target) {
        tracing::info!(commit = %commit, "re-running integration of the first unresolved commit");
        if ctx.probe(target)?.is_clean() {
            tracing::warn!(commit = %commit, "commit integrated cleanly on re-run");
        }
    }

    let best_commit = match best {
        Some(index) => Some(commit_at(ctx, index)?),
        None => None,
    };
    let (step_summary, patch_conflict) = match ctx.state.reports.get(&target) {
        Some(report) => (report.summary(), report.patch_conflict().cloned()),
        None => (String::new(), None),
    };

    let commit_message = commit_message(ctx, &commit).unwrap_or_else(|e| {
        tracing::warn!(error = %e, %commit, "commit time unavailable, suggesting a message without it");
        format_commit_message(&ctx.layout.upstream.name, &commit, None, &ctx.commit_url(&commit))
    });
    let report = RemediationReport {
        kind,
        upstream: ctx.layout.upstream.name.clone(),
        commit_url: ctx.commit_url(&commit),
        branch: ctx.options.branch_name.clone(),
        project_dir: ctx.project_dir().to_path_buf(),
        push_remote: ctx.layout.remotes.push.clone(),
        best_commit,
        remaining: ctx.state.commits.len() - 1 - target,
        commit_message,
        patch_conflict,
        step_summary,
        commit,
    };
    Err(StepError::Remediation(Box::new(report)))
}
