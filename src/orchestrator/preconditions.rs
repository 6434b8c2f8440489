//! Repository checks and branch setup run before any integration work.
//!
//! Every check failure is a [`StepError::Precondition`], which is never retried.

use std::fs;

use crate::config::SigningPolicy;
use crate::process::git;
use crate::steps::{StepContext, StepControl, StepError};

use super::{UpdateContext, UpdateStep};

type Control = StepControl<UpdateStep>;

pub fn check_project_dir(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let dir = ctx.project_dir();
    if !dir.is_absolute() {
        return Err(StepError::Precondition(format!(
            "project directory must be an absolute path: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(StepError::Precondition(format!(
            "project directory not found: {}",
            dir.display()
        )));
    }
    Ok(())
}

pub fn check_git_repo(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let dir = ctx.project_dir();
    ctx.runner()
        .run(&git(dir, ["rev-parse", "--is-inside-work-tree"]))
        .map_err(|_| {
            StepError::Precondition(format!("{} is not a git repository", dir.display()))
        })?;
    Ok(())
}

pub fn check_signing(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let dir = ctx.project_dir();
    match &ctx.layout.signing {
        SigningPolicy::None => Ok(()),
        SigningPolicy::PrepareCommitHook { template } => {
            let expected = fs::read(dir.join(template)).map_err(|e| {
                StepError::Precondition(format!(
                    "signing hook template {} could not be read: {e}",
                    template.display()
                ))
            })?;
            let installed = fs::read(dir.join(".git/hooks/prepare-commit-msg")).ok();
            if installed.as_deref() != Some(expected.as_slice()) {
                return Err(StepError::Precondition(format!(
                    "{} is not configured to sign commits; install {} as \
                     .git/hooks/prepare-commit-msg",
                    dir.display(),
                    template.display()
                )));
            }
            Ok(())
        }
        SigningPolicy::Gpg => {
            let value = ctx
                .runner()
                .run(&git(dir, ["config", "--get", "commit.gpgsign"]))
                .unwrap_or_default();
            if value.trim() != "true" {
                return Err(StepError::Precondition(format!(
                    "{} is not configured to sign commits; set `git config commit.gpgsign true`",
                    dir.display()
                )));
            }
            Ok(())
        }
    }
}

pub fn check_clean_tree(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let status = ctx
        .runner()
        .run(&git(ctx.project_dir(), ["status", "--porcelain"]))?;
    if !status.is_empty() {
        return Err(StepError::Precondition(
            "the project has uncommitted changes; reset or commit them".to_string(),
        ));
    }
    Ok(())
}

fn normalize_remote_url(url: &str) -> &str {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}

pub fn check_upstream_remote(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let remotes = &ctx.layout.remotes;
    let url = ctx
        .runner()
        .run(&git(ctx.project_dir(), ["remote", "get-url", remotes.upstream.as_str()]))
        .map_err(|_| {
            StepError::Precondition(format!(
                "no remote named {} set to {}",
                remotes.upstream, remotes.upstream_url
            ))
        })?;
    if normalize_remote_url(&url) != normalize_remote_url(&remotes.upstream_url) {
        return Err(StepError::Precondition(format!(
            "remote {} is set to {url}, expected {}",
            remotes.upstream, remotes.upstream_url
        )));
    }
    Ok(())
}

pub fn check_push_remote(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let push = ctx.layout.remotes.push.as_str();
    ctx.runner()
        .run(&git(ctx.project_dir(), ["remote", "get-url", push]))
        .map_err(|_| {
            StepError::Precondition(format!(
                "no remote named {push} is configured to push the update branch to"
            ))
        })?;
    Ok(())
}

/// Bring the default branch up to date with upstream and publish it.
pub fn sync_default_branch(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let dir = ctx.project_dir();
    let remotes = &ctx.layout.remotes;
    let default = remotes.default_branch.as_str();
    let runner = ctx.runner();

    runner.run(&git(dir, ["checkout", default]))?;
    runner.run(&git(dir, ["fetch", "--all"]).interactive())?;
    runner.run(&git(
        dir,
        ["merge".to_string(), format!("{}/{default}", remotes.upstream)],
    ))?;
    runner.run(&git(dir, ["push", remotes.push.as_str(), default]).interactive())?;
    Ok(())
}

/// Create the update branch from the pushed default branch, or rebase it if
/// it already exists.
pub fn checkout_update_branch(ctx: &mut UpdateContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let dir = ctx.project_dir();
    let branch = ctx.options.branch_name.as_str();
    let base = format!("{}/{}", ctx.layout.remotes.push, ctx.layout.remotes.default_branch);
    let runner = ctx.runner();

    if let Err(e) = runner.run(&git(dir, ["checkout", "-b", branch, base.as_str()])) {
        tracing::info!(branch, error = %e, "branch exists, checking it out and rebasing");
        runner.run(&git(dir, ["checkout", branch]))?;
        runner.run(&git(dir, ["rebase", base.as_str()]))?;
    }
    Ok(())
}
