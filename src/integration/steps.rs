//! Step functions of the commit integration pipeline.

use crate::process::{git, CommandSpec};
use crate::steps::{StepContext, StepControl, StepError, StepFn};

use super::checksum::archive_checksum;
use super::pin_file::write_pin;
use super::shared_files::{apply_shared_patch, copy_verbatim, find_rejects, write_shared_diff};
use super::{IntegrationContext, IntegrationStep, PatchConflict, PATCH_FILE_NAME};

type Control = StepControl<IntegrationStep>;

type PipelineFn<'a> = StepFn<IntegrationStep, IntegrationContext<'a>>;

/// The function implementing `step`.
pub fn step_fn<'a>(step: IntegrationStep) -> PipelineFn<'a> {
    match step {
        IntegrationStep::ResetWorkspace => reset_workspace as PipelineFn<'a>,
        IntegrationStep::ComputeChecksum => compute_checksum as PipelineFn<'a>,
        IntegrationStep::RewritePin => rewrite_pin as PipelineFn<'a>,
        IntegrationStep::CopyVerbatimFiles => copy_verbatim_files as PipelineFn<'a>,
        IntegrationStep::PatchSharedFiles => patch_shared_files as PipelineFn<'a>,
        IntegrationStep::RefreshRequirements => refresh_requirements as PipelineFn<'a>,
        IntegrationStep::Build => build as PipelineFn<'a>,
        IntegrationStep::Test => test as PipelineFn<'a>,
        IntegrationStep::RegenerateDocs => regenerate_docs as PipelineFn<'a>,
        IntegrationStep::FixFormat => fix_format as PipelineFn<'a>,
        IntegrationStep::StageChanges => stage_changes as PipelineFn<'a>,
    }
}

/// Discard anything a previous probe left behind, staged or not.
pub fn reset_workspace(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let dir = ctx.project_dir();
    ctx.runner().run(&git(dir, ["reset", "--hard", "HEAD"]))?;
    ctx.runner().run(&git(dir, ["clean", "-fd"]))?;
    Ok(())
}

pub fn compute_checksum(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let url = ctx
        .config
        .layout
        .upstream
        .archive_url_for(&ctx.config.to_commit);
    let checksum = archive_checksum(ctx.archives(), &url)?;
    tracing::info!(commit = %ctx.config.to_commit, %checksum, "archive checksum");
    ctx.scratch.checksum = Some(checksum);
    Ok(())
}

pub fn rewrite_pin(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let checksum = ctx
        .scratch
        .checksum
        .as_deref()
        .ok_or_else(|| StepError::Runtime("archive checksum was not computed".to_string()))?;
    let pin = &ctx.config.layout.pin;
    write_pin(
        &ctx.config.project_dir.join(&pin.file),
        &pin.commit_key,
        &ctx.config.to_commit,
        &pin.checksum_key,
        checksum,
    )
}

/// Check the upstream clone out at the target commit, then copy its files.
pub fn copy_verbatim_files(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    ctx.runner().run(&git(
        &ctx.config.upstream_dir,
        ["checkout", "--force", "--detach", ctx.config.to_commit.as_str()],
    ))?;
    copy_verbatim(
        &ctx.config.upstream_dir,
        &ctx.config.project_dir,
        &ctx.config.layout.files.copied,
    )
}

pub fn patch_shared_files(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    let files = &ctx.config.layout.files;
    let patch_file = ctx.config.upstream_dir.join(PATCH_FILE_NAME);
    ctx.scratch.patch_file = Some(patch_file.clone());

    let has_changes = write_shared_diff(
        ctx.runner(),
        &ctx.config.upstream_dir,
        &ctx.config.from_commit,
        &ctx.config.to_commit,
        &files.shared,
        &patch_file,
    )?;
    if !has_changes {
        tracing::info!("no upstream changes to shared files");
        return Ok(());
    }

    apply_shared_patch(ctx.runner(), &ctx.config.project_dir, &patch_file).map_err(|source| {
        StepError::PatchConflict(Box::new(PatchConflict {
            upstream: ctx.config.layout.upstream.name.clone(),
            commit: ctx.config.to_commit.clone(),
            shared_files: files.shared.clone(),
            marker: files.divergence_marker.clone(),
            project_dir: ctx.config.project_dir.clone(),
            rejects: find_rejects(&ctx.config.project_dir),
            source,
        }))
    })
}

fn run_project_command(ctx: &IntegrationContext<'_>, argv: &[String]) -> Result<(), StepError> {
    ctx.runner()
        .run(&CommandSpec::from_argv(argv).current_dir(ctx.project_dir()))?;
    Ok(())
}

pub fn refresh_requirements(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    run_project_command(ctx, &ctx.config.layout.commands.refresh_requirements)
}

pub fn build(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    run_project_command(ctx, &ctx.config.layout.commands.build)
}

pub fn test(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    run_project_command(ctx, &ctx.config.layout.commands.test)
}

pub fn regenerate_docs(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    run_project_command(ctx, &ctx.config.layout.commands.docs)
}

pub fn fix_format(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    run_project_command(ctx, &ctx.config.layout.commands.format)
}

pub fn stage_changes(ctx: &mut IntegrationContext<'_>, _: &mut Control) -> Result<(), StepError> {
    ctx.runner().run(&git(ctx.project_dir(), ["add", "."]))?;
    Ok(())
}
