//! Files kept in step with upstream: copied verbatim, or patched when the
//! project carries small local deviations.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{git, CommandFailure, CommandRunner};
use crate::steps::StepError;

/// Upstream changes to shared files that did not apply cleanly.
#[derive(Debug, Clone)]
pub struct PatchConflict {
    pub upstream: String,
    /// Candidate commit whose shared-file changes were being applied.
    pub commit: String,
    pub shared_files: Vec<String>,
    pub marker: String,
    pub project_dir: PathBuf,
    /// `.rej` files left by the best-effort apply, relative to `project_dir`.
    pub rejects: Vec<PathBuf>,
    pub source: CommandFailure,
}

impl fmt::Display for PatchConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = &self.marker;
        writeln!(f, "New merge conflicts from integrating changes in shared files.")?;
        writeln!(f)?;
        writeln!(
            f,
            "This project maintains its own copies of a subset of files from {}: {}",
            self.upstream,
            self.shared_files.join(", ")
        )?;
        writeln!(
            f,
            "They configure the build and test environments and are kept in sync \
             with upstream. The local copies carry small modifications, each marked \
             inline with `{marker}`."
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "The shared-file changes from {} commit {} could not be applied \
             automatically, most likely because the patch touches a line marked \
             `{marker}`. Combine the upstream change with the local version into an \
             updated `{marker}` line, and check whether the deviation is still needed.",
            self.upstream, self.commit
        )?;
        writeln!(f)?;
        if self.rejects.is_empty() {
            write!(
                f,
                "No .rej files were produced; re-apply the upstream diff of the shared \
                 files by hand in {}.",
                self.project_dir.display()
            )
        } else {
            writeln!(
                f,
                "Rejected hunks were written next to the affected files in {}:",
                self.project_dir.display()
            )?;
            for reject in &self.rejects {
                writeln!(f, "  {}", reject.display())?;
            }
            write!(
                f,
                "Reconcile each one into the project copy, delete the .rej file, and commit."
            )
        }
    }
}

impl std::error::Error for PatchConflict {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Copy `files` from the upstream clone over the project's copies.
pub fn copy_verbatim(upstream_dir: &Path, project_dir: &Path, files: &[String]) -> Result<(), StepError> {
    for file in files {
        let from = upstream_dir.join(file);
        let to = project_dir.join(file);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StepError::io(parent, format!("creating {}", parent.display()), e))?;
        }
        fs::copy(&from, &to).map_err(|e| {
            StepError::io(&from, format!("copying {} to {}", from.display(), to.display()), e)
        })?;
        tracing::debug!(file = %file, "copied from upstream");
    }
    Ok(())
}

/// Write the upstream diff of `files` between two commits to `patch_file`.
///
/// Returns false when the diff is empty and there is nothing to apply.
pub fn write_shared_diff(
    runner: &dyn CommandRunner,
    upstream_dir: &Path,
    from: &str,
    to: &str,
    files: &[String],
    patch_file: &Path,
) -> Result<bool, StepError> {
    if files.is_empty() {
        return Ok(false);
    }
    let mut args = vec![
        "diff".to_string(),
        format!("--output={}", patch_file.display()),
        format!("{from}..{to}"),
        "--".to_string(),
    ];
    args.extend(files.iter().cloned());
    runner.run(&git(upstream_dir, args))?;

    let size = fs::metadata(patch_file)
        .map_err(|e| StepError::io(patch_file, format!("reading {}", patch_file.display()), e))?
        .len();
    Ok(size > 0)
}

/// Apply `patch_file` in `project_dir`.
///
/// A patch that doesn't apply cleanly is re-applied with `--reject`, so the
/// applicable hunks land and the rest is left in `.rej` files. The failure of
/// the first attempt is returned either way; a partial patch is never success.
pub fn apply_shared_patch(
    runner: &dyn CommandRunner,
    project_dir: &Path,
    patch_file: &Path,
) -> Result<(), CommandFailure> {
    let patch = patch_file.display().to_string();
    // `--3way` needs the blobs in this repository, which a foreign patch
    // never has.
    let apply = |extra: &[&str]| {
        let mut args = vec!["apply"];
        args.extend_from_slice(extra);
        args.extend(["--ignore-whitespace", "--ignore-space-change", patch.as_str()]);
        git(project_dir, args)
    };

    let failure = match runner.run(&apply(&[])) {
        Ok(_) => return Ok(()),
        Err(failure) => failure,
    };
    tracing::warn!(patch = %patch, "shared file patch does not apply, retrying with --reject");
    if let Err(e) = runner.run(&apply(&["--reject"])) {
        tracing::debug!(error = %e, "best-effort apply left rejects");
    }
    Err(failure)
}

/// `.rej` files under `project_dir`, relative to it and sorted.
pub fn find_rejects(project_dir: &Path) -> Vec<PathBuf> {
    let pattern = project_dir.join("**").join("*.rej");
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return Vec::new();
    };
    let mut rejects: Vec<PathBuf> = paths
        .filter_map(Result::ok)
        .map(|p| p.strip_prefix(project_dir).map(Path::to_path_buf).unwrap_or(p))
        .collect();
    rejects.sort();
    rejects
}
