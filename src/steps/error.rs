//! Failure classes a step may report.

use std::path::PathBuf;

use thiserror::Error;

use crate::integration::PatchConflict;
use crate::models::step::FailureDetail;
use crate::orchestrator::RemediationReport;
use crate::process::CommandFailure;

/// Typed failure returned by a step function.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Command(#[from] CommandFailure),

    #[error("file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("{0}")]
    Runtime(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Repository invariant unmet before any work starts. Never retried.
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    PatchConflict(Box<PatchConflict>),

    #[error(transparent)]
    Remediation(Box<RemediationReport>),
}

impl StepError {
    /// Wrap an I/O error, mapping `NotFound` to [`StepError::MissingFile`].
    pub fn io(path: impl Into<PathBuf>, context: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StepError::MissingFile { path: path.into() }
        } else {
            StepError::Io {
                context: context.into(),
                source,
            }
        }
    }

    /// The external command behind this failure, if any.
    pub fn command_failure(&self) -> Option<&CommandFailure> {
        match self {
            StepError::Command(failure) => Some(failure),
            StepError::PatchConflict(conflict) => Some(&conflict.source),
            _ => None,
        }
    }

    /// Diagnostic record for the step tracker.
    pub fn detail(&self, state: Vec<(String, String)>) -> FailureDetail {
        let command = self.command_failure();
        FailureDetail {
            command: command.map(|f| f.command.clone()),
            stdout: command.map(|f| f.stdout.clone()),
            stderr: command.map(|f| f.stderr.clone()),
            diagnostic: error_chain(self),
            state,
        }
    }
}

/// Render an error followed by its `source()` chain, one cause per line.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}
