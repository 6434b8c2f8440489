use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Outcome of one step in a pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    NotPlanned,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "Pending"),
            StepStatus::Success => write!(f, "Success"),
            StepStatus::Failed => write!(f, "Failed"),
            StepStatus::Cancelled => write!(f, "Cancelled"),
            StepStatus::NotPlanned => write!(f, "NotPlanned"),
        }
    }
}

impl StepStatus {
    /// Check if transitioning from the current status to the new status is valid.
    ///
    /// Valid transitions:
    /// - `Pending` -> `Success` | `Failed` | `Cancelled` | `NotPlanned`
    /// - `Failed` -> `Pending` (resume after agent-assisted recovery)
    /// - `Cancelled` -> `Pending` (resume after agent-assisted recovery)
    ///
    /// Terminal states (no outgoing transitions):
    /// - `Success`
    /// - `NotPlanned`
    pub fn can_transition_to(&self, new_status: &StepStatus) -> bool {
        if self == new_status {
            return true;
        }

        match self {
            StepStatus::Pending => matches!(
                new_status,
                StepStatus::Success
                    | StepStatus::Failed
                    | StepStatus::Cancelled
                    | StepStatus::NotPlanned
            ),
            StepStatus::Failed | StepStatus::Cancelled => {
                matches!(new_status, StepStatus::Pending)
            }
            StepStatus::Success | StepStatus::NotPlanned => false,
        }
    }

    /// Attempt to transition to a new status, returning an error if invalid.
    pub fn try_transition(&self, new_status: StepStatus) -> Result<StepStatus> {
        if self.can_transition_to(&new_status) {
            Ok(new_status)
        } else {
            bail!("Invalid step status transition: {self} -> {new_status}")
        }
    }

    /// Returns the list of valid statuses this status can transition to.
    pub fn valid_transitions(&self) -> Vec<StepStatus> {
        match self {
            StepStatus::Pending => vec![
                StepStatus::Success,
                StepStatus::Failed,
                StepStatus::Cancelled,
                StepStatus::NotPlanned,
            ],
            StepStatus::Failed | StepStatus::Cancelled => vec![StepStatus::Pending],
            StepStatus::Success | StepStatus::NotPlanned => vec![],
        }
    }

    /// Returns true if nothing can move this status any further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::NotPlanned)
    }

    /// Statuses that count towards a clean run.
    pub fn is_clean(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::NotPlanned)
    }
}

/// Diagnostics captured when a step fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    /// Command line of the failing external command, if one failed.
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// The error message and its source chain.
    pub diagnostic: String,
    /// Snapshot of the owning pipeline's context at failure time.
    pub state: Vec<(String, String)>,
}

/// Status and context of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    pub status: StepStatus,
    pub failure: Option<FailureDetail>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            failure: None,
        }
    }

    /// Move to `new_status` if the transition table allows it.
    ///
    /// Leaving `Failed` clears the recorded failure.
    pub fn transition(&mut self, new_status: StepStatus) -> Result<()> {
        self.status = self.status.try_transition(new_status)?;
        if new_status != StepStatus::Failed {
            self.failure = None;
        }
        Ok(())
    }

    pub fn fail(&mut self, detail: FailureDetail) -> Result<()> {
        self.transition(StepStatus::Failed)?;
        self.failure = Some(detail);
        Ok(())
    }
}

impl Default for StepResult {
    fn default() -> Self {
        Self::pending()
    }
}

/// True when every step ended `Success` or `NotPlanned`.
pub fn is_clean_results<'a, I>(results: I) -> bool
where
    I: IntoIterator<Item = &'a StepResult>,
{
    results.into_iter().all(|r| r.status.is_clean())
}

fn push_block(output: &mut Vec<String>, title: &str, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    output.push(format!("  {title}:"));
    for line in text.lines() {
        output.push(format!("    {line}"));
    }
}

/// Render one step result for logs, prompts and remediation messages.
pub fn format_step_result(result: &StepResult, include_state: bool) -> String {
    let mut output = vec![format!("  Status: {}", result.status)];
    if let Some(detail) = &result.failure {
        if include_state && !detail.state.is_empty() {
            output.push("  State:".to_string());
            for (key, value) in &detail.state {
                output.push(format!("    {key}: {value}"));
            }
        }
        if let Some(cmd) = &detail.command {
            output.push(format!("  Command: `{cmd}`"));
        }
        if let Some(stdout) = &detail.stdout {
            push_block(&mut output, "Stdout", stdout);
        }
        if let Some(stderr) = &detail.stderr {
            push_block(&mut output, "Stderr", stderr);
        }
        push_block(&mut output, "Diagnostic", &detail.diagnostic);
    }
    output.join("\n")
}

/// Render every step of a pipeline, in order.
pub fn format_step_results<'a, S, I>(results: I) -> String
where
    S: std::fmt::Display + 'a,
    I: IntoIterator<Item = (S, &'a StepResult)>,
{
    let mut output = Vec::new();
    for (step, result) in results {
        output.push(format!("Step: {step}"));
        output.push(format_step_result(result, false));
        output.push("-".repeat(20));
    }
    output.join("\n")
}
