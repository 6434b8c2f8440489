//! Generic ordered step runner with cascading cancellation and bounded
//! agent-assisted recovery.

use std::fmt;
use std::path::Path;

use crate::models::step::{
    format_step_result, format_step_results, is_clean_results, StepResult, StepStatus,
};
use crate::process::{CommandRunner, CommandSpec};

use super::agent::{build_agent_prompt, AgentFailurePolicy, RecoveryConfig};
use super::error::StepError;

/// Logic of one step: performs its side effects against the context.
pub type StepFn<S, C> = fn(&mut C, &mut StepControl<S>) -> Result<(), StepError>;

/// A named step in a fixed sequence.
pub struct Step<S, C> {
    pub id: S,
    pub run: StepFn<S, C>,
}

impl<S, C> Step<S, C> {
    pub fn new(id: S, run: StepFn<S, C>) -> Self {
        Self { id, run }
    }
}

/// Requests a running step can make of the handler.
///
/// Requests are applied only when the step succeeds.
#[derive(Debug)]
pub struct StepControl<S> {
    skipped: Vec<S>,
}

impl<S> Default for StepControl<S> {
    fn default() -> Self {
        Self {
            skipped: Vec::new(),
        }
    }
}

impl<S: Copy + PartialEq> StepControl<S> {
    /// Mark a later step `NotPlanned` once this step succeeds.
    pub fn skip(&mut self, step: S) {
        if !self.skipped.contains(&step) {
            self.skipped.push(step);
        }
    }
}

/// What the handler needs from a pipeline's context.
pub trait StepContext {
    fn runner(&self) -> &dyn CommandRunner;

    /// Non-internal context recorded with a failure and shown to the agent.
    fn snapshot(&self) -> Vec<(String, String)>;

    /// Working directory for the recovery agent.
    fn agent_dir(&self) -> Option<&Path> {
        None
    }

    /// Pipeline-specific supplement for the agent, e.g. a diff of changes
    /// already applied.
    fn agent_supplement(&self) -> Option<String> {
        None
    }

    fn agent_instructions(&self) -> String {
        "Fix the files in the working tree so that the failing step passes.".to_string()
    }
}

/// Aggregate result of one run.
#[derive(Debug)]
pub enum RunOutcome<S> {
    /// Every step ended `Success` or `NotPlanned`.
    Clean,
    /// A step failed and recovery was unavailable or exhausted.
    Dirty { step: S, error: StepError },
}

impl<S> RunOutcome<S> {
    pub fn is_clean(&self) -> bool {
        matches!(self, RunOutcome::Clean)
    }
}

/// Runs a fixed sequence of steps against a mutable context.
pub struct StepHandler<S, C> {
    steps: Vec<Step<S, C>>,
    tracker: Vec<StepResult>,
    recovery: Option<RecoveryConfig>,
    agent_attempts: u32,
}

impl<S, C> StepHandler<S, C>
where
    S: Copy + Eq + fmt::Display,
    C: StepContext,
{
    pub fn new(steps: Vec<Step<S, C>>, recovery: Option<RecoveryConfig>) -> Self {
        let tracker = steps.iter().map(|_| StepResult::pending()).collect();
        Self {
            steps,
            tracker,
            recovery,
            agent_attempts: 0,
        }
    }

    fn index_of(&self, step: S) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step)
    }

    /// Mark a still-`Pending` step `NotPlanned`. Returns whether it changed.
    pub fn mark_not_planned(&mut self, step: S) -> bool {
        match self.index_of(step) {
            Some(index) if self.tracker[index].status == StepStatus::Pending => {
                self.set_status(index, StepStatus::NotPlanned);
                true
            }
            _ => false,
        }
    }

    pub fn status_of(&self, step: S) -> Option<StepStatus> {
        self.index_of(step).map(|i| self.tracker[i].status)
    }

    pub fn result_of(&self, step: S) -> Option<&StepResult> {
        self.index_of(step).map(|i| &self.tracker[i])
    }

    pub fn results(&self) -> impl Iterator<Item = (S, &StepResult)> {
        self.steps.iter().map(|s| s.id).zip(self.tracker.iter())
    }

    pub fn into_results(self) -> Vec<(S, StepResult)> {
        self.steps.into_iter().map(|s| s.id).zip(self.tracker).collect()
    }

    /// Agent invocations made so far in this handler's lifetime.
    pub fn agent_attempts(&self) -> u32 {
        self.agent_attempts
    }

    pub fn is_clean(&self) -> bool {
        is_clean_results(&self.tracker)
    }

    pub fn format_results(&self) -> String {
        format_step_results(self.results())
    }

    /// Execute every `Pending` step in order.
    ///
    /// Steps resolved before a resume are never executed again.
    pub fn run(&mut self, ctx: &mut C) -> RunOutcome<S> {
        let mut index = 0;
        while index < self.steps.len() {
            if self.tracker[index].status != StepStatus::Pending {
                index += 1;
                continue;
            }

            let step = self.steps[index].id;
            let run = self.steps[index].run;
            tracing::info!(step = %step, "running step");

            let mut control = StepControl::default();
            match run(ctx, &mut control) {
                Ok(()) => {
                    self.set_status(index, StepStatus::Success);
                    for skipped in control.skipped {
                        if self.mark_not_planned(skipped) {
                            tracing::info!(step = %skipped, "step not planned");
                        }
                    }
                    index += 1;
                }
                Err(error) => {
                    self.record_failure(index, &error, ctx);
                    if self.recover(index, ctx) {
                        self.resume_from(index);
                        continue;
                    }
                    return RunOutcome::Dirty { step, error };
                }
            }
        }
        RunOutcome::Clean
    }

    fn set_status(&mut self, index: usize, status: StepStatus) {
        if let Err(e) = self.tracker[index].transition(status) {
            tracing::error!(step = %self.steps[index].id, error = %e, "rejected step transition");
        }
    }

    fn record_failure(&mut self, index: usize, error: &StepError, ctx: &C) {
        let detail = error.detail(ctx.snapshot());
        if let Err(e) = self.tracker[index].fail(detail) {
            tracing::error!(step = %self.steps[index].id, error = %e, "rejected step transition");
        }
        tracing::error!(
            step = %self.steps[index].id,
            "step failed\n{}",
            format_step_result(&self.tracker[index], true)
        );

        for i in 0..self.tracker.len() {
            if self.tracker[i].status == StepStatus::Pending {
                self.set_status(i, StepStatus::Cancelled);
            }
        }
    }

    /// Invoke the recovery agent while attempts remain. Returns true when the
    /// agent finished and the failed step should be retried.
    fn recover(&mut self, index: usize, ctx: &C) -> bool {
        let Some(recovery) = self.recovery.clone() else {
            return false;
        };
        let step = self.steps[index].id;

        while self.agent_attempts < recovery.max_attempts {
            self.agent_attempts += 1;
            let attempt = self.agent_attempts;

            let prompt = build_agent_prompt(
                &step.to_string(),
                &self.tracker[index],
                ctx.agent_supplement().as_deref(),
                &ctx.agent_instructions(),
            );
            tracing::info!(
                step = %step,
                attempt,
                max = recovery.max_attempts,
                "step failed, invoking recovery agent"
            );
            tracing::debug!("agent prompt:\n\n{prompt}");

            let mut spec = CommandSpec::shell(recovery.agent_command.as_str()).stdin(prompt);
            if let Some(dir) = ctx.agent_dir() {
                spec = spec.current_dir(dir);
            }

            match ctx.runner().run(&spec) {
                Ok(_) => {
                    tracing::info!(step = %step, attempt, "agent fix finished, resuming");
                    return true;
                }
                Err(failure) => {
                    tracing::warn!(step = %step, attempt, error = %failure, "recovery agent failed");
                    if let Some(detail) = self.tracker[index].failure.as_mut() {
                        detail
                            .diagnostic
                            .push_str(&format!("\nrecovery agent attempt {attempt}: {failure}"));
                    }
                    if recovery.on_agent_failure == AgentFailurePolicy::Abort {
                        return false;
                    }
                }
            }
        }

        tracing::warn!(
            step = %step,
            max = recovery.max_attempts,
            "recovery agent attempts exhausted"
        );
        false
    }

    /// Re-enable the failed step and everything cancelled after it.
    fn resume_from(&mut self, index: usize) {
        for i in index..self.tracker.len() {
            if matches!(
                self.tracker[i].status,
                StepStatus::Failed | StepStatus::Cancelled
            ) {
                self.set_status(i, StepStatus::Pending);
            }
        }
    }
}
