//! Agent-assisted recovery for failed steps.
//!
//! A configured agent command receives a markdown problem description on
//! stdin, is trusted to edit the working tree, and the failed step is then
//! retried. The number of agent invocations per pipeline is bounded.

use serde::{Deserialize, Serialize};

use crate::models::step::{format_step_result, StepResult};

/// Default bound on agent invocations per pipeline run.
pub const DEFAULT_MAX_AGENT_ATTEMPTS: u32 = 3;

/// What a failing agent invocation means for the retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AgentFailurePolicy {
    /// The failed invocation consumes one attempt; the agent is asked again
    /// while attempts remain.
    #[default]
    CountAttempt,
    /// The run ends dirty at the first failed agent invocation.
    Abort,
}

/// Recovery agent settings shared by every pipeline of one update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Shell command line; run through `sh -c` with the prompt on stdin.
    pub agent_command: String,
    pub max_attempts: u32,
    pub on_agent_failure: AgentFailurePolicy,
}

impl RecoveryConfig {
    pub fn new(agent_command: impl Into<String>) -> Self {
        Self {
            agent_command: agent_command.into(),
            max_attempts: DEFAULT_MAX_AGENT_ATTEMPTS,
            on_agent_failure: AgentFailurePolicy::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_failure_policy(mut self, policy: AgentFailurePolicy) -> Self {
        self.on_agent_failure = policy;
        self
    }
}

/// Build the problem description handed to the agent.
pub fn build_agent_prompt(
    step: &str,
    result: &StepResult,
    supplement: Option<&str>,
    instructions: &str,
) -> String {
    let mut content = String::new();

    content.push_str(&format!("# Failed Step: {step}\n\n"));

    content.push_str("## Step handler state and tracker\n\n");
    content.push_str(&format_step_result(result, true));
    content.push_str("\n\n");

    if let Some(diff) = supplement.map(str::trim).filter(|d| !d.is_empty()) {
        content.push_str("## Changes applied so far\n\n");
        content.push_str("```diff\n");
        content.push_str(diff);
        content.push_str("\n```\n\n");
    }

    content.push_str("## Agent Instructions\n\n");
    content.push_str(instructions.trim());
    content.push('\n');

    content
}
