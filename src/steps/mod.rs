//! Generic step execution: ordered steps, cascading cancellation and
//! bounded agent-assisted recovery.

pub mod agent;
pub mod error;
pub mod handler;

pub use agent::{AgentFailurePolicy, RecoveryConfig, DEFAULT_MAX_AGENT_ATTEMPTS};
pub use error::{error_chain, StepError};
pub use handler::{RunOutcome, Step, StepContext, StepControl, StepFn, StepHandler};
