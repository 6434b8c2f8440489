pub mod step;

pub use step::{FailureDetail, StepResult, StepStatus};
