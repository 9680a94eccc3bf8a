mod job;
mod state;

pub use job::{
    FailureKind, Job, JobOutcome, JobReport, JobStatus, Params, Progress, RetryPolicy, StepError,
    StepOutcome, StepRun, StepStatus, StepSummary,
};
pub use state::{StateMachine, Transition};
