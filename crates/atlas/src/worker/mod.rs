pub mod limits;
pub mod pool;

pub use limits::{run_with_limits, LimitedRun, TimeLimits};
pub use pool::{
    AttemptReport, PoolControl, ReportOutcome, WorkerContext, WorkerPool, ATTEMPTS_EXHAUSTED,
};
