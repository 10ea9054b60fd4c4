pub mod context;
pub mod error;
pub mod executor;
pub mod progress;

pub use context::Attempt;
pub use error::{AttemptOutcome, ExecutorError};
pub use executor::PipelineExecutor;
pub use progress::ProgressWriter;
