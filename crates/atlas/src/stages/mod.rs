//! The reconstruction stage topology and the adapters that run each stage.

pub mod command;
pub mod context;
pub mod error;
pub mod passthrough;
pub mod registry;

pub use command::CommandAdapter;
pub use context::{
    CancelReason, CancelToken, StageAdapter, StageContext, StageInputs, StageOutcome,
};
pub use error::{RegistryError, StageError};
pub use passthrough::PassthroughMaskAdapter;
pub use registry::{BypassRule, StageAdapters, StageDescriptor, StageRegistry};
