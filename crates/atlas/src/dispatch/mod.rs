//! Hand-off from the submission path to background workers: a durable
//! file-backed queue with per-job leases.

pub mod envelope;
pub mod lease;
pub mod queue;

pub use envelope::{DispatchHandle, Envelope};
pub use lease::{JobLease, LeaseManager, LeaseRecord};
pub use queue::{Delivery, Dispatcher, FileQueue, ReapReport};
