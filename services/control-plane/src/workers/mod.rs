//! Background workers.
//!
//! Each worker runs a single pass on a fixed interval until the shutdown
//! channel flips to `true`. The single pass is callable directly.

mod autoscale;
mod cleanup;
mod dispatch;
mod escalation;
mod event_log;

pub use autoscale::AutoscaleWorker;
pub use cleanup::{CleanupStats, CleanupWorker, CleanupWorkerConfig};
pub use dispatch::DispatchWorker;
pub use escalation::EscalationWorker;
pub use event_log::EventLogger;
