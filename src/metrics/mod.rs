//! Metrics aggregation shared by all workers
//!
//! - `MetricsRegistry`: counters, gauges, rolling timers and error counts
//! - `MetricsReporter`: cancellable task persisting periodic snapshots
//! - `ResourceUsage`: CPU, memory, thread and file counts for this process

mod registry;
mod reporter;
mod resource;

pub use registry::{MetricsRegistry, MetricsSnapshot, TimerGuard, TimerStats};
pub use reporter::{read_snapshot, write_snapshot, MetricsReporter};
pub use resource::ResourceUsage;
