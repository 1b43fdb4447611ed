//! The sweep engine: per-direction graphs, flux storage, angle sets and the
//! scheduler that drives them.

pub mod angle_aggregation;
pub mod angle_set;
pub mod boundary;
pub mod chunk;
pub mod fluds;
pub mod scheduler;
pub mod spds;
pub mod sweep_buffer;
pub mod timing;

pub use angle_aggregation::AngleAggregation;
pub use angle_set::{AngleSet, AngleSetGroup, AngleSetStatus, ExecutionPermission};
pub use boundary::{BoundaryMap, SweepBoundary};
pub use chunk::{AngleSetInfo, SweepChunk, SweepContext};
pub use scheduler::SweepScheduler;
pub use spds::Spds;
