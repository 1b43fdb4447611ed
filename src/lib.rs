#![cfg_attr(docsrs, feature(doc_cfg))]
//! # sn-sweep
//!
//! sn-sweep schedules parallel transport sweeps for discrete-ordinates (Sn)
//! solvers. Given a partitioned grid and an angular quadrature it builds, for
//! every sweep direction, the cell ordering and the inter-rank task
//! dependency graph; lays out the upwind angular-flux storage; and runs the
//! angle sets to completion while exchanging flux with neighbouring ranks.
//! The per-cell solve is supplied by the caller through [`SweepChunk`].
//!
//! ## Features
//! - Sweep plane data structures (SPDS) with cycle detection and removal
//! - Flux data structures (FLUDS) with reusable lock-box storage
//! - Single-angle and polar angle aggregation, group subsets
//! - FIFO and depth-of-graph scheduling
//! - Vacuum, isotropic, heterogeneous and reflecting boundaries
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ```toml
//! [dependencies]
//! sn-sweep = "0.1"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ## Determinism
//!
//! Angle-set ids, the task dependency graph and the depth-of-graph priority
//! order are identical on every rank. Floating-point results do not depend
//! on the scheduling policy.
//!
//! [`SweepChunk`]: crate::sweep::chunk::SweepChunk

pub mod algs;
pub mod config;
pub mod graph;
pub mod grid;
pub mod quadrature;
pub mod sweep;
pub mod sweep_error;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::config::{AngleAggregationType, SchedulingAlgorithm, SweepConfig};
    pub use crate::grid::{Cell, CellFace, FaceNeighbor, Grid, Vector3};
    pub use crate::quadrature::AngularQuadrature;
    pub use crate::sweep::angle_aggregation::AngleAggregation;
    pub use crate::sweep::boundary::{BoundaryFunction, BoundaryMap, IncidentPoint, SweepBoundary};
    pub use crate::sweep::chunk::{AngleSetInfo, SweepChunk, SweepContext};
    pub use crate::sweep::scheduler::SweepScheduler;
    pub use crate::sweep::spds::FaceOrientation;
    pub use crate::sweep::timing::{LogEvents, NoEvents, SweepEvents};
    pub use crate::sweep_error::SweepError;
}
