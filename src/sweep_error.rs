//! SweepError: unified error type for sweep setup and execution.
//!
//! Everything that the scheduling core treats as a fatal configuration or
//! partition-metadata inconsistency surfaces here. Setup routines return these
//! before any sweep runs; the caller decides whether to abort the process.

use crate::grid::Vector3;
use thiserror::Error;

/// Unified error type for sweep-scheduling operations.
#[derive(Debug, Error)]
pub enum SweepError {
    /// The task dependency graph could not be ordered, even after cycle removal.
    #[error("Cyclic dependencies detected in the task dependency graph for direction {direction}")]
    CyclicDependencies { direction: Vector3 },
    /// The local cell graph contains a cycle and cycles are not allowed.
    #[error("Rank {rank}: cyclic local cell dependencies for direction {direction}")]
    LocalCyclicDependencies { rank: usize, direction: Vector3 },
    /// A reflecting boundary has no matching reflected direction in the quadrature.
    #[error(
        "Reflecting boundary {boundary_id}: reflected angle not found for angle {angle} \
         (omega = {omega}); the quadrature is not symmetric about the boundary normal"
    )]
    ReflectedAngleNotFound {
        boundary_id: u64,
        angle: usize,
        omega: Vector3,
    },
    /// Beta pass: the upwind cell is missing from the predecessor's cell views.
    #[error(
        "Rank {rank}: required predecessor cell {cell_global_id} not located in views from location {predecessor}"
    )]
    PredecessorCellNotFound {
        rank: usize,
        cell_global_id: u64,
        predecessor: usize,
    },
    /// No face of the neighbour matches the vertex set of the given face.
    #[error("Rank {rank}: associated face not found for cell {cell_global_id}, face {face}")]
    AssociatedFaceNotFound {
        rank: usize,
        cell_global_id: u64,
        face: usize,
    },
    /// A vertex of the face is missing from the associated face.
    #[error(
        "Rank {rank}: associated vertex {vertex} not found for cell {cell_global_id}, face {face}"
    )]
    AssociatedVertexNotFound {
        rank: usize,
        cell_global_id: u64,
        face: usize,
        vertex: u64,
    },
    /// A boundary face references a vertex with no coordinates.
    #[error("Rank {rank}: vertex {vertex} of cell {cell_global_id}, face {face} has no coordinates")]
    VertexNotFound {
        rank: usize,
        cell_global_id: u64,
        face: usize,
        vertex: u64,
    },
    /// Alpha pass: an incoming local face has no occupied lock-box slot.
    #[error("Rank {rank}: lock-box location not found for cell {cell_global_id}, face {face}")]
    LockBoxSlotNotFound {
        rank: usize,
        cell_global_id: u64,
        face: usize,
    },
    /// A face points to a location that is not in the dependency lists.
    #[error("Rank {rank}: location {location} is not a known predecessor or successor")]
    UnknownLocation { rank: usize, location: usize },
    /// A location depends on a partition that the communicator does not have.
    #[error(
        "Location {location} depends on partition {partition}, but only {num_locations} locations exist"
    )]
    InvalidPartition {
        location: usize,
        partition: usize,
        num_locations: usize,
    },
    /// A delayed angular DOF vector does not match the delayed storage size.
    #[error("Delayed angular DOF vector has {got} entries, expected {expected}")]
    DelayedDofCountMismatch { expected: usize, got: usize },
    /// A face references a boundary id that has no boundary condition.
    #[error("No sweep boundary registered for boundary id {0}")]
    BoundaryNotFound(u64),
    /// The requested angle aggregation cannot be applied to this grid.
    #[error("Unsupported angle aggregation: {0}")]
    UnsupportedAggregation(String),
    /// A sweep message tag does not fit the communicator's tag space.
    ///
    /// Tags are `u16`; `(angle_set + 1) * messages` must not exceed `capacity`
    /// (64768 sweep tags). Raising the eager limit lowers `messages`.
    #[error(
        "Angle set {angle_set} with {messages} messages overflows the {capacity} sweep tags; \
         raise the eager limit or use fewer angle sets"
    )]
    TagOverflow {
        angle_set: usize,
        messages: usize,
        capacity: usize,
    },
    /// Communication with a neighbour failed.
    #[error("Communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A received payload could not be decoded.
    #[error("Wire decode error: {0}")]
    WireDecode(String),
    /// Invalid configuration.
    #[error("Invalid sweep configuration: {0}")]
    Config(String),
}
