//! Sweep plane data structure (SPDS): the per-direction local cell ordering
//! and this location's place in the distributed task dependency graph.
//!
//! Construction has two halves:
//! 1. [`LocalSweepOrdering::compute`] is purely local: face orientations, the
//!    cell sweep order and the locations this rank receives from / sends to.
//! 2. [`build_task_dependency_graph`] is collective: dependencies are gathered
//!    on rank 0, cycles are broken there, and the removed edges plus the
//!    topological order are broadcast back.
//!
//! The result is immutable for the life of the solver.

use crate::algs::communicator::Communicator;
use crate::algs::wire::{decode_locations, encode_locations};
use crate::graph::DirectedGraph;
use crate::grid::{Grid, Vector3};
use crate::sweep_error::SweepError;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Faces with `|n·ω|` at or below this are parallel to the direction.
pub const FACE_ORIENTATION_TOLERANCE: f64 = 1.0e-16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaceOrientation {
    Parallel,
    Incoming,
    Outgoing,
}

impl FaceOrientation {
    pub fn of(normal: &Vector3, omega: &Vector3) -> Self {
        let mu = normal.dot(omega);
        if mu > FACE_ORIENTATION_TOLERANCE {
            FaceOrientation::Outgoing
        } else if mu < -FACE_ORIENTATION_TOLERANCE {
            FaceOrientation::Incoming
        } else {
            FaceOrientation::Parallel
        }
    }
}

/// Index of an upstream location in one of the two predecessor lists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Predecessor {
    Direct(usize),
    Delayed(usize),
}

/// Purely local half of the SPDS.
#[derive(Clone, Debug)]
pub struct LocalSweepOrdering {
    pub omega: Vector3,
    /// Local cell ids in sweep order.
    pub spls: Vec<usize>,
    /// Per local cell, per face.
    pub cell_face_orientations: Vec<Vec<FaceOrientation>>,
    /// `(cell, neighbor)` local ids of intra-rank edges removed to break cycles.
    pub local_cyclic_dependencies: Vec<(usize, usize)>,
    pub location_dependencies: Vec<usize>,
    pub location_successors: Vec<usize>,
}

impl LocalSweepOrdering {
    pub fn compute(grid: &Grid, omega: Vector3, allow_cycles: bool) -> Result<Self, SweepError> {
        let cells = grid.local_cells();
        let mut orientations = Vec::with_capacity(cells.len());
        let mut deps = BTreeSet::new();
        let mut succs = BTreeSet::new();
        let mut local_graph = DirectedGraph::with_vertices(cells.len());

        for cell in cells {
            let mut per_face = Vec::with_capacity(cell.faces.len());
            for face in &cell.faces {
                let orientation = FaceOrientation::of(&face.normal, &omega);
                per_face.push(orientation);
                let Some(nbr) = face.neighbor_id() else { continue };
                match (grid.local_id_of(nbr), orientation) {
                    (Some(nbr_local), FaceOrientation::Outgoing) => {
                        local_graph.add_edge(cell.local_id, nbr_local, face.normal.dot(&omega));
                    }
                    (None, FaceOrientation::Outgoing) => {
                        succs.extend(face.neighbor_partition());
                    }
                    (None, FaceOrientation::Incoming) => {
                        deps.extend(face.neighbor_partition());
                    }
                    _ => {}
                }
            }
            orientations.push(per_face);
        }

        let mut local_cyclic_dependencies = Vec::new();
        let mut spls = local_graph.topological_sort();
        if spls.len() != cells.len() {
            if !allow_cycles {
                log::error!(
                    "rank {}: cyclic local cell dependencies for direction {omega}",
                    grid.rank()
                );
                return Err(SweepError::LocalCyclicDependencies {
                    rank: grid.rank(),
                    direction: omega,
                });
            }
            local_cyclic_dependencies = local_graph.remove_cyclic_dependencies();
            spls = local_graph.topological_sort();
            if spls.len() != cells.len() {
                return Err(SweepError::LocalCyclicDependencies {
                    rank: grid.rank(),
                    direction: omega,
                });
            }
            log::debug!(
                "rank {}: {} local cyclic dependencies removed for direction {omega}",
                grid.rank(),
                local_cyclic_dependencies.len()
            );
        }

        Ok(Self {
            omega,
            spls,
            cell_face_orientations: orientations,
            local_cyclic_dependencies,
            location_dependencies: deps.into_iter().collect(),
            location_successors: succs.into_iter().collect(),
        })
    }
}

/// Global task dependency graph as known to every rank after the broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDependencyGraph {
    /// `global_dependencies[loc]`: locations `loc` receives from.
    pub global_dependencies: Vec<Vec<usize>>,
    pub topological_order: Vec<usize>,
    /// `(predecessor, successor)` edges removed to break cycles.
    pub removed_edges: Vec<(usize, usize)>,
}

impl TaskDependencyGraph {
    /// Stage level per location: 0 without (non-delayed) dependencies,
    /// otherwise one more than the deepest dependency.
    pub fn levels(&self) -> Vec<usize> {
        let removed: BTreeSet<(usize, usize)> = self.removed_edges.iter().copied().collect();
        let mut level = vec![0usize; self.global_dependencies.len()];
        for &loc in &self.topological_order {
            level[loc] = self.global_dependencies[loc]
                .iter()
                .filter(|&&dep| !removed.contains(&(dep, loc)))
                .map(|&dep| level[dep] + 1)
                .max()
                .unwrap_or(0);
        }
        level
    }

    /// Locations grouped by level: `planes[l]` can run concurrently.
    pub fn sweep_planes(&self) -> Vec<Vec<usize>> {
        let level = self.levels();
        let num_levels = level.iter().max().map_or(0, |&m| m + 1);
        let mut planes = vec![Vec::new(); num_levels];
        for &loc in &self.topological_order {
            planes[level[loc]].push(loc);
        }
        planes
    }
}

/// Collectively build the task dependency graph for one direction.
///
/// Every rank passes its own `location_dependencies`; every rank receives
/// the same graph, order and removed-edge list.
pub fn build_task_dependency_graph<C: Communicator>(
    location_dependencies: &[usize],
    allow_cycles: bool,
    omega: Vector3,
    comm: &C,
) -> Result<TaskDependencyGraph, SweepError> {
    // 1) gather everybody's dependencies on rank 0
    let gathered = comm.gather_bytes(0, encode_locations(location_dependencies));

    // 2) rank 0 orders the graph and flattens the answer
    let payload = match gathered {
        Some(all) => {
            let global_dependencies = all
                .iter()
                .map(|raw| decode_locations(raw))
                .collect::<Result<Vec<_>, _>>()?;
            encode_locations(&order_on_root(global_dependencies, allow_cycles, omega))
        }
        None => Vec::new(),
    };

    // 3) size then payload to all ranks
    let words = decode_locations(&comm.broadcast_bytes(0, payload))?;
    unflatten_tdg(&words, omega)
}

const TDG_CYCLIC: usize = 0;
const TDG_OK: usize = 1;
const TDG_BAD_LOCATION: usize = 2;

/// Rank-0 half: `[TDG_OK, n, {ndeps, deps..}.., nremoved, {pred, succ}.., order..]`,
/// `[TDG_CYCLIC]` or `[TDG_BAD_LOCATION, loc, dep, n]`.
fn order_on_root(global_dependencies: Vec<Vec<usize>>, allow_cycles: bool, omega: Vector3) -> Vec<usize> {
    let n = global_dependencies.len();
    let mut graph = DirectedGraph::with_vertices(n);
    for (loc, deps) in global_dependencies.iter().enumerate() {
        for &dep in deps {
            if dep >= n {
                return vec![TDG_BAD_LOCATION, loc, dep, n];
            }
            graph.add_edge(dep, loc, 1.0);
        }
    }
    let removed = if allow_cycles {
        graph.remove_cyclic_dependencies()
    } else {
        Vec::new()
    };
    if !removed.is_empty() {
        log::warn!(
            "direction {omega}: {} cyclic location dependencies delayed: {removed:?}",
            removed.len()
        );
    }
    let order = graph.topological_sort();

    if order.is_empty() && n > 0 {
        return vec![TDG_CYCLIC];
    }
    let mut words = vec![TDG_OK, n];
    for deps in &global_dependencies {
        words.push(deps.len());
        words.extend_from_slice(deps);
    }
    words.push(removed.len());
    for (p, s) in &removed {
        words.extend_from_slice(&[*p, *s]);
    }
    words.extend_from_slice(&order);
    words
}

fn unflatten_tdg(words: &[usize], omega: Vector3) -> Result<TaskDependencyGraph, SweepError> {
    let mut it = words.iter().copied();
    let mut next = || {
        it.next()
            .ok_or_else(|| SweepError::WireDecode("truncated task dependency graph".into()))
    };
    match next()? {
        TDG_OK => {}
        TDG_CYCLIC => {
            log::error!("cyclic dependencies detected for direction {omega}");
            return Err(SweepError::CyclicDependencies { direction: omega });
        }
        TDG_BAD_LOCATION => {
            let err = SweepError::InvalidPartition {
                location: next()?,
                partition: next()?,
                num_locations: next()?,
            };
            log::error!("{err}");
            return Err(err);
        }
        other => {
            return Err(SweepError::WireDecode(format!(
                "unknown task dependency graph status {other}"
            )));
        }
    }
    let n = next()?;
    let mut global_dependencies = Vec::with_capacity(n);
    for _ in 0..n {
        let nd = next()?;
        global_dependencies.push((0..nd).map(|_| next()).collect::<Result<Vec<_>, _>>()?);
    }
    let nr = next()?;
    let mut removed_edges = Vec::with_capacity(nr);
    for _ in 0..nr {
        removed_edges.push((next()?, next()?));
    }
    let topological_order = (0..n).map(|_| next()).collect::<Result<Vec<_>, _>>()?;
    Ok(TaskDependencyGraph {
        global_dependencies,
        topological_order,
        removed_edges,
    })
}

/// Sweep plane data structure for one direction on this rank.
#[derive(Clone, Debug)]
pub struct Spds {
    grid: Arc<Grid>,
    ordering: LocalSweepOrdering,
    location_dependencies: Vec<usize>,
    location_successors: Vec<usize>,
    delayed_location_dependencies: Vec<usize>,
    delayed_location_successors: Vec<usize>,
    global_sweep_planes: Vec<Vec<usize>>,
    level: usize,
}

impl Spds {
    /// Build the full SPDS (collective over `comm`).
    pub fn new<C: Communicator>(
        grid: Arc<Grid>,
        omega: Vector3,
        allow_cycles: bool,
        comm: &C,
    ) -> Result<Self, SweepError> {
        let ordering = LocalSweepOrdering::compute(&grid, omega, allow_cycles)?;
        Self::from_local_ordering(grid, ordering, allow_cycles, comm)
    }

    /// Collective half, given a precomputed local ordering.
    pub fn from_local_ordering<C: Communicator>(
        grid: Arc<Grid>,
        ordering: LocalSweepOrdering,
        allow_cycles: bool,
        comm: &C,
    ) -> Result<Self, SweepError> {
        let me = comm.rank();
        let tdg = build_task_dependency_graph(
            &ordering.location_dependencies,
            allow_cycles,
            ordering.omega,
            comm,
        )?;

        let mut location_dependencies = ordering.location_dependencies.clone();
        let mut location_successors = ordering.location_successors.clone();
        let mut delayed_location_dependencies = Vec::new();
        let mut delayed_location_successors = Vec::new();
        for &(pred, succ) in &tdg.removed_edges {
            if succ == me {
                location_dependencies.retain(|&l| l != pred);
                delayed_location_dependencies.push(pred);
            }
            if pred == me {
                location_successors.retain(|&l| l != succ);
                delayed_location_successors.push(succ);
            }
        }

        let levels = tdg.levels();
        let level = levels.get(me).copied().unwrap_or(0);
        let global_sweep_planes = tdg.sweep_planes();
        log::debug!(
            "rank {me}: SPDS for {} with {} deps ({} delayed), {} succs ({} delayed), level {level}/{}",
            ordering.omega,
            location_dependencies.len(),
            delayed_location_dependencies.len(),
            location_successors.len(),
            delayed_location_successors.len(),
            global_sweep_planes.len()
        );

        Ok(Self {
            grid,
            ordering,
            location_dependencies,
            location_successors,
            delayed_location_dependencies,
            delayed_location_successors,
            global_sweep_planes,
            level,
        })
    }

    pub fn omega(&self) -> Vector3 {
        self.ordering.omega
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    /// Local cell ids in sweep order.
    pub fn spls(&self) -> &[usize] {
        &self.ordering.spls
    }

    pub fn face_orientation(&self, cell_local_id: usize, face: usize) -> FaceOrientation {
        self.ordering.cell_face_orientations[cell_local_id][face]
    }

    pub fn local_cyclic_dependencies(&self) -> &[(usize, usize)] {
        &self.ordering.local_cyclic_dependencies
    }

    pub fn location_dependencies(&self) -> &[usize] {
        &self.location_dependencies
    }

    pub fn location_successors(&self) -> &[usize] {
        &self.location_successors
    }

    pub fn delayed_location_dependencies(&self) -> &[usize] {
        &self.delayed_location_dependencies
    }

    pub fn delayed_location_successors(&self) -> &[usize] {
        &self.delayed_location_successors
    }

    pub fn global_sweep_planes(&self) -> &[Vec<usize>] {
        &self.global_sweep_planes
    }

    /// Stage level of this location (0 = no upstream locations).
    pub fn level(&self) -> usize {
        self.level
    }

    /// Priority depth used by depth-of-graph scheduling.
    pub fn depth_of_graph(&self) -> usize {
        self.global_sweep_planes.len().saturating_sub(self.level)
    }

    pub fn map_loc_to_preloc(&self, loc: usize) -> Option<Predecessor> {
        if let Some(i) = self.location_dependencies.iter().position(|&l| l == loc) {
            return Some(Predecessor::Direct(i));
        }
        self.delayed_location_dependencies
            .iter()
            .position(|&l| l == loc)
            .map(Predecessor::Delayed)
    }

    /// Successor locations: direct ones first, then delayed ones.
    pub fn all_successors(&self) -> impl Iterator<Item = usize> + '_ {
        self.location_successors
            .iter()
            .chain(&self.delayed_location_successors)
            .copied()
    }

    /// Index of `loc` in [`Spds::all_successors`].
    pub fn map_loc_to_deploc(&self, loc: usize) -> Option<usize> {
        self.all_successors().position(|l| l == loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::grid::ortho;

    #[test]
    fn orientation_uses_tolerance() {
        let n = Vector3::new(1.0, 0.0, 0.0);
        assert_eq!(FaceOrientation::of(&n, &Vector3::new(0.5, 0.5, 0.0)), FaceOrientation::Outgoing);
        assert_eq!(FaceOrientation::of(&n, &Vector3::new(-0.5, 0.5, 0.0)), FaceOrientation::Incoming);
        assert_eq!(FaceOrientation::of(&n, &Vector3::new(0.0, 1.0, 0.0)), FaceOrientation::Parallel);
    }

    #[test]
    fn serial_slab_orders_cells_downstream() {
        let grid = Arc::new(ortho::slab(&[0.0, 1.0, 2.0, 3.0], &[0, 0, 0], 0));
        let right = Spds::new(grid.clone(), Vector3::new(1.0, 0.0, 0.0), true, &NoComm).unwrap();
        assert_eq!(right.spls(), &[0, 1, 2]);
        let left = Spds::new(grid, Vector3::new(-1.0, 0.0, 0.0), true, &NoComm).unwrap();
        assert_eq!(left.spls(), &[2, 1, 0]);
        assert_eq!(left.global_sweep_planes(), &[vec![0]]);
        assert!(left.location_dependencies().is_empty());
        assert_eq!(left.depth_of_graph(), 1);
    }

    #[test]
    fn levels_ignore_removed_edges() {
        let tdg = TaskDependencyGraph {
            global_dependencies: vec![vec![1], vec![0], vec![1]],
            topological_order: vec![0, 1, 2],
            removed_edges: vec![(1, 0)],
        };
        assert_eq!(tdg.levels(), vec![0, 1, 2]);
        assert_eq!(tdg.sweep_planes(), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn root_flattening_round_trips() {
        let omega = Vector3::new(1.0, 0.0, 0.0);
        let words = order_on_root(vec![vec![], vec![0], vec![1]], false, omega);
        let tdg = unflatten_tdg(&words, omega).unwrap();
        assert_eq!(tdg.topological_order, vec![0, 1, 2]);
        assert!(tdg.removed_edges.is_empty());

        let cyclic = order_on_root(vec![vec![1], vec![0]], false, omega);
        assert!(matches!(
            unflatten_tdg(&cyclic, omega),
            Err(SweepError::CyclicDependencies { .. })
        ));
    }

    #[test]
    fn out_of_range_partition_is_rejected() {
        let omega = Vector3::new(1.0, 0.0, 0.0);
        let err = build_task_dependency_graph(&[3], true, omega, &NoComm).unwrap_err();
        assert!(matches!(
            err,
            SweepError::InvalidPartition {
                location: 0,
                partition: 3,
                num_locations: 1
            }
        ));
    }
}
