//! Read-only view of one rank's mesh partition.
//!
//! The sweep core only needs cell/face adjacency: for every local cell its
//! faces, each with an outward normal, a vertex-id list and a neighbour that is
//! either another cell (local or owned by another rank) or a domain boundary.
//! Mesh readers and partitioners live outside this crate; [`ortho`] provides
//! small structured builders for tests and demonstrations.

pub mod ortho;
pub mod vector;

pub use vector::Vector3;

use hashbrown::HashMap;
use itertools::Itertools;
use std::collections::BTreeSet;

/// What lies on the other side of a face.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaceNeighbor {
    /// Domain boundary with the given boundary id.
    Boundary(u64),
    /// Neighbouring cell, identified by global id and owning partition.
    Cell { global_id: u64, partition: usize },
}

#[derive(Clone, Debug)]
pub struct CellFace {
    pub vertex_ids: Vec<u64>,
    pub normal: Vector3,
    pub centroid: Vector3,
    pub neighbor: FaceNeighbor,
}

impl CellFace {
    pub fn has_neighbor(&self) -> bool {
        matches!(self.neighbor, FaceNeighbor::Cell { .. })
    }

    pub fn boundary_id(&self) -> Option<u64> {
        match self.neighbor {
            FaceNeighbor::Boundary(id) => Some(id),
            FaceNeighbor::Cell { .. } => None,
        }
    }

    /// Global id of the neighbouring cell, if any.
    pub fn neighbor_id(&self) -> Option<u64> {
        match self.neighbor {
            FaceNeighbor::Cell { global_id, .. } => Some(global_id),
            FaceNeighbor::Boundary(_) => None,
        }
    }

    pub fn neighbor_partition(&self) -> Option<usize> {
        match self.neighbor {
            FaceNeighbor::Cell { partition, .. } => Some(partition),
            FaceNeighbor::Boundary(_) => None,
        }
    }

    pub fn num_vertices(&self) -> usize {
        self.vertex_ids.len()
    }

    /// True when both faces reference the same set of vertices.
    pub fn same_vertex_set(&self, other: &[u64]) -> bool {
        same_vertex_set(&self.vertex_ids, other)
    }
}

/// Order-insensitive comparison of two vertex-id lists.
pub fn same_vertex_set(a: &[u64], b: &[u64]) -> bool {
    a.len() == b.len() && a.iter().sorted().eq(b.iter().sorted())
}

#[derive(Clone, Debug)]
pub struct Cell {
    pub global_id: u64,
    pub local_id: usize,
    pub partition: usize,
    pub centroid: Vector3,
    pub faces: Vec<CellFace>,
}

/// One rank's partition of the mesh.
#[derive(Clone, Debug)]
pub struct Grid {
    rank: usize,
    dimension: usize,
    cells: Vec<Cell>,
    global_to_local: HashMap<u64, usize>,
    vertices: HashMap<u64, Vector3>,
}

impl Grid {
    /// Build a partition view. `cells` must be the cells owned by `rank`;
    /// their `local_id` fields are overwritten with their position.
    pub fn new(
        rank: usize,
        dimension: usize,
        mut cells: Vec<Cell>,
        vertices: HashMap<u64, Vector3>,
    ) -> Self {
        let mut global_to_local = HashMap::with_capacity(cells.len());
        for (i, c) in cells.iter_mut().enumerate() {
            c.local_id = i;
            global_to_local.insert(c.global_id, i);
        }
        Self {
            rank,
            dimension,
            cells,
            global_to_local,
            vertices,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn local_cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn num_local_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn is_cell_local(&self, global_id: u64) -> bool {
        self.global_to_local.contains_key(&global_id)
    }

    pub fn local_id_of(&self, global_id: u64) -> Option<usize> {
        self.global_to_local.get(&global_id).copied()
    }

    pub fn local_cell_by_global_id(&self, global_id: u64) -> Option<&Cell> {
        self.local_id_of(global_id).map(|i| &self.cells[i])
    }

    pub fn vertex(&self, id: u64) -> Option<Vector3> {
        self.vertices.get(&id).copied()
    }

    /// True when the face has a neighbour cell owned by this rank.
    pub fn is_face_local(&self, face: &CellFace) -> bool {
        face.neighbor_id().is_some_and(|g| self.is_cell_local(g))
    }

    /// Index of the neighbour's face that shares `cell.faces[face]`.
    ///
    /// Only defined when the neighbour is local; matching is by vertex-id set.
    pub fn associated_face(&self, cell: &Cell, face: usize) -> Option<usize> {
        let f = cell.faces.get(face)?;
        let nbr = self.local_cell_by_global_id(f.neighbor_id()?)?;
        nbr.faces.iter().position(|nf| {
            nf.neighbor_id() == Some(cell.global_id) && nf.same_vertex_set(&f.vertex_ids)
        })
    }

    /// Sorted set of boundary ids touched by local faces.
    pub fn boundary_ids(&self) -> BTreeSet<u64> {
        self.cells
            .iter()
            .flat_map(|c| c.faces.iter().filter_map(CellFace::boundary_id))
            .collect()
    }

    /// Distinct face sizes (vertex counts) in ascending order, with counts.
    pub fn face_size_histogram(&self) -> Vec<(usize, usize)> {
        let counts = self
            .cells
            .iter()
            .flat_map(|c| c.faces.iter().map(CellFace::num_vertices))
            .counts();
        counts.into_iter().sorted().collect()
    }
}
