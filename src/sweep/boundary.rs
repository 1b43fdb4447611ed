//! Sweep boundary conditions.
//!
//! A closed set of kinds, dispatched with `match`:
//! vacuum, incident isotropic, incident heterogeneous (evaluated once per
//! face node from a user function) and reflecting. Reflecting boundaries own
//! storage for the outgoing flux of every angle that leaves through them and
//! serve it back as incoming flux for the mirrored angle.

use crate::grid::{Grid, Vector3};
use crate::sweep_error::SweepError;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Normals are considered anti-parallel below `-OPPOSING_TOLERANCE`.
pub const OPPOSING_TOLERANCE: f64 = 1.0e-8;

/// Reflected directions must match to within this cosine.
pub const REFLECTION_MATCH_TOLERANCE: f64 = 1.0e-8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoundaryType {
    Vacuum,
    IncidentIsotropic,
    IncidentHeterogeneous,
    Reflecting,
}

/// A boundary face node at which incident flux is requested.
#[derive(Copy, Clone, Debug)]
pub struct IncidentPoint {
    pub boundary_id: u64,
    pub cell_global_id: u64,
    pub face: usize,
    pub node: usize,
    pub position: Vector3,
    pub angle: usize,
    pub omega: Vector3,
}

/// Incident angular flux as a function of position and direction.
pub trait BoundaryFunction {
    /// Flux for every group at `point`; must return `num_groups` values.
    fn evaluate(&self, point: &IncidentPoint, num_groups: usize) -> Vec<f64>;
}

impl<F> BoundaryFunction for F
where
    F: Fn(&IncidentPoint, usize) -> Vec<f64>,
{
    fn evaluate(&self, point: &IncidentPoint, num_groups: usize) -> Vec<f64> {
        self(point, num_groups)
    }
}

pub struct HeterogeneousBoundary {
    function: Box<dyn BoundaryFunction>,
    num_groups: usize,
    /// `(cell local id, face)` → per node, `[angle][group]` values.
    local_cell_data: HashMap<(usize, usize), Vec<Vec<f64>>>,
    zero: Vec<f64>,
}

impl fmt::Debug for HeterogeneousBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeterogeneousBoundary")
            .field("num_groups", &self.num_groups)
            .field("faces", &self.local_cell_data.len())
            .finish()
    }
}

impl HeterogeneousBoundary {
    pub fn new(function: Box<dyn BoundaryFunction>, num_groups: usize) -> Self {
        Self {
            function,
            num_groups,
            local_cell_data: HashMap::new(),
            zero: vec![0.0; num_groups],
        }
    }

    /// Evaluate the function at every node of every local face on
    /// `boundary_id`, for every angle.
    pub fn initialize(
        &mut self,
        boundary_id: u64,
        grid: &Grid,
        omegas: &[Vector3],
    ) -> Result<(), SweepError> {
        let g = self.num_groups;
        self.local_cell_data.clear();
        for cell in grid.local_cells() {
            for (f, face) in cell.faces.iter().enumerate() {
                if face.boundary_id() != Some(boundary_id) {
                    continue;
                }
                let mut per_node = Vec::with_capacity(face.num_vertices());
                for (node, &vid) in face.vertex_ids.iter().enumerate() {
                    let position = grid.vertex(vid).ok_or(SweepError::VertexNotFound {
                        rank: grid.rank(),
                        cell_global_id: cell.global_id,
                        face: f,
                        vertex: vid,
                    })?;
                    let mut values = Vec::with_capacity(omegas.len() * g);
                    for (angle, &omega) in omegas.iter().enumerate() {
                        let point = IncidentPoint {
                            boundary_id,
                            cell_global_id: cell.global_id,
                            face: f,
                            node,
                            position,
                            angle,
                            omega,
                        };
                        let v = self.function.evaluate(&point, g);
                        if v.len() != g {
                            return Err(SweepError::Config(format!(
                                "boundary {boundary_id}: function returned {} values for {g} groups",
                                v.len()
                            )));
                        }
                        values.extend(v);
                    }
                    per_node.push(values);
                }
                self.local_cell_data.insert((cell.local_id, f), per_node);
            }
        }
        Ok(())
    }

    fn incoming_psi(&self, cell: usize, face: usize, node: usize, angle: usize, groups: Range<usize>) -> &[f64] {
        let g = self.num_groups;
        match self
            .local_cell_data
            .get(&(cell, face))
            .and_then(|nodes| nodes.get(node))
        {
            Some(values) => &values[angle * g + groups.start..angle * g + groups.end],
            None => &self.zero[groups],
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReflectingBoundary {
    normal: Vector3,
    num_groups: usize,
    opposing_reflected: bool,
    reflected_anglenum: Vec<usize>,
    /// `(cell local id, face)` → first node index in the per-angle storage.
    face_offsets: HashMap<(usize, usize), usize>,
    /// Per angle; empty for angles that do not leave through this boundary.
    boundary_flux: Vec<Vec<f64>>,
    boundary_flux_old: Vec<Vec<f64>>,
    /// `[angle][group subset]`
    angle_readyflags: Vec<Vec<bool>>,
    last_change: f64,
    zero: Vec<f64>,
}

impl ReflectingBoundary {
    pub fn new(normal: Vector3, num_groups: usize) -> Self {
        Self {
            normal: normal.normalized(),
            num_groups,
            opposing_reflected: false,
            reflected_anglenum: Vec::new(),
            face_offsets: HashMap::new(),
            boundary_flux: Vec::new(),
            boundary_flux_old: Vec::new(),
            angle_readyflags: Vec::new(),
            last_change: 0.0,
            zero: vec![0.0; num_groups],
        }
    }

    pub fn normal(&self) -> Vector3 {
        self.normal
    }

    pub fn is_opposing_reflected(&self) -> bool {
        self.opposing_reflected
    }

    pub fn set_opposing_reflected(&mut self, value: bool) {
        self.opposing_reflected = value;
    }

    pub fn reflected_anglenum(&self) -> &[usize] {
        &self.reflected_anglenum
    }

    /// Match every angle with its mirror image and size the storage.
    pub fn initialize(
        &mut self,
        boundary_id: u64,
        grid: &Grid,
        omegas: &[Vector3],
        num_group_subsets: usize,
    ) -> Result<(), SweepError> {
        let n = self.normal;
        self.reflected_anglenum = omegas
            .iter()
            .enumerate()
            .map(|(angle, &omega)| {
                let reflected = omega - n * (2.0 * omega.dot(&n));
                omegas
                    .iter()
                    .position(|o| reflected.dot(o) > 1.0 - REFLECTION_MATCH_TOLERANCE)
                    .ok_or_else(|| {
                        log::error!(
                            "reflecting boundary {boundary_id}: no reflected angle for angle {angle}"
                        );
                        SweepError::ReflectedAngleNotFound {
                            boundary_id,
                            angle,
                            omega,
                        }
                    })
            })
            .collect::<Result<_, _>>()?;

        self.face_offsets.clear();
        let mut num_nodes = 0;
        for cell in grid.local_cells() {
            for (f, face) in cell.faces.iter().enumerate() {
                if face.boundary_id() == Some(boundary_id) {
                    self.face_offsets.insert((cell.local_id, f), num_nodes);
                    num_nodes += face.num_vertices();
                }
            }
        }

        let g = self.num_groups;
        self.boundary_flux = omegas
            .iter()
            .map(|o| {
                if o.dot(&n) >= 0.0 && num_nodes > 0 {
                    vec![0.0; num_nodes * g]
                } else {
                    Vec::new()
                }
            })
            .collect();
        self.boundary_flux_old = self.boundary_flux.clone();
        self.angle_readyflags = vec![vec![false; num_group_subsets]; omegas.len()];
        self.last_change = 0.0;
        log::debug!(
            "reflecting boundary {boundary_id}: {num_nodes} face nodes, reflections {:?}",
            self.reflected_anglenum
        );
        Ok(())
    }

    fn index(&self, cell: usize, face: usize, node: usize, groups: &Range<usize>) -> Option<Range<usize>> {
        let offset = *self.face_offsets.get(&(cell, face))?;
        let start = (offset + node) * self.num_groups + groups.start;
        Some(start..start + groups.len())
    }

    fn incoming_psi(&self, cell: usize, face: usize, node: usize, angle: usize, groups: Range<usize>) -> &[f64] {
        let Some(&src) = self.reflected_anglenum.get(angle) else {
            return &self.zero[groups];
        };
        let storage = if self.opposing_reflected {
            &self.boundary_flux_old[src]
        } else {
            &self.boundary_flux[src]
        };
        match self.index(cell, face, node, &groups) {
            Some(r) if !storage.is_empty() => &storage[r],
            _ => &self.zero[groups],
        }
    }

    fn outgoing_psi(
        &mut self,
        cell: usize,
        face: usize,
        node: usize,
        angle: usize,
        groups: Range<usize>,
    ) -> Option<&mut [f64]> {
        let r = self.index(cell, face, node, &groups)?;
        let storage = self.boundary_flux.get_mut(angle)?;
        if storage.is_empty() {
            return None;
        }
        Some(&mut storage[r])
    }

    fn check_angles_ready_status(&self, angles: &[usize], group_subset: usize) -> bool {
        if self.opposing_reflected {
            return true;
        }
        angles.iter().all(|&n| {
            let src = self.reflected_anglenum[n];
            self.boundary_flux[src].is_empty() || self.angle_readyflags[n][group_subset]
        })
    }

    fn update_angles_ready_status(&mut self, angles: &[usize], group_subset: usize) {
        for &n in angles {
            let r = self.reflected_anglenum[n];
            self.angle_readyflags[r][group_subset] = true;
        }
    }

    fn reset_angles_ready_status(&mut self) {
        self.angle_readyflags
            .iter_mut()
            .for_each(|flags| flags.iter_mut().for_each(|f| *f = false));
    }

    /// Zero the current outgoing flux.
    pub fn reset_flux(&mut self) {
        self.boundary_flux
            .iter_mut()
            .for_each(|v| v.iter_mut().for_each(|x| *x = 0.0));
    }

    pub fn zero_old_flux(&mut self) {
        self.boundary_flux_old
            .iter_mut()
            .for_each(|v| v.iter_mut().for_each(|x| *x = 0.0));
    }

    /// Record the relative change since the last lag, then copy new → old.
    pub fn lag_flux(&mut self) -> f64 {
        self.last_change = self
            .boundary_flux
            .iter()
            .zip(&self.boundary_flux_old)
            .map(|(new, old)| crate::sweep::fluds::relative_change(new, old))
            .fold(0.0, f64::max);
        self.copy_new_to_old();
        self.last_change
    }

    pub fn last_change(&self) -> f64 {
        self.last_change
    }

    pub fn copy_new_to_old(&mut self) {
        for (new, old) in self.boundary_flux.iter().zip(self.boundary_flux_old.iter_mut()) {
            old.copy_from_slice(new);
        }
    }

    pub fn copy_old_to_new(&mut self) {
        for (new, old) in self.boundary_flux.iter_mut().zip(&self.boundary_flux_old) {
            new.copy_from_slice(old);
        }
    }

    pub fn boundary_flux(&self) -> &[Vec<f64>] {
        &self.boundary_flux
    }

    pub fn boundary_flux_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.boundary_flux
    }

    pub fn boundary_flux_old(&self) -> &[Vec<f64>] {
        &self.boundary_flux_old
    }

    pub fn boundary_flux_old_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.boundary_flux_old
    }
}

#[derive(Debug)]
pub enum SweepBoundary {
    Vacuum { zero: Vec<f64> },
    /// Per-group incident flux, the same for every angle.
    IncidentIsotropic { values: Vec<f64> },
    IncidentHeterogeneous(HeterogeneousBoundary),
    Reflecting(ReflectingBoundary),
}

/// Boundary conditions keyed by boundary id.
pub type BoundaryMap = BTreeMap<u64, SweepBoundary>;

impl SweepBoundary {
    pub fn vacuum(num_groups: usize) -> Self {
        SweepBoundary::Vacuum {
            zero: vec![0.0; num_groups],
        }
    }

    pub fn isotropic(values: Vec<f64>) -> Self {
        SweepBoundary::IncidentIsotropic { values }
    }

    pub fn heterogeneous(function: Box<dyn BoundaryFunction>, num_groups: usize) -> Self {
        SweepBoundary::IncidentHeterogeneous(HeterogeneousBoundary::new(function, num_groups))
    }

    pub fn reflecting(normal: Vector3, num_groups: usize) -> Self {
        SweepBoundary::Reflecting(ReflectingBoundary::new(normal, num_groups))
    }

    pub fn boundary_type(&self) -> BoundaryType {
        match self {
            SweepBoundary::Vacuum { .. } => BoundaryType::Vacuum,
            SweepBoundary::IncidentIsotropic { .. } => BoundaryType::IncidentIsotropic,
            SweepBoundary::IncidentHeterogeneous(_) => BoundaryType::IncidentHeterogeneous,
            SweepBoundary::Reflecting(_) => BoundaryType::Reflecting,
        }
    }

    pub fn is_reflecting(&self) -> bool {
        matches!(self, SweepBoundary::Reflecting(_))
    }

    pub fn as_reflecting(&self) -> Option<&ReflectingBoundary> {
        match self {
            SweepBoundary::Reflecting(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_reflecting_mut(&mut self) -> Option<&mut ReflectingBoundary> {
        match self {
            SweepBoundary::Reflecting(r) => Some(r),
            _ => None,
        }
    }

    /// Incident flux for groups `groups` at a face node.
    pub fn incoming_psi(
        &self,
        cell_local_id: usize,
        face: usize,
        node: usize,
        angle: usize,
        groups: Range<usize>,
    ) -> &[f64] {
        match self {
            SweepBoundary::Vacuum { zero } => &zero[groups],
            SweepBoundary::IncidentIsotropic { values } => &values[groups],
            SweepBoundary::IncidentHeterogeneous(h) => {
                h.incoming_psi(cell_local_id, face, node, angle, groups)
            }
            SweepBoundary::Reflecting(r) => r.incoming_psi(cell_local_id, face, node, angle, groups),
        }
    }

    /// Storage for flux leaving through a face node; only reflecting
    /// boundaries keep it.
    pub fn outgoing_psi(
        &mut self,
        cell_local_id: usize,
        face: usize,
        node: usize,
        angle: usize,
        groups: Range<usize>,
    ) -> Option<&mut [f64]> {
        match self {
            SweepBoundary::Reflecting(r) => r.outgoing_psi(cell_local_id, face, node, angle, groups),
            _ => None,
        }
    }

    /// True when every source angle of `angles` has been written for this
    /// group subset.
    pub fn check_angles_ready_status(&self, angles: &[usize], group_subset: usize) -> bool {
        match self {
            SweepBoundary::Reflecting(r) => r.check_angles_ready_status(angles, group_subset),
            _ => true,
        }
    }

    pub fn update_angles_ready_status(&mut self, angles: &[usize], group_subset: usize) {
        if let SweepBoundary::Reflecting(r) = self {
            r.update_angles_ready_status(angles, group_subset);
        }
    }

    pub fn reset_angles_ready_status(&mut self) {
        if let SweepBoundary::Reflecting(r) = self {
            r.reset_angles_ready_status();
        }
    }
}
