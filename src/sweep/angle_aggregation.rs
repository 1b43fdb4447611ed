//! Angle aggregation: who sweeps which angles, with which SPDS.
//!
//! Owns every angle set (grouped by octant), the boundary conditions and the
//! quadrature, and carries the lifecycle hooks an outer iteration calls
//! between sweeps: reflecting-boundary initialisation and reset, the delayed
//! angular flux vector and its convergence norm.

use crate::algs::communicator::Communicator;
use crate::config::{AngleAggregationType, SweepConfig};
use crate::grid::{Grid, Vector3};
use crate::quadrature::{octant_key, AngularQuadrature};
use crate::sweep::angle_set::{AngleSet, AngleSetGroup};
use crate::sweep::boundary::{BoundaryMap, SweepBoundary, OPPOSING_TOLERANCE};
use crate::sweep::chunk::AngleSetInfo;
use crate::sweep::fluds::{Fluds, FludsCommonData};
use crate::sweep::spds::{LocalSweepOrdering, Spds};
use crate::sweep_error::SweepError;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Face normals with a larger z-component rule out polar aggregation.
const POLAR_NORMAL_TOLERANCE: f64 = 1.0e-12;

/// Projections closer than this (in cosine) share an SPDS.
const PROJECTION_MATCH_TOLERANCE: f64 = 1.0e-8;

/// Angles swept together, and the index of the SPDS they use.
#[derive(Clone, Debug)]
struct DirectionSet {
    spds: usize,
    angles: Vec<usize>,
    key: [u8; 3],
}

/// Contiguous group ranges; the first `G % S` subsets get one extra group.
pub fn group_subsets(num_groups: usize, num_subsets: usize) -> Vec<Range<usize>> {
    let base = num_groups / num_subsets;
    let extra = num_groups % num_subsets;
    let mut start = 0;
    (0..num_subsets)
        .map(|s| {
            let len = base + usize::from(s < extra);
            let r = start..start + len;
            start += len;
            r
        })
        .collect()
}

fn single_directions(quadrature: &AngularQuadrature, dimension: usize) -> (Vec<Vector3>, Vec<DirectionSet>) {
    let sets = quadrature
        .omegas
        .iter()
        .enumerate()
        .map(|(n, omega)| DirectionSet {
            spds: n,
            angles: vec![n],
            key: octant_key(omega, dimension),
        })
        .collect();
    (quadrature.omegas.clone(), sets)
}

fn polar_directions<C: Communicator>(
    grid: &Grid,
    quadrature: &AngularQuadrature,
    comm: &C,
) -> Result<(Vec<Vector3>, Vec<DirectionSet>), SweepError> {
    let local_max_z = grid
        .local_cells()
        .iter()
        .flat_map(|c| c.faces.iter().map(|f| f.normal.z.abs()))
        .fold(0.0, f64::max);
    if comm.allreduce_max_f64(local_max_z) > POLAR_NORMAL_TOLERANCE {
        log::error!("polar angle aggregation requested on a grid with z-facing faces");
        return Err(SweepError::UnsupportedAggregation(
            "polar aggregation requires face normals without a z-component".into(),
        ));
    }

    let mut projections: Vec<Vector3> = Vec::new();
    let mut sets: Vec<DirectionSet> = Vec::new();
    for (n, omega) in quadrature.omegas.iter().enumerate() {
        let proj = Vector3::new(omega.x, omega.y, 0.0).normalized();
        let spds = match projections.iter().position(|p| {
            if p.norm() == 0.0 || proj.norm() == 0.0 {
                p.norm() == proj.norm()
            } else {
                p.dot(&proj) > 1.0 - PROJECTION_MATCH_TOLERANCE
            }
        }) {
            Some(i) => i,
            None => {
                projections.push(proj);
                projections.len() - 1
            }
        };
        // upper and lower hemisphere sweep separately but share the SPDS
        let key = octant_key(omega, 3);
        match sets.iter_mut().find(|s| s.spds == spds && s.key == key) {
            Some(s) => s.angles.push(n),
            None => sets.push(DirectionSet {
                spds,
                angles: vec![n],
                key,
            }),
        }
    }
    Ok((projections, sets))
}

fn local_orderings(
    grid: &Grid,
    omegas: &[Vector3],
    allow_cycles: bool,
) -> Result<Vec<LocalSweepOrdering>, SweepError> {
    #[cfg(feature = "rayon")]
    let it = omegas.par_iter();
    #[cfg(not(feature = "rayon"))]
    let it = omegas.iter();
    it.map(|&omega| LocalSweepOrdering::compute(grid, omega, allow_cycles))
        .collect()
}

pub struct AngleAggregation<C: Communicator> {
    grid: Arc<Grid>,
    quadrature: AngularQuadrature,
    num_groups: usize,
    num_group_subsets: usize,
    boundaries: BoundaryMap,
    angle_set_groups: Vec<AngleSetGroup<C>>,
    num_angle_sets: usize,
}

impl<C: Communicator> AngleAggregation<C> {
    /// Build every SPDS, FLUDS and angle set (collective over `comm`), then
    /// initialise the boundaries.
    pub fn build(
        grid: Arc<Grid>,
        quadrature: AngularQuadrature,
        num_groups: usize,
        boundaries: BoundaryMap,
        config: &SweepConfig,
        comm: &C,
    ) -> Result<Self, SweepError> {
        config.validate()?;
        if num_groups < config.num_group_subsets {
            return Err(SweepError::Config(format!(
                "{} group subsets for {num_groups} groups",
                config.num_group_subsets
            )));
        }
        if let Some(bid) = grid.boundary_ids().into_iter().find(|b| !boundaries.contains_key(b)) {
            log::error!("rank {}: no boundary condition for boundary id {bid}", comm.rank());
            return Err(SweepError::BoundaryNotFound(bid));
        }

        let (spds_omegas, directions) = match config.angle_aggregation {
            AngleAggregationType::Single => single_directions(&quadrature, grid.dimension()),
            AngleAggregationType::Polar => polar_directions(&grid, &quadrature, comm)?,
        };

        // 1) local orderings, 2) the collective halves, identical order everywhere
        let orderings = local_orderings(&grid, &spds_omegas, config.allow_cycles)?;
        let mut commons = Vec::with_capacity(orderings.len());
        for ordering in orderings {
            let spds = Arc::new(Spds::from_local_ordering(
                Arc::clone(&grid),
                ordering,
                config.allow_cycles,
                comm,
            )?);
            commons.push(Arc::new(FludsCommonData::new(spds, comm)?));
        }

        // 3) angle sets, grouped by octant
        let subsets = group_subsets(num_groups, config.num_group_subsets);
        let mut by_key: BTreeMap<[u8; 3], Vec<&DirectionSet>> = BTreeMap::new();
        for d in &directions {
            by_key.entry(d.key).or_default().push(d);
        }
        let mut angle_set_groups = Vec::with_capacity(by_key.len());
        let mut id = 0;
        for sets in by_key.values() {
            let mut angle_sets = Vec::new();
            for d in sets {
                let common = &commons[d.spds];
                for (gs, groups) in subsets.iter().enumerate() {
                    let info = AngleSetInfo {
                        id,
                        angles: d.angles.clone(),
                        group_subset: gs,
                        groups: groups.clone(),
                        omega: common.spds().omega(),
                    };
                    let fluds = Fluds::new(Arc::clone(common), groups.len(), d.angles.len());
                    angle_sets.push(AngleSet::new(
                        info,
                        Arc::clone(common.spds()),
                        fluds,
                        config.eager_limit_bytes,
                    ));
                    id += 1;
                }
            }
            angle_set_groups.push(AngleSetGroup::new(angle_sets));
        }
        log::debug!(
            "rank {}: {:?} aggregation: {} SPDS, {id} angle sets in {} groups",
            comm.rank(),
            config.angle_aggregation,
            commons.len(),
            angle_set_groups.len()
        );

        let mut agg = Self {
            grid,
            quadrature,
            num_groups,
            num_group_subsets: config.num_group_subsets,
            boundaries,
            angle_set_groups,
            num_angle_sets: id,
        };
        agg.initialize_incident_bcs()?;
        agg.initialize_reflecting_bcs()?;
        Ok(agg)
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    pub fn quadrature(&self) -> &AngularQuadrature {
        &self.quadrature
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn num_group_subsets(&self) -> usize {
        self.num_group_subsets
    }

    pub fn num_angle_sets(&self) -> usize {
        self.num_angle_sets
    }

    pub fn angle_set_groups(&self) -> &[AngleSetGroup<C>] {
        &self.angle_set_groups
    }

    pub fn angle_set_groups_mut(&mut self) -> &mut [AngleSetGroup<C>] {
        &mut self.angle_set_groups
    }

    pub fn angle_sets(&self) -> impl Iterator<Item = &AngleSet<C>> {
        self.angle_set_groups.iter().flat_map(|g| g.angle_sets())
    }

    pub fn boundaries(&self) -> &BoundaryMap {
        &self.boundaries
    }

    pub fn boundaries_mut(&mut self) -> &mut BoundaryMap {
        &mut self.boundaries
    }

    /// Angle-set groups and boundaries, borrowed together for sweeping.
    pub fn split_mut(&mut self) -> (&mut [AngleSetGroup<C>], &mut BoundaryMap) {
        (&mut self.angle_set_groups, &mut self.boundaries)
    }

    fn initialize_incident_bcs(&mut self) -> Result<(), SweepError> {
        for (&bid, b) in self.boundaries.iter_mut() {
            if let SweepBoundary::IncidentHeterogeneous(h) = b {
                h.initialize(bid, &self.grid, &self.quadrature.omegas)?;
            }
        }
        Ok(())
    }

    /// Match reflected angles, size the reflecting storage and mark the
    /// lagged member of every opposing pair.
    pub fn initialize_reflecting_bcs(&mut self) -> Result<(), SweepError> {
        let mut normals = Vec::new();
        for (&bid, b) in self.boundaries.iter_mut() {
            if let Some(r) = b.as_reflecting_mut() {
                r.initialize(bid, &self.grid, &self.quadrature.omegas, self.num_group_subsets)?;
                r.set_opposing_reflected(false);
                normals.push((bid, r.normal()));
            }
        }
        for &(bid, n) in &normals {
            let opposing = normals
                .iter()
                .any(|&(other, m)| other > bid && n.dot(&m) < -OPPOSING_TOLERANCE);
            if let Some(r) = self.boundaries.get_mut(&bid).and_then(SweepBoundary::as_reflecting_mut) {
                if opposing {
                    log::debug!("reflecting boundary {bid} is lagged against its opposite");
                    r.set_opposing_reflected(true);
                    r.copy_new_to_old();
                }
            }
        }
        Ok(())
    }

    /// Zero the outgoing flux stored on reflecting boundaries.
    pub fn reset_reflecting_bcs(&mut self) {
        self.boundaries
            .values_mut()
            .filter_map(SweepBoundary::as_reflecting_mut)
            .for_each(|r| r.reset_flux());
    }

    pub fn reset_reflecting_ready_flags(&mut self) {
        self.boundaries
            .values_mut()
            .for_each(SweepBoundary::reset_angles_ready_status);
    }

    /// Record the change of every opposing reflecting boundary and make the
    /// new flux the lagged one.
    pub fn lag_opposing_reflecting_flux(&mut self) {
        self.boundaries
            .values_mut()
            .filter_map(SweepBoundary::as_reflecting_mut)
            .filter(|r| r.is_opposing_reflected())
            .for_each(|r| {
                r.lag_flux();
            });
    }

    /// Global max relative change of the delayed angular flux.
    pub fn delayed_psi_norm(&self, comm: &C) -> f64 {
        let sets = self.angle_sets().map(AngleSet::delayed_change);
        let bndry = self
            .boundaries
            .values()
            .filter_map(SweepBoundary::as_reflecting)
            .filter(|r| r.is_opposing_reflected())
            .map(|r| r.last_change());
        let local = sets.chain(bndry).fold(0.0, f64::max);
        comm.allreduce_max_f64(local)
    }

    fn delayed_buffers(&self, old: bool) -> Vec<&[f64]> {
        let mut out: Vec<&[f64]> = Vec::new();
        for r in self
            .boundaries
            .values()
            .filter_map(SweepBoundary::as_reflecting)
            .filter(|r| r.is_opposing_reflected())
        {
            let flux = if old { r.boundary_flux_old() } else { r.boundary_flux() };
            out.extend(flux.iter().map(Vec::as_slice));
        }
        for set in self.angle_sets() {
            out.extend(set.fluds().delayed_buffers(old));
        }
        out
    }

    fn delayed_buffers_mut(&mut self, old: bool) -> Vec<&mut [f64]> {
        let mut out: Vec<&mut [f64]> = Vec::new();
        for r in self
            .boundaries
            .values_mut()
            .filter_map(SweepBoundary::as_reflecting_mut)
            .filter(|r| r.is_opposing_reflected())
        {
            let flux = if old {
                r.boundary_flux_old_mut()
            } else {
                r.boundary_flux_mut()
            };
            out.extend(flux.iter_mut().map(Vec::as_mut_slice));
        }
        for group in &mut self.angle_set_groups {
            for set in group.angle_sets_mut() {
                out.extend(set.fluds_mut().delayed_buffers_mut(old));
            }
        }
        out
    }

    /// `(local, global)` length of the delayed angular flux vector.
    pub fn num_delayed_angular_dofs(&self, comm: &C) -> (usize, usize) {
        let local: usize = self.delayed_buffers(false).iter().map(|b| b.len()).sum();
        let global = comm.allreduce_sum_u64(local as u64) as usize;
        (local, global)
    }

    pub fn append_new_delayed_angular_dofs(&self, out: &mut Vec<f64>) {
        self.delayed_buffers(false)
            .into_iter()
            .for_each(|b| out.extend_from_slice(b));
    }

    pub fn append_old_delayed_angular_dofs(&self, out: &mut Vec<f64>) {
        self.delayed_buffers(true)
            .into_iter()
            .for_each(|b| out.extend_from_slice(b));
    }

    fn set_delayed_from_slice(&mut self, old: bool, src: &[f64]) -> Result<(), SweepError> {
        let mut bufs = self.delayed_buffers_mut(old);
        let expected: usize = bufs.iter().map(|b| b.len()).sum();
        if expected != src.len() {
            return Err(SweepError::DelayedDofCountMismatch {
                expected,
                got: src.len(),
            });
        }
        let mut offset = 0;
        for b in bufs.iter_mut() {
            let n = b.len();
            b.copy_from_slice(&src[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    pub fn set_new_delayed_angular_dofs_from_slice(&mut self, src: &[f64]) -> Result<(), SweepError> {
        self.set_delayed_from_slice(false, src)
    }

    pub fn set_old_delayed_angular_dofs_from_slice(&mut self, src: &[f64]) -> Result<(), SweepError> {
        self.set_delayed_from_slice(true, src)
    }

    /// Copy the lagged delayed flux over the current one.
    pub fn set_delayed_psi_old_to_new(&mut self) -> Result<(), SweepError> {
        let mut old = Vec::new();
        self.append_old_delayed_angular_dofs(&mut old);
        self.set_delayed_from_slice(false, &old)
    }

    pub fn set_delayed_psi_new_to_old(&mut self) -> Result<(), SweepError> {
        let mut new = Vec::new();
        self.append_new_delayed_angular_dofs(&mut new);
        self.set_delayed_from_slice(true, &new)
    }

    /// Zero the delayed flux written by this sweep: the delayed local and
    /// delayed predecessor buffers.
    pub fn zero_outgoing_delayed_psi(&mut self) {
        for group in &mut self.angle_set_groups {
            for set in group.angle_sets_mut() {
                set.fluds_mut()
                    .delayed_buffers_mut(false)
                    .into_iter()
                    .for_each(|b| b.fill(0.0));
            }
        }
    }

    /// Zero the delayed flux read by the next sweep, including the lagged
    /// flux of opposing reflecting boundaries.
    pub fn zero_incoming_delayed_psi(&mut self) {
        self.delayed_buffers_mut(true)
            .into_iter()
            .for_each(|b| b.fill(0.0));
    }

    pub fn reset_delayed_psi(&mut self) {
        for old in [false, true] {
            self.delayed_buffers_mut(old)
                .into_iter()
                .for_each(|b| b.fill(0.0));
        }
    }
}
