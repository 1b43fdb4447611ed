//! The seam between the scheduler and the per-cell transport kernel.
//!
//! The scheduler knows nothing about discretisations: it hands the chunk one
//! cell at a time, in sweep order, together with a [`SweepContext`] that
//! resolves every face to the right flux storage.

use crate::grid::{Cell, Vector3};
use crate::sweep::boundary::BoundaryMap;
use crate::sweep::fluds::{FaceAddress, Fluds};
use crate::sweep::spds::FaceOrientation;
use std::ops::Range;

/// What a chunk needs to know about the angle set being swept.
#[derive(Clone, Debug, PartialEq)]
pub struct AngleSetInfo {
    /// Global ordinal, identical on every rank.
    pub id: usize,
    /// Quadrature indices of the angles in the set.
    pub angles: Vec<usize>,
    pub group_subset: usize,
    /// Groups of the subset within the full group range.
    pub groups: Range<usize>,
    /// Direction the set's SPDS was built for.
    pub omega: Vector3,
}

pub trait SweepChunk {
    /// Called once per angle set, before its first cell.
    fn set_angle_set(&mut self, _info: &AngleSetInfo) {}

    /// Solve one cell for every angle and group of the set.
    fn sweep_cell(&mut self, ctx: &mut SweepContext<'_>);
}

/// Face-indexed flux access for the cell being swept.
pub struct SweepContext<'a> {
    info: &'a AngleSetInfo,
    fluds: &'a mut Fluds,
    boundaries: &'a mut BoundaryMap,
    zero: &'a [f64],
    spls_index: usize,
    cell: &'a Cell,
}

impl<'a> SweepContext<'a> {
    pub(crate) fn new(
        info: &'a AngleSetInfo,
        fluds: &'a mut Fluds,
        boundaries: &'a mut BoundaryMap,
        zero: &'a [f64],
        spls_index: usize,
        cell: &'a Cell,
    ) -> Self {
        Self {
            info,
            fluds,
            boundaries,
            zero,
            spls_index,
            cell,
        }
    }

    pub fn cell(&self) -> &Cell {
        self.cell
    }

    /// Position of the cell in the sweep order.
    pub fn spls_index(&self) -> usize {
        self.spls_index
    }

    pub fn angle_set(&self) -> &AngleSetInfo {
        self.info
    }

    pub fn num_angles(&self) -> usize {
        self.info.angles.len()
    }

    pub fn num_groups(&self) -> usize {
        self.info.groups.len()
    }

    pub fn face_orientation(&self, face: usize) -> FaceOrientation {
        self.fluds
            .common()
            .spds()
            .face_orientation(self.cell.local_id, face)
    }

    /// Upwind flux at vertex `dof` of `face` for the set's `n`-th angle.
    /// Faces that are not incoming read as zero.
    pub fn upwind_psi(&self, face: usize, dof: usize, n: usize) -> &[f64] {
        let so = self.spls_index;
        match self.fluds.common().face_address(so, face) {
            FaceAddress::IncomingLocal(c) => self.fluds.upwind_psi(so, c, dof, n),
            FaceAddress::IncomingNonLocal(c) => self.fluds.nl_upwind_psi(c, dof, n),
            FaceAddress::IncomingBoundary(bid) => match self.boundaries.get(&bid) {
                Some(b) => b.incoming_psi(
                    self.cell.local_id,
                    face,
                    dof,
                    self.info.angles[n],
                    self.info.groups.clone(),
                ),
                None => self.zero,
            },
            _ => self.zero,
        }
    }

    /// Storage for the outgoing flux at vertex `dof` of `face`. `None` for
    /// faces with nothing downstream (non-reflecting boundaries, parallel
    /// and incoming faces).
    pub fn outgoing_psi(&mut self, face: usize, dof: usize, n: usize) -> Option<&mut [f64]> {
        let so = self.spls_index;
        match self.fluds.common().face_address(so, face) {
            FaceAddress::OutgoingLocal(c) => Some(self.fluds.outgoing_psi(so, c, dof, n)),
            FaceAddress::OutgoingNonLocal(c) => Some(self.fluds.nl_outgoing_psi(c, dof, n)),
            FaceAddress::OutgoingBoundary(bid) => self.boundaries.get_mut(&bid)?.outgoing_psi(
                self.cell.local_id,
                face,
                dof,
                self.info.angles[n],
                self.info.groups.clone(),
            ),
            _ => None,
        }
    }
}
