//! Flux data structure (FLUDS).
//!
//! [`FludsCommonData`] is built once per SPDS and shared by every angle set
//! sweeping that direction. It assigns every face of every cell in sweep
//! order a storage location:
//!
//! * local faces go into per-category "lock boxes": a slot is claimed when
//!   the upstream cell writes its outgoing face and released when the
//!   downstream cell has read it, so storage is bounded by the widest
//!   wavefront rather than the number of faces;
//! * faces closing a removed local cycle go into a delayed box that is never
//!   released, because the value is consumed in the next sweep;
//! * faces shared with other ranks are packed contiguously per neighbour
//!   location, in the order the upstream rank writes them.
//!
//! The alpha pass is local. The beta pass exchanges compact cell views with
//! every neighbour so the downstream side can map its face vertices onto the
//! upstream layout.
//!
//! [`Fluds`] owns the angular-flux arenas of one angle set and exposes them
//! as `num_groups`-long slices.

use crate::algs::communicator::{tags, Communicator, Wait};
use crate::algs::wire::{
    cast_slice, decode_cell_views, decode_pod_vec, encode_cell_views, CellView, FaceView,
    WireCount,
};
use crate::grid::{same_vertex_set, FaceNeighbor};
use crate::sweep::spds::{FaceOrientation, Predecessor, Spds};
use crate::sweep_error::SweepError;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeSet;
use std::mem::size_of;
use std::sync::Arc;

/// Storage class of a local face.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocalFaceCategory {
    /// Index into the face-size histogram.
    Regular(usize),
    /// Face of a removed local cycle; read from the previous sweep.
    Delayed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingLocalFace {
    pub category: LocalFaceCategory,
    pub slot: usize,
    /// `upwind_dof[i]`: position of this face's vertex `i` on the upwind face.
    pub upwind_dof: Vec<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutgoingLocalFace {
    pub category: LocalFaceCategory,
    pub slot: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NonLocalOutgoingFace {
    /// Index into [`Spds::all_successors`].
    pub deploc: usize,
    pub dof_offset: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonLocalIncomingFace {
    pub preloc: Predecessor,
    pub dof_offset: usize,
    pub upwind_dof: Vec<usize>,
}

/// Where the angular flux of one face lives.
///
/// Counter values index the per-cell (local) or per-sweep (non-local) face
/// lists of [`FludsCommonData`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaceAddress {
    Parallel,
    IncomingLocal(usize),
    IncomingNonLocal(usize),
    IncomingBoundary(u64),
    OutgoingLocal(usize),
    OutgoingNonLocal(usize),
    OutgoingBoundary(u64),
}

/// Non-local incoming face waiting for the beta pass.
#[derive(Debug)]
struct PendingNonLocal {
    cell_global_id: u64,
    face: usize,
    neighbor_global_id: u64,
    partition: usize,
    vertex_ids: Vec<u64>,
}

#[derive(Debug, Default)]
struct AlphaPass {
    category_face_sizes: Vec<usize>,
    local_psi_max_elements: Vec<usize>,
    delayed_local_psi_stride: usize,
    delayed_local_psi_max_elements: usize,
    face_addresses: Vec<Vec<FaceAddress>>,
    incoming_local: Vec<Vec<IncomingLocalFace>>,
    outgoing_local: Vec<Vec<OutgoingLocalFace>>,
    nonlocal_outgoing: Vec<NonLocalOutgoingFace>,
    deploc_face_dof_count: Vec<usize>,
    deploc_views: Vec<Vec<CellView>>,
    pending_incoming: Vec<PendingNonLocal>,
    incoming_boundary_ids: BTreeSet<u64>,
}

/// Position of each local vertex on the upwind face.
fn upwind_dof_map(
    rank: usize,
    cell_global_id: u64,
    face: usize,
    local: &[u64],
    upwind: &[u64],
) -> Result<Vec<usize>, SweepError> {
    local
        .iter()
        .map(|v| {
            upwind
                .iter()
                .position(|u| u == v)
                .ok_or(SweepError::AssociatedVertexNotFound {
                    rank,
                    cell_global_id,
                    face,
                    vertex: *v,
                })
        })
        .collect()
}

fn alpha_pass(spds: &Spds) -> Result<AlphaPass, SweepError> {
    let grid = spds.grid();
    let rank = grid.rank();
    let cells = grid.local_cells();

    let category_face_sizes: Vec<usize> = grid
        .face_size_histogram()
        .into_iter()
        .map(|(size, _)| size)
        .collect();
    let category_of = |n: usize| category_face_sizes.binary_search(&n).unwrap_or_else(|i| i);
    let num_categories = category_face_sizes.len();

    let cyclic: HashSet<(usize, usize)> = spds.local_cyclic_dependencies().iter().copied().collect();
    let num_deplocs = spds.all_successors().count();

    // lock box entry: (upstream cell global id, upstream face)
    let mut lock_boxes: Vec<Vec<Option<(u64, usize)>>> = vec![Vec::new(); num_categories];
    let mut delayed_slots: HashMap<(u64, usize), usize> = HashMap::new();
    // (spls index, incoming counter, upstream key, cell global id, face)
    let mut pending_delayed: Vec<(usize, usize, (u64, usize), u64, usize)> = Vec::new();

    let mut out = AlphaPass {
        local_psi_max_elements: vec![0; num_categories],
        deploc_face_dof_count: vec![0; num_deplocs],
        deploc_views: vec![Vec::new(); num_deplocs],
        ..Default::default()
    };

    for (so, &cell_local) in spds.spls().iter().enumerate() {
        let cell = &cells[cell_local];
        let mut addresses = vec![FaceAddress::Parallel; cell.faces.len()];
        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();

        // 1) incoming faces release the slots of their upwind faces
        for (f, face) in cell.faces.iter().enumerate() {
            if spds.face_orientation(cell_local, f) != FaceOrientation::Incoming {
                continue;
            }
            match face.neighbor {
                FaceNeighbor::Boundary(bid) => {
                    out.incoming_boundary_ids.insert(bid);
                    addresses[f] = FaceAddress::IncomingBoundary(bid);
                }
                FaceNeighbor::Cell {
                    global_id: nbr_gid,
                    partition,
                } => match grid.local_id_of(nbr_gid) {
                    Some(nbr_local) => {
                        let ass_face = grid.associated_face(cell, f).ok_or(
                            SweepError::AssociatedFaceNotFound {
                                rank,
                                cell_global_id: cell.global_id,
                                face: f,
                            },
                        )?;
                        let upwind_dof = upwind_dof_map(
                            rank,
                            cell.global_id,
                            f,
                            &face.vertex_ids,
                            &cells[nbr_local].faces[ass_face].vertex_ids,
                        )?;
                        let key = (nbr_gid, ass_face);
                        let counter = incoming.len();
                        if cyclic.contains(&(nbr_local, cell_local)) {
                            pending_delayed.push((so, counter, key, cell.global_id, f));
                            incoming.push(IncomingLocalFace {
                                category: LocalFaceCategory::Delayed,
                                slot: 0,
                                upwind_dof,
                            });
                        } else {
                            let c = category_of(face.num_vertices());
                            let slot = lock_boxes[c]
                                .iter()
                                .position(|e| *e == Some(key))
                                .ok_or(SweepError::LockBoxSlotNotFound {
                                    rank,
                                    cell_global_id: cell.global_id,
                                    face: f,
                                })?;
                            lock_boxes[c][slot] = None;
                            incoming.push(IncomingLocalFace {
                                category: LocalFaceCategory::Regular(c),
                                slot,
                                upwind_dof,
                            });
                        }
                        addresses[f] = FaceAddress::IncomingLocal(counter);
                    }
                    None => {
                        addresses[f] = FaceAddress::IncomingNonLocal(out.pending_incoming.len());
                        out.pending_incoming.push(PendingNonLocal {
                            cell_global_id: cell.global_id,
                            face: f,
                            neighbor_global_id: nbr_gid,
                            partition,
                            vertex_ids: face.vertex_ids.clone(),
                        });
                    }
                },
            }
        }

        // 2) outgoing faces claim slots
        for (f, face) in cell.faces.iter().enumerate() {
            if spds.face_orientation(cell_local, f) != FaceOrientation::Outgoing {
                continue;
            }
            match face.neighbor {
                FaceNeighbor::Boundary(bid) => {
                    addresses[f] = FaceAddress::OutgoingBoundary(bid);
                }
                FaceNeighbor::Cell {
                    global_id: nbr_gid,
                    partition,
                } => match grid.local_id_of(nbr_gid) {
                    Some(nbr_local) => {
                        let key = (cell.global_id, f);
                        let counter = outgoing.len();
                        if cyclic.contains(&(cell_local, nbr_local)) {
                            let slot = delayed_slots.len();
                            delayed_slots.insert(key, slot);
                            out.delayed_local_psi_stride =
                                out.delayed_local_psi_stride.max(face.num_vertices());
                            outgoing.push(OutgoingLocalFace {
                                category: LocalFaceCategory::Delayed,
                                slot,
                            });
                        } else {
                            let c = category_of(face.num_vertices());
                            let slot = match lock_boxes[c].iter().position(Option::is_none) {
                                Some(s) => {
                                    lock_boxes[c][s] = Some(key);
                                    s
                                }
                                None => {
                                    lock_boxes[c].push(Some(key));
                                    lock_boxes[c].len() - 1
                                }
                            };
                            out.local_psi_max_elements[c] =
                                out.local_psi_max_elements[c].max(lock_boxes[c].len());
                            outgoing.push(OutgoingLocalFace {
                                category: LocalFaceCategory::Regular(c),
                                slot,
                            });
                        }
                        addresses[f] = FaceAddress::OutgoingLocal(counter);
                    }
                    None => {
                        let deploc = spds
                            .map_loc_to_deploc(partition)
                            .ok_or(SweepError::UnknownLocation {
                                rank,
                                location: partition,
                            })?;
                        let dof_offset = out.deploc_face_dof_count[deploc];
                        out.deploc_face_dof_count[deploc] += face.num_vertices();
                        addresses[f] = FaceAddress::OutgoingNonLocal(out.nonlocal_outgoing.len());
                        out.nonlocal_outgoing.push(NonLocalOutgoingFace { deploc, dof_offset });

                        let view = FaceView {
                            slot: dof_offset,
                            vertex_ids: face.vertex_ids.clone(),
                        };
                        match out.deploc_views[deploc].last_mut() {
                            Some(cv) if cv.global_id == cell.global_id => cv.faces.push(view),
                            _ => out.deploc_views[deploc].push(CellView {
                                global_id: cell.global_id,
                                faces: vec![view],
                            }),
                        }
                    }
                },
            }
        }

        out.face_addresses.push(addresses);
        out.incoming_local.push(incoming);
        out.outgoing_local.push(outgoing);
    }

    // 3) delayed incoming faces read whatever slot the upstream face got
    for (so, counter, key, cell_global_id, face) in pending_delayed {
        let slot = *delayed_slots
            .get(&key)
            .ok_or(SweepError::LockBoxSlotNotFound {
                rank,
                cell_global_id,
                face,
            })?;
        out.incoming_local[so][counter].slot = slot;
    }
    out.delayed_local_psi_max_elements = delayed_slots.len();
    out.category_face_sizes = category_face_sizes;
    Ok(out)
}

struct BetaPass {
    nonlocal_incoming: Vec<NonLocalIncomingFace>,
    preloc_face_dof_count: Vec<usize>,
    delayed_preloc_face_dof_count: Vec<usize>,
}

fn receive_views<C: Communicator>(comm: &C, loc: usize) -> Result<Vec<CellView>, SweepError> {
    let size_tag = tags::BETA_PASS.base();
    let missing = |what: &str| SweepError::CommError {
        neighbor: loc,
        source: format!("missing beta-pass {what}").into(),
    };
    let raw = comm
        .irecv(loc, size_tag, size_of::<WireCount>())
        .wait()
        .ok_or_else(|| missing("size"))?;
    let len = decode_pod_vec::<WireCount>(&raw)?
        .first()
        .map(WireCount::get)
        .ok_or_else(|| missing("size"))?;
    let payload = comm
        .irecv(loc, size_tag + 1, len)
        .wait()
        .ok_or_else(|| missing("payload"))?;
    decode_cell_views(&payload)
}

fn beta_pass<C: Communicator>(
    spds: &Spds,
    deploc_views: &[Vec<CellView>],
    pending: Vec<PendingNonLocal>,
    comm: &C,
) -> Result<BetaPass, SweepError> {
    let rank = comm.rank();
    let size_tag = tags::BETA_PASS.base();

    // 1) post views to every successor, direct and delayed
    let mut sends = Vec::new();
    for (deploc, loc) in spds.all_successors().enumerate() {
        let payload = encode_cell_views(&deploc_views[deploc]);
        let count = [WireCount::new(payload.len())];
        sends.push(comm.isend(loc, size_tag, cast_slice(&count)));
        sends.push(comm.isend(loc, size_tag + 1, &payload));
    }

    // 2) receive from every predecessor, then drain sends before reporting
    let direct: Result<Vec<_>, _> = spds
        .location_dependencies()
        .iter()
        .map(|&loc| receive_views(comm, loc))
        .collect();
    let delayed: Result<Vec<_>, _> = spds
        .delayed_location_dependencies()
        .iter()
        .map(|&loc| receive_views(comm, loc))
        .collect();
    for s in sends {
        let _ = s.wait();
    }
    let direct = direct?;
    let delayed = delayed?;

    let dof_count = |views: &Vec<CellView>| -> usize {
        views
            .iter()
            .flat_map(|c| c.faces.iter().map(|f| f.vertex_ids.len()))
            .sum()
    };
    let index = |views: &Vec<CellView>| -> HashMap<u64, usize> {
        views.iter().enumerate().map(|(i, c)| (c.global_id, i)).collect()
    };
    let direct_index: Vec<_> = direct.iter().map(index).collect();
    let delayed_index: Vec<_> = delayed.iter().map(index).collect();

    // 3) map every non-local incoming face onto the upstream layout
    let mut nonlocal_incoming = Vec::with_capacity(pending.len());
    for p in pending {
        let preloc = spds
            .map_loc_to_preloc(p.partition)
            .ok_or(SweepError::UnknownLocation {
                rank,
                location: p.partition,
            })?;
        let (views, idx) = match preloc {
            Predecessor::Direct(i) => (&direct[i], &direct_index[i]),
            Predecessor::Delayed(i) => (&delayed[i], &delayed_index[i]),
        };
        let cell_view = idx.get(&p.neighbor_global_id).map(|&i| &views[i]).ok_or(
            SweepError::PredecessorCellNotFound {
                rank,
                cell_global_id: p.neighbor_global_id,
                predecessor: p.partition,
            },
        )?;
        let face_view = cell_view
            .faces
            .iter()
            .find(|fv| same_vertex_set(&fv.vertex_ids, &p.vertex_ids))
            .ok_or(SweepError::AssociatedFaceNotFound {
                rank,
                cell_global_id: p.cell_global_id,
                face: p.face,
            })?;
        let upwind_dof =
            upwind_dof_map(rank, p.cell_global_id, p.face, &p.vertex_ids, &face_view.vertex_ids)?;
        nonlocal_incoming.push(NonLocalIncomingFace {
            preloc,
            dof_offset: face_view.slot,
            upwind_dof,
        });
    }

    Ok(BetaPass {
        nonlocal_incoming,
        preloc_face_dof_count: direct.iter().map(dof_count).collect(),
        delayed_preloc_face_dof_count: delayed.iter().map(dof_count).collect(),
    })
}

/// Face addressing shared by every angle set of one SPDS.
#[derive(Debug)]
pub struct FludsCommonData {
    spds: Arc<Spds>,
    /// Vertex count of each local-face category; doubles as the slot stride.
    category_face_sizes: Vec<usize>,
    local_psi_max_elements: Vec<usize>,
    delayed_local_psi_stride: usize,
    delayed_local_psi_max_elements: usize,
    face_addresses: Vec<Vec<FaceAddress>>,
    incoming_local: Vec<Vec<IncomingLocalFace>>,
    outgoing_local: Vec<Vec<OutgoingLocalFace>>,
    nonlocal_outgoing: Vec<NonLocalOutgoingFace>,
    nonlocal_incoming: Vec<NonLocalIncomingFace>,
    deploc_face_dof_count: Vec<usize>,
    preloc_face_dof_count: Vec<usize>,
    delayed_preloc_face_dof_count: Vec<usize>,
    incoming_boundary_ids: Vec<u64>,
}

impl FludsCommonData {
    /// Run the alpha pass, then the (collective) beta pass.
    pub fn new<C: Communicator>(spds: Arc<Spds>, comm: &C) -> Result<Self, SweepError> {
        let alpha = alpha_pass(&spds).inspect_err(|e| log::error!("FLUDS alpha pass: {e}"))?;
        let beta = beta_pass(&spds, &alpha.deploc_views, alpha.pending_incoming, comm)
            .inspect_err(|e| log::error!("FLUDS beta pass: {e}"))?;

        log::debug!(
            "rank {}: FLUDS for {}: {} categories {:?} with {:?} slots, {} delayed slots, \
             {} non-local outgoing and {} incoming faces",
            comm.rank(),
            spds.omega(),
            alpha.category_face_sizes.len(),
            alpha.category_face_sizes,
            alpha.local_psi_max_elements,
            alpha.delayed_local_psi_max_elements,
            alpha.nonlocal_outgoing.len(),
            beta.nonlocal_incoming.len()
        );

        Ok(Self {
            spds,
            category_face_sizes: alpha.category_face_sizes,
            local_psi_max_elements: alpha.local_psi_max_elements,
            delayed_local_psi_stride: alpha.delayed_local_psi_stride,
            delayed_local_psi_max_elements: alpha.delayed_local_psi_max_elements,
            face_addresses: alpha.face_addresses,
            incoming_local: alpha.incoming_local,
            outgoing_local: alpha.outgoing_local,
            nonlocal_outgoing: alpha.nonlocal_outgoing,
            nonlocal_incoming: beta.nonlocal_incoming,
            deploc_face_dof_count: alpha.deploc_face_dof_count,
            preloc_face_dof_count: beta.preloc_face_dof_count,
            delayed_preloc_face_dof_count: beta.delayed_preloc_face_dof_count,
            incoming_boundary_ids: alpha.incoming_boundary_ids.into_iter().collect(),
        })
    }

    pub fn spds(&self) -> &Arc<Spds> {
        &self.spds
    }

    /// Storage location of face `face` of the `so`-th cell in sweep order.
    pub fn face_address(&self, so: usize, face: usize) -> FaceAddress {
        self.face_addresses[so][face]
    }

    pub fn incoming_local_face(&self, so: usize, counter: usize) -> &IncomingLocalFace {
        &self.incoming_local[so][counter]
    }

    pub fn outgoing_local_face(&self, so: usize, counter: usize) -> OutgoingLocalFace {
        self.outgoing_local[so][counter]
    }

    pub fn nonlocal_incoming_face(&self, counter: usize) -> &NonLocalIncomingFace {
        &self.nonlocal_incoming[counter]
    }

    pub fn nonlocal_outgoing_face(&self, counter: usize) -> NonLocalOutgoingFace {
        self.nonlocal_outgoing[counter]
    }

    pub fn num_categories(&self) -> usize {
        self.category_face_sizes.len()
    }

    /// Vertex stride of each category.
    pub fn local_psi_stride(&self) -> &[usize] {
        &self.category_face_sizes
    }

    /// Peak number of simultaneously occupied slots per category.
    pub fn local_psi_max_elements(&self) -> &[usize] {
        &self.local_psi_max_elements
    }

    pub fn delayed_local_psi_stride(&self) -> usize {
        self.delayed_local_psi_stride
    }

    pub fn delayed_local_psi_max_elements(&self) -> usize {
        self.delayed_local_psi_max_elements
    }

    /// Face DOFs sent to each location of [`Spds::all_successors`].
    pub fn deploc_face_dof_count(&self) -> &[usize] {
        &self.deploc_face_dof_count
    }

    pub fn preloc_face_dof_count(&self) -> &[usize] {
        &self.preloc_face_dof_count
    }

    pub fn delayed_preloc_face_dof_count(&self) -> &[usize] {
        &self.delayed_preloc_face_dof_count
    }

    /// Boundary ids seen on incoming faces, ascending.
    pub fn incoming_boundary_ids(&self) -> &[u64] {
        &self.incoming_boundary_ids
    }

    fn local_region(&self, category: LocalFaceCategory) -> (usize, usize) {
        match category {
            LocalFaceCategory::Regular(c) => {
                (self.category_face_sizes[c], self.local_psi_max_elements[c])
            }
            LocalFaceCategory::Delayed => (
                self.delayed_local_psi_stride,
                self.delayed_local_psi_max_elements,
            ),
        }
    }
}

/// Max relative change `|new - old| / |new|` over entries with a
/// representable `|new|`.
pub(crate) fn relative_change(new: &[f64], old: &[f64]) -> f64 {
    new.iter()
        .zip(old)
        .filter(|(n, _)| n.abs() >= f64::MIN_POSITIVE)
        .map(|(n, o)| (n - o).abs() / n.abs())
        .fold(0.0, f64::max)
}

/// Angular-flux storage of one angle set.
#[derive(Debug)]
pub struct Fluds {
    common: Arc<FludsCommonData>,
    num_groups: usize,
    num_angles: usize,
    local_psi: Vec<Vec<f64>>,
    delayed_local_psi: Vec<f64>,
    delayed_local_psi_old: Vec<f64>,
    deploc_outgoing_psi: Vec<Vec<f64>>,
    preloc_outgoing_psi: Vec<Vec<f64>>,
    delayed_preloc_outgoing_psi: Vec<Vec<f64>>,
    delayed_preloc_outgoing_psi_old: Vec<Vec<f64>>,
}

impl Fluds {
    /// Delayed buffers are allocated here and persist across sweeps; the
    /// per-sweep buffers are allocated on demand.
    pub fn new(common: Arc<FludsCommonData>, num_groups: usize, num_angles: usize) -> Self {
        let ga = num_groups * num_angles;
        let delayed_local_len =
            common.delayed_local_psi_stride * common.delayed_local_psi_max_elements * ga;
        let delayed_preloc: Vec<Vec<f64>> = common
            .delayed_preloc_face_dof_count
            .iter()
            .map(|&c| vec![0.0; c * ga])
            .collect();
        Self {
            num_groups,
            num_angles,
            local_psi: vec![Vec::new(); common.num_categories()],
            delayed_local_psi: vec![0.0; delayed_local_len],
            delayed_local_psi_old: vec![0.0; delayed_local_len],
            deploc_outgoing_psi: vec![Vec::new(); common.deploc_face_dof_count.len()],
            preloc_outgoing_psi: vec![Vec::new(); common.preloc_face_dof_count.len()],
            delayed_preloc_outgoing_psi_old: delayed_preloc.clone(),
            delayed_preloc_outgoing_psi: delayed_preloc,
            common,
        }
    }

    pub fn common(&self) -> &FludsCommonData {
        &self.common
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn num_angles(&self) -> usize {
        self.num_angles
    }

    /// Allocate the lock boxes and the downstream send buffers.
    pub fn allocate_local_and_downstream(&mut self) {
        let ga = self.num_groups * self.num_angles;
        let c = &self.common;
        for (k, buf) in self.local_psi.iter_mut().enumerate() {
            buf.resize(c.category_face_sizes[k] * c.local_psi_max_elements[k] * ga, 0.0);
        }
        for (k, buf) in self.deploc_outgoing_psi.iter_mut().enumerate() {
            buf.resize(c.deploc_face_dof_count[k] * ga, 0.0);
        }
    }

    /// Allocate the receive buffer of a direct predecessor if it is not yet.
    pub fn allocate_prelocal(&mut self, preloc: usize) {
        if self.preloc_outgoing_psi[preloc].is_empty() {
            let len = self.common.preloc_face_dof_count[preloc] * self.num_groups * self.num_angles;
            self.preloc_outgoing_psi[preloc] = vec![0.0; len];
        }
    }

    /// Release the lock boxes.
    pub fn clear_local(&mut self) {
        self.local_psi.iter_mut().for_each(|b| *b = Vec::new());
    }

    pub fn clear_downstream(&mut self) {
        self.deploc_outgoing_psi.iter_mut().for_each(|b| *b = Vec::new());
    }

    pub fn clear_prelocal(&mut self) {
        self.preloc_outgoing_psi.iter_mut().for_each(|b| *b = Vec::new());
    }

    fn local_index(&self, category: LocalFaceCategory, slot: usize, dof: usize, n: usize) -> usize {
        let (stride, max_elements) = self.common.local_region(category);
        let g = self.num_groups;
        stride * max_elements * g * n + slot * stride * g + dof * g
    }

    fn nonlocal_index(&self, count: usize, offset: usize, dof: usize, n: usize) -> usize {
        let g = self.num_groups;
        count * g * n + (offset + dof) * g
    }

    /// Outgoing flux of the `counter`-th outgoing local face of the
    /// `so`-th cell, for face vertex `dof` and angle `n` of the set.
    pub fn outgoing_psi(&mut self, so: usize, counter: usize, dof: usize, n: usize) -> &mut [f64] {
        let face = self.common.outgoing_local[so][counter];
        let i = self.local_index(face.category, face.slot, dof, n);
        let g = self.num_groups;
        match face.category {
            LocalFaceCategory::Regular(c) => &mut self.local_psi[c][i..i + g],
            LocalFaceCategory::Delayed => &mut self.delayed_local_psi[i..i + g],
        }
    }

    /// Upwind flux of the `counter`-th incoming local face of the `so`-th
    /// cell. Delayed faces read the previous sweep's value.
    pub fn upwind_psi(&self, so: usize, counter: usize, dof: usize, n: usize) -> &[f64] {
        let face = &self.common.incoming_local[so][counter];
        let i = self.local_index(face.category, face.slot, face.upwind_dof[dof], n);
        let g = self.num_groups;
        match face.category {
            LocalFaceCategory::Regular(c) => &self.local_psi[c][i..i + g],
            LocalFaceCategory::Delayed => &self.delayed_local_psi_old[i..i + g],
        }
    }

    /// Outgoing flux of the `counter`-th non-local outgoing face.
    pub fn nl_outgoing_psi(&mut self, counter: usize, dof: usize, n: usize) -> &mut [f64] {
        let face = self.common.nonlocal_outgoing[counter];
        let count = self.common.deploc_face_dof_count[face.deploc];
        let i = self.nonlocal_index(count, face.dof_offset, dof, n);
        let g = self.num_groups;
        &mut self.deploc_outgoing_psi[face.deploc][i..i + g]
    }

    /// Upwind flux of the `counter`-th non-local incoming face.
    pub fn nl_upwind_psi(&self, counter: usize, dof: usize, n: usize) -> &[f64] {
        let face = &self.common.nonlocal_incoming[counter];
        let g = self.num_groups;
        let dof = face.upwind_dof[dof];
        match face.preloc {
            Predecessor::Direct(p) => {
                let count = self.common.preloc_face_dof_count[p];
                let i = self.nonlocal_index(count, face.dof_offset, dof, n);
                &self.preloc_outgoing_psi[p][i..i + g]
            }
            Predecessor::Delayed(p) => {
                let count = self.common.delayed_preloc_face_dof_count[p];
                let i = self.nonlocal_index(count, face.dof_offset, dof, n);
                &self.delayed_preloc_outgoing_psi_old[p][i..i + g]
            }
        }
    }

    pub fn deploc_outgoing_psi(&self) -> &[Vec<f64>] {
        &self.deploc_outgoing_psi
    }

    pub fn preloc_outgoing_psi_mut(&mut self, preloc: usize) -> &mut [f64] {
        &mut self.preloc_outgoing_psi[preloc]
    }

    pub fn delayed_local_psi(&self) -> &[f64] {
        &self.delayed_local_psi
    }

    pub fn delayed_local_psi_mut(&mut self) -> &mut [f64] {
        &mut self.delayed_local_psi
    }

    pub fn delayed_local_psi_old(&self) -> &[f64] {
        &self.delayed_local_psi_old
    }

    pub fn delayed_local_psi_old_mut(&mut self) -> &mut [f64] {
        &mut self.delayed_local_psi_old
    }

    pub fn delayed_preloc_outgoing_psi(&self) -> &[Vec<f64>] {
        &self.delayed_preloc_outgoing_psi
    }

    pub fn delayed_preloc_outgoing_psi_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.delayed_preloc_outgoing_psi
    }

    pub fn delayed_preloc_outgoing_psi_old(&self) -> &[Vec<f64>] {
        &self.delayed_preloc_outgoing_psi_old
    }

    pub fn delayed_preloc_outgoing_psi_old_mut(&mut self) -> &mut [Vec<f64>] {
        &mut self.delayed_preloc_outgoing_psi_old
    }

    /// Delayed buffers in exchange order: the local one, then one per
    /// delayed predecessor.
    pub fn delayed_buffers(&self, old: bool) -> Vec<&[f64]> {
        let (local, preloc) = if old {
            (&self.delayed_local_psi_old, &self.delayed_preloc_outgoing_psi_old)
        } else {
            (&self.delayed_local_psi, &self.delayed_preloc_outgoing_psi)
        };
        std::iter::once(local.as_slice())
            .chain(preloc.iter().map(Vec::as_slice))
            .collect()
    }

    pub fn delayed_buffers_mut(&mut self, old: bool) -> Vec<&mut [f64]> {
        let (local, preloc) = if old {
            (&mut self.delayed_local_psi_old, &mut self.delayed_preloc_outgoing_psi_old)
        } else {
            (&mut self.delayed_local_psi, &mut self.delayed_preloc_outgoing_psi)
        };
        std::iter::once(local.as_mut_slice())
            .chain(preloc.iter_mut().map(Vec::as_mut_slice))
            .collect()
    }

    /// Relative change of the delayed local flux since the last commit.
    pub fn delayed_local_change(&self) -> f64 {
        relative_change(&self.delayed_local_psi, &self.delayed_local_psi_old)
    }

    /// Relative change of one delayed predecessor buffer.
    pub fn delayed_preloc_change(&self, preloc: usize) -> f64 {
        relative_change(
            &self.delayed_preloc_outgoing_psi[preloc],
            &self.delayed_preloc_outgoing_psi_old[preloc],
        )
    }

    /// Copy the delayed local flux into its lagged copy.
    pub fn commit_delayed_local(&mut self) {
        self.delayed_local_psi_old.copy_from_slice(&self.delayed_local_psi);
    }

    pub fn commit_delayed_preloc(&mut self, preloc: usize) {
        let (new, old) = (
            &self.delayed_preloc_outgoing_psi[preloc],
            &mut self.delayed_preloc_outgoing_psi_old[preloc],
        );
        old.copy_from_slice(new);
    }
}
