//! Angle sets: the unit of scheduling.
//!
//! An angle set is a handful of angles sharing one SPDS, swept together for
//! one group subset. It is a small busy-poll state machine:
//! `Receiving → ReadyToExecute → Finished`, reset at the end of every sweep.

use crate::algs::communicator::Communicator;
use crate::sweep::boundary::BoundaryMap;
use crate::sweep::chunk::{AngleSetInfo, SweepChunk, SweepContext};
use crate::sweep::fluds::Fluds;
use crate::sweep::spds::Spds;
use crate::sweep::sweep_buffer::SweepBuffer;
use crate::sweep::timing::{EventKind, SweepEvents, SWEEP_CHUNK_TIMING};
use crate::sweep_error::SweepError;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AngleSetStatus {
    NotFinished,
    Finished,
    ReadyToExecute,
    Receiving,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionPermission {
    Execute,
    NoExecIfReady,
}

pub struct AngleSet<C: Communicator> {
    info: AngleSetInfo,
    spds: Arc<Spds>,
    fluds: Fluds,
    buffer: SweepBuffer<C>,
    executed: bool,
    delayed_received: bool,
    delayed_change: f64,
    zero: Vec<f64>,
}

impl<C: Communicator> AngleSet<C> {
    pub fn new(info: AngleSetInfo, spds: Arc<Spds>, fluds: Fluds, eager_limit_bytes: usize) -> Self {
        let buffer = SweepBuffer::new(info.id, &fluds, eager_limit_bytes);
        let zero = vec![0.0; info.groups.len()];
        Self {
            info,
            spds,
            fluds,
            buffer,
            executed: false,
            delayed_received: false,
            delayed_change: 0.0,
            zero,
        }
    }

    pub fn id(&self) -> usize {
        self.info.id
    }

    pub fn info(&self) -> &AngleSetInfo {
        &self.info
    }

    pub fn angle_indices(&self) -> &[usize] {
        &self.info.angles
    }

    pub fn group_subset(&self) -> usize {
        self.info.group_subset
    }

    pub fn spds(&self) -> &Arc<Spds> {
        &self.spds
    }

    pub fn fluds(&self) -> &Fluds {
        &self.fluds
    }

    pub fn fluds_mut(&mut self) -> &mut Fluds {
        &mut self.fluds
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn max_buffer_messages(&self) -> usize {
        self.buffer.max_buffer_messages()
    }

    pub fn set_max_buffer_messages(&mut self, n: usize) -> Result<(), SweepError> {
        self.buffer.set_max_buffer_messages(n)
    }

    /// One step of the state machine.
    ///
    /// Never blocks: pending receives are tested once per call.
    pub fn advance(
        &mut self,
        chunk: &mut dyn SweepChunk,
        boundaries: &mut BoundaryMap,
        comm: &C,
        events: &mut dyn SweepEvents,
        permission: ExecutionPermission,
    ) -> Result<AngleSetStatus, SweepError> {
        if self.executed {
            self.buffer.flush_send_buffers();
            return Ok(AngleSetStatus::Finished);
        }

        for bid in self.fluds.common().incoming_boundary_ids() {
            let ready = boundaries
                .get(bid)
                .map_or(true, |b| b.check_angles_ready_status(&self.info.angles, self.info.group_subset));
            if !ready {
                return Ok(AngleSetStatus::Receiving);
            }
        }

        let upstream = self.spds.location_dependencies();
        if !self.buffer.receive_upstream_psi(&mut self.fluds, upstream, comm)? {
            return Ok(AngleSetStatus::Receiving);
        }

        if permission != ExecutionPermission::Execute {
            return Ok(AngleSetStatus::ReadyToExecute);
        }

        self.execute(chunk, boundaries, comm, events);
        Ok(AngleSetStatus::Finished)
    }

    fn execute(
        &mut self,
        chunk: &mut dyn SweepChunk,
        boundaries: &mut BoundaryMap,
        comm: &C,
        events: &mut dyn SweepEvents,
    ) {
        self.fluds.allocate_local_and_downstream();

        events.log_event(SWEEP_CHUNK_TIMING, EventKind::Begin);
        chunk.set_angle_set(&self.info);
        let cells = self.spds.grid().local_cells();
        for (so, &cell) in self.spds.spls().iter().enumerate() {
            let mut ctx = SweepContext::new(
                &self.info,
                &mut self.fluds,
                boundaries,
                &self.zero,
                so,
                &cells[cell],
            );
            chunk.sweep_cell(&mut ctx);
        }
        events.log_event(SWEEP_CHUNK_TIMING, EventKind::End);

        let successors: Vec<usize> = self.spds.all_successors().collect();
        self.buffer.send_downstream_psi(&self.fluds, &successors, comm);
        self.fluds.clear_local();
        self.fluds.clear_downstream();
        self.fluds.clear_prelocal();

        for b in boundaries.values_mut() {
            b.update_angles_ready_status(&self.info.angles, self.info.group_subset);
        }
        self.executed = true;
        log::trace!("rank {}: angle set {} executed", comm.rank(), self.info.id);
    }

    /// Test pending sends; true when all are complete.
    pub fn flush_send_buffers(&mut self) -> bool {
        self.buffer.flush_send_buffers()
    }

    /// Non-blocking receive of data from delayed predecessors. Once all of it
    /// is in, the relative change of every delayed buffer is recorded and
    /// the new values become the lagged ones.
    pub fn receive_delayed_data(&mut self, comm: &C) -> Result<bool, SweepError> {
        if self.delayed_received {
            return Ok(true);
        }
        let delayed = self.spds.delayed_location_dependencies();
        if !self.buffer.receive_delayed_data(&mut self.fluds, delayed, comm)? {
            return Ok(false);
        }
        let mut change = self.fluds.delayed_local_change();
        for p in 0..delayed.len() {
            change = change.max(self.fluds.delayed_preloc_change(p));
            self.fluds.commit_delayed_preloc(p);
        }
        self.fluds.commit_delayed_local();
        self.delayed_change = change;
        self.delayed_received = true;
        Ok(true)
    }

    /// Relative change of the delayed data at the last delayed receive.
    pub fn delayed_change(&self) -> f64 {
        self.delayed_change
    }

    /// Make the set sweepable again.
    pub fn reset_sweep_buffers(&mut self) {
        self.executed = false;
        self.delayed_received = false;
        self.buffer.reset();
    }
}

/// Angle sets sharing an octant (or quadrant / half-range).
pub struct AngleSetGroup<C: Communicator> {
    angle_sets: Vec<AngleSet<C>>,
}

impl<C: Communicator> AngleSetGroup<C> {
    pub fn new(angle_sets: Vec<AngleSet<C>>) -> Self {
        Self { angle_sets }
    }

    pub fn angle_sets(&self) -> &[AngleSet<C>] {
        &self.angle_sets
    }

    pub fn angle_sets_mut(&mut self) -> &mut [AngleSet<C>] {
        &mut self.angle_sets
    }

    /// Advance every set once; `Finished` only when all of them are.
    pub fn advance(
        &mut self,
        chunk: &mut dyn SweepChunk,
        boundaries: &mut BoundaryMap,
        comm: &C,
        events: &mut dyn SweepEvents,
        permission: ExecutionPermission,
    ) -> Result<AngleSetStatus, SweepError> {
        let mut finished = 0;
        for set in &mut self.angle_sets {
            if set.advance(chunk, boundaries, comm, events, permission)? == AngleSetStatus::Finished {
                finished += 1;
            }
        }
        Ok(if finished == self.angle_sets.len() {
            AngleSetStatus::Finished
        } else {
            AngleSetStatus::NotFinished
        })
    }

    pub fn reset_sweep(&mut self) {
        self.angle_sets
            .iter_mut()
            .for_each(AngleSet::reset_sweep_buffers);
    }
}
