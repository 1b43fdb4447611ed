//! Sweep scheduling: drives every angle set of an aggregation to completion.
//!
//! Two policies share the same state machine. FIFO advances angle-set
//! groups in order until all are finished. Depth-of-graph visits angle sets
//! in a fixed priority order (deepest in the task dependency graph first,
//! then by octant) and executes the first ready one it meets.
//!
//! After either policy the scheduler runs the post-sweep protocol: reset,
//! barrier, then drain sends and receive delayed data until every angle set
//! has it.

use crate::algs::communicator::Communicator;
use crate::config::SchedulingAlgorithm;
use crate::quadrature::octant_key;
use crate::sweep::angle_aggregation::AngleAggregation;
use crate::sweep::angle_set::{AngleSetStatus, ExecutionPermission};
use crate::sweep::chunk::SweepChunk;
use crate::sweep::timing::{EventKind, LogEvents, SweepEvents, SWEEP_TIMING};
use crate::sweep_error::SweepError;

/// Priority record of one angle set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RuleValues {
    /// Position of the set: `(angle-set group, index in group)`.
    pub group: usize,
    pub index: usize,
    pub depth_of_graph: usize,
    pub sign_of_omegax: u8,
    pub sign_of_omegay: u8,
    pub sign_of_omegaz: u8,
    pub set_index: usize,
}

impl RuleValues {
    fn sort_key(&self) -> (usize, u8, u8, u8) {
        (
            self.depth_of_graph,
            self.sign_of_omegax,
            self.sign_of_omegay,
            self.sign_of_omegaz,
        )
    }
}

pub struct SweepScheduler<C: Communicator, E: SweepEvents = LogEvents> {
    algorithm: SchedulingAlgorithm,
    angle_agg: AngleAggregation<C>,
    comm: C,
    events: E,
    rule_values: Vec<RuleValues>,
}

impl<C: Communicator> SweepScheduler<C, LogEvents> {
    pub fn new(
        algorithm: SchedulingAlgorithm,
        angle_agg: AngleAggregation<C>,
        comm: C,
    ) -> Result<Self, SweepError> {
        Self::with_events(algorithm, angle_agg, comm, LogEvents::new())
    }
}

impl<C: Communicator, E: SweepEvents> SweepScheduler<C, E> {
    /// Agree on the per-set message count (collective) and rank the sets.
    pub fn with_events(
        algorithm: SchedulingAlgorithm,
        mut angle_agg: AngleAggregation<C>,
        comm: C,
        events: E,
    ) -> Result<Self, SweepError> {
        let local_max = angle_agg
            .angle_sets()
            .map(|s| s.max_buffer_messages())
            .max()
            .unwrap_or(0);
        let global_max = comm.allreduce_max_f64(local_max as f64) as usize;
        for group in angle_agg.angle_set_groups_mut() {
            for set in group.angle_sets_mut() {
                set.set_max_buffer_messages(global_max)
                    .inspect_err(|e| log::error!("rank {}: {e}", comm.rank()))?;
            }
        }

        let mut rule_values = Vec::with_capacity(angle_agg.num_angle_sets());
        for (g, group) in angle_agg.angle_set_groups().iter().enumerate() {
            for (i, set) in group.angle_sets().iter().enumerate() {
                let [sx, sy, sz] = octant_key(&set.info().omega, 3);
                rule_values.push(RuleValues {
                    group: g,
                    index: i,
                    depth_of_graph: set.spds().depth_of_graph(),
                    sign_of_omegax: sx,
                    sign_of_omegay: sy,
                    sign_of_omegaz: sz,
                    set_index: set.id(),
                });
            }
        }
        rule_values.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        log::debug!(
            "rank {}: {algorithm:?} scheduler over {} angle sets, {global_max} messages per set",
            comm.rank(),
            rule_values.len()
        );

        Ok(Self {
            algorithm,
            angle_agg,
            comm,
            events,
            rule_values,
        })
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.algorithm
    }

    pub fn angle_aggregation(&self) -> &AngleAggregation<C> {
        &self.angle_agg
    }

    pub fn angle_aggregation_mut(&mut self) -> &mut AngleAggregation<C> {
        &mut self.angle_agg
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    /// Angle sets in depth-of-graph priority order.
    pub fn rule_values(&self) -> &[RuleValues] {
        &self.rule_values
    }

    /// Run one full sweep with `chunk`, including the post-sweep protocol.
    pub fn sweep(&mut self, chunk: &mut dyn SweepChunk) -> Result<(), SweepError> {
        self.events.log_event(SWEEP_TIMING, EventKind::Begin);
        match self.algorithm {
            SchedulingAlgorithm::FirstInFirstOut => self.schedule_fifo(chunk)?,
            SchedulingAlgorithm::DepthOfGraph => self.schedule_dog(chunk)?,
        }
        self.post_sweep()?;
        self.events.log_event(SWEEP_TIMING, EventKind::End);
        Ok(())
    }

    fn schedule_fifo(&mut self, chunk: &mut dyn SweepChunk) -> Result<(), SweepError> {
        let (groups, boundaries) = self.angle_agg.split_mut();
        loop {
            let mut completion = true;
            for group in groups.iter_mut() {
                let status = group.advance(
                    chunk,
                    boundaries,
                    &self.comm,
                    &mut self.events,
                    ExecutionPermission::Execute,
                )?;
                if status != AngleSetStatus::Finished {
                    completion = false;
                }
            }
            if completion {
                return Ok(());
            }
        }
    }

    fn schedule_dog(&mut self, chunk: &mut dyn SweepChunk) -> Result<(), SweepError> {
        let (groups, boundaries) = self.angle_agg.split_mut();
        loop {
            let mut finished = true;
            for rv in &self.rule_values {
                let set = &mut groups[rv.group].angle_sets_mut()[rv.index];
                let mut status = set.advance(
                    chunk,
                    boundaries,
                    &self.comm,
                    &mut self.events,
                    ExecutionPermission::NoExecIfReady,
                )?;
                if status == AngleSetStatus::ReadyToExecute {
                    status = set.advance(
                        chunk,
                        boundaries,
                        &self.comm,
                        &mut self.events,
                        ExecutionPermission::Execute,
                    )?;
                    set.flush_send_buffers();
                }
                if status != AngleSetStatus::Finished {
                    finished = false;
                }
            }
            if finished {
                return Ok(());
            }
        }
    }

    fn post_sweep(&mut self) -> Result<(), SweepError> {
        for group in self.angle_agg.angle_set_groups_mut() {
            group.reset_sweep();
        }
        self.angle_agg.reset_reflecting_ready_flags();

        self.comm.barrier();

        let groups = self.angle_agg.angle_set_groups_mut();
        loop {
            let mut received = true;
            for rv in &self.rule_values {
                let set = &mut groups[rv.group].angle_sets_mut()[rv.index];
                if !set.flush_send_buffers() {
                    received = false;
                }
                if !set.receive_delayed_data(&self.comm)? {
                    received = false;
                }
            }
            if received {
                break;
            }
        }

        self.angle_agg.lag_opposing_reflecting_flux();
        Ok(())
    }

    /// Global max relative change of the delayed angular flux at the end of
    /// the last sweep.
    pub fn delayed_psi_norm(&self) -> f64 {
        self.angle_agg.delayed_psi_norm(&self.comm)
    }
}
