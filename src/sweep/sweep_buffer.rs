//! Message plumbing of one angle set.
//!
//! Each neighbour location's face data (`face_dofs × groups × angles` values)
//! is split into messages no larger than the eager limit. Message `m` of angle
//! set `id` travels on tag `SWEEP_BASE + max_messages * id + m`, where
//! `max_messages` is agreed by all ranks before the first sweep so tags never
//! collide between angle sets.
//!
//! Tags are `u16`, so `num_angle_sets * max_messages` is limited to
//! [`tags::SWEEP_TAG_CAPACITY`] (64768). For example 512 angles with 8 group
//! subsets need `max_messages <= 15`; raise the eager limit to get there.

use crate::algs::communicator::{tags, Communicator, Test, Wait};
use crate::algs::wire::{cast_slice, decode_pod_vec};
use crate::sweep::fluds::Fluds;
use crate::sweep_error::SweepError;
use std::mem::size_of;

/// Angle set `angle_set_id` uses tags up to
/// `SWEEP_BASE + max_num_messages * (angle_set_id + 1) - 1`, which must stay
/// inside [`tags::SWEEP_TAG_CAPACITY`].
pub fn check_tag_space(angle_set_id: usize, max_num_messages: usize) -> Result<(), SweepError> {
    let needed = max_num_messages.saturating_mul(angle_set_id.saturating_add(1));
    if needed > tags::SWEEP_TAG_CAPACITY {
        return Err(SweepError::TagOverflow {
            angle_set: angle_set_id,
            messages: max_num_messages,
            capacity: tags::SWEEP_TAG_CAPACITY,
        });
    }
    Ok(())
}

/// Split of one location's data into messages, as `(offset, len)` blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageLayout {
    pub total: usize,
    pub blocks: Vec<(usize, usize)>,
}

impl MessageLayout {
    /// Small payloads go as one message per angle; larger ones are cut to
    /// the eager limit. The last block carries the remainder.
    pub fn new(total: usize, num_angles: usize, eager_limit_bytes: usize) -> Self {
        if total == 0 {
            return Self {
                total,
                blocks: Vec::new(),
            };
        }
        let bytes = total * size_of::<f64>();
        let count = if bytes <= eager_limit_bytes {
            num_angles
        } else {
            bytes.div_ceil(eager_limit_bytes.max(1))
        };
        let count = count.min(total).max(1);
        let size = total.div_ceil(count);
        let count = total.div_ceil(size);
        let blocks = (0..count)
            .map(|m| (m * size, size.min(total - m * size)))
            .collect();
        Self { total, blocks }
    }

    pub fn num_messages(&self) -> usize {
        self.blocks.len()
    }
}

/// Outstanding receives from one list of locations.
struct PendingReceives<H> {
    handles: Vec<Vec<Option<H>>>,
    posted: bool,
    done: bool,
}

impl<H> PendingReceives<H> {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
            posted: false,
            done: false,
        }
    }

    fn reset(&mut self) {
        self.handles.clear();
        self.posted = false;
        self.done = false;
    }
}

/// A message that arrived: `(location index, offset, values)`.
type Arrival = (usize, usize, Vec<f64>);

pub struct SweepBuffer<C: Communicator> {
    angle_set_id: usize,
    max_num_messages: usize,
    preloc_layouts: Vec<MessageLayout>,
    delayed_preloc_layouts: Vec<MessageLayout>,
    deploc_layouts: Vec<MessageLayout>,
    upstream: PendingReceives<C::RecvHandle>,
    delayed: PendingReceives<C::RecvHandle>,
    sends: Vec<C::SendHandle>,
}

impl<C: Communicator> SweepBuffer<C> {
    pub fn new(angle_set_id: usize, fluds: &Fluds, eager_limit_bytes: usize) -> Self {
        let per_dof = fluds.num_groups() * fluds.num_angles();
        let n = fluds.num_angles();
        let layouts = |counts: &[usize]| -> Vec<MessageLayout> {
            counts
                .iter()
                .map(|&c| MessageLayout::new(c * per_dof, n, eager_limit_bytes))
                .collect()
        };
        let common = fluds.common();
        let preloc_layouts = layouts(common.preloc_face_dof_count());
        let delayed_preloc_layouts = layouts(common.delayed_preloc_face_dof_count());
        let deploc_layouts = layouts(common.deploc_face_dof_count());
        let max_num_messages = preloc_layouts
            .iter()
            .chain(&delayed_preloc_layouts)
            .chain(&deploc_layouts)
            .map(MessageLayout::num_messages)
            .max()
            .unwrap_or(0);
        Self {
            angle_set_id,
            max_num_messages,
            preloc_layouts,
            delayed_preloc_layouts,
            deploc_layouts,
            upstream: PendingReceives::new(),
            delayed: PendingReceives::new(),
            sends: Vec::new(),
        }
    }

    pub fn max_buffer_messages(&self) -> usize {
        self.max_num_messages
    }

    /// Adopt the globally agreed message count; fails when the highest tag
    /// of this angle set would leave the sweep tag block.
    pub fn set_max_buffer_messages(&mut self, max_num_messages: usize) -> Result<(), SweepError> {
        check_tag_space(self.angle_set_id, max_num_messages)?;
        self.max_num_messages = max_num_messages;
        Ok(())
    }

    fn tag(&self, m: usize) -> u16 {
        // validated by set_max_buffer_messages
        tags::SWEEP_BASE.base() + (self.max_num_messages * self.angle_set_id + m) as u16
    }

    pub fn preloc_layouts(&self) -> &[MessageLayout] {
        &self.preloc_layouts
    }

    pub fn deploc_layouts(&self) -> &[MessageLayout] {
        &self.deploc_layouts
    }

    fn post(&self, layouts: &[MessageLayout], locs: &[usize], comm: &C) -> Vec<Vec<Option<C::RecvHandle>>> {
        layouts
            .iter()
            .zip(locs)
            .map(|(layout, &loc)| {
                layout
                    .blocks
                    .iter()
                    .enumerate()
                    .map(|(m, &(_, len))| Some(comm.irecv(loc, self.tag(m), len * size_of::<f64>())))
                    .collect()
            })
            .collect()
    }

    /// Test every outstanding handle once; collect what arrived.
    fn poll(
        handles: &mut [Vec<Option<C::RecvHandle>>],
        layouts: &[MessageLayout],
        locs: &[usize],
    ) -> Result<(bool, Vec<Arrival>), SweepError> {
        let mut all_done = true;
        let mut arrivals = Vec::new();
        for (p, per_loc) in handles.iter_mut().enumerate() {
            for (m, slot) in per_loc.iter_mut().enumerate() {
                let Some(h) = slot.as_mut() else { continue };
                if !h.test() {
                    all_done = false;
                    continue;
                }
                let raw = slot
                    .take()
                    .and_then(Wait::wait)
                    .ok_or_else(|| SweepError::CommError {
                        neighbor: locs[p],
                        source: "sweep message vanished after completion".into(),
                    })?;
                let (offset, len) = layouts[p].blocks[m];
                let values = decode_pod_vec::<f64>(&raw)?;
                if values.len() != len {
                    return Err(SweepError::WireDecode(format!(
                        "sweep message from {} carries {} values, expected {len}",
                        locs[p],
                        values.len()
                    )));
                }
                arrivals.push((p, offset, values));
            }
        }
        Ok((all_done, arrivals))
    }

    /// Non-blocking: post receives on first call, then copy whatever has
    /// arrived into the predecessor buffers. True once everything is in.
    pub fn receive_upstream_psi(
        &mut self,
        fluds: &mut Fluds,
        locs: &[usize],
        comm: &C,
    ) -> Result<bool, SweepError> {
        if self.upstream.done {
            return Ok(true);
        }
        if !self.upstream.posted {
            self.upstream.handles = self.post(&self.preloc_layouts, locs, comm);
            self.upstream.posted = true;
        }
        let (done, arrivals) = Self::poll(&mut self.upstream.handles, &self.preloc_layouts, locs)?;
        for (p, offset, values) in arrivals {
            fluds.allocate_prelocal(p);
            fluds.preloc_outgoing_psi_mut(p)[offset..offset + values.len()].copy_from_slice(&values);
        }
        self.upstream.done = done;
        Ok(done)
    }

    /// Post every message of every downstream buffer, direct successors
    /// first, then delayed ones.
    pub fn send_downstream_psi(&mut self, fluds: &Fluds, successors: &[usize], comm: &C) {
        for ((layout, &loc), buf) in self
            .deploc_layouts
            .iter()
            .zip(successors)
            .zip(fluds.deploc_outgoing_psi())
        {
            for (m, &(offset, len)) in layout.blocks.iter().enumerate() {
                let h = comm.isend(loc, self.tag(m), cast_slice(&buf[offset..offset + len]));
                self.sends.push(h);
            }
        }
    }

    /// Test pending sends; true when none remain.
    pub fn flush_send_buffers(&mut self) -> bool {
        self.sends.retain_mut(|h| !h.test());
        self.sends.is_empty()
    }

    /// Non-blocking receive of the data from delayed predecessors into the
    /// "new" delayed buffers. True once everything is in.
    pub fn receive_delayed_data(
        &mut self,
        fluds: &mut Fluds,
        locs: &[usize],
        comm: &C,
    ) -> Result<bool, SweepError> {
        if self.delayed.done {
            return Ok(true);
        }
        if !self.delayed.posted {
            self.delayed.handles = self.post(&self.delayed_preloc_layouts, locs, comm);
            self.delayed.posted = true;
        }
        let (done, arrivals) =
            Self::poll(&mut self.delayed.handles, &self.delayed_preloc_layouts, locs)?;
        let bufs = fluds.delayed_preloc_outgoing_psi_mut();
        for (p, offset, values) in arrivals {
            bufs[p][offset..offset + values.len()].copy_from_slice(&values);
        }
        self.delayed.done = done;
        Ok(done)
    }

    /// Forget per-sweep receive state; sends must already be flushed.
    pub fn reset(&mut self) {
        self.upstream.reset();
        self.delayed.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_split_per_angle() {
        let l = MessageLayout::new(12, 4, 32000);
        assert_eq!(l.blocks, vec![(0, 3), (3, 3), (6, 3), (9, 3)]);
    }

    #[test]
    fn large_payloads_respect_eager_limit() {
        // 10 values = 80 bytes over a 24-byte limit: 4 messages of 3, last of 1
        let l = MessageLayout::new(10, 1, 24);
        assert_eq!(l.blocks, vec![(0, 3), (3, 3), (6, 3), (9, 1)]);
        assert!(l.blocks.iter().all(|&(_, n)| n * 8 <= 24));
    }

    #[test]
    fn tag_space_limits_sets_times_messages() {
        // 4096 sets: 15 messages fit, 16 do not
        assert!(check_tag_space(4095, 15).is_ok());
        assert!(matches!(
            check_tag_space(4095, 16),
            Err(SweepError::TagOverflow {
                angle_set: 4095,
                messages: 16,
                capacity: 64768
            })
        ));
        assert!(check_tag_space(0, tags::SWEEP_TAG_CAPACITY).is_ok());
        assert!(check_tag_space(usize::MAX, 2).is_err());
    }

    #[test]
    fn message_count_never_exceeds_values() {
        let l = MessageLayout::new(2, 8, 32000);
        assert_eq!(l.num_messages(), 2);
        assert!(MessageLayout::new(0, 8, 32000).blocks.is_empty());
    }
}
