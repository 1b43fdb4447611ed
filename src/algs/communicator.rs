//! Thin façade over intra-process (thread-per-rank) or inter-process (MPI)
//! message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). All
//! handles are waitable and testable: the sweep engine busy-polls receive
//! handles with [`Test::test`] and only calls [`Wait::wait`] once a handle has
//! reported completion (or when blocking is explicitly acceptable, as in
//! setup-time exchanges).
//!
//! Messages between a given `(source, destination, tag)` triple are delivered
//! in send order. A receive is matched when its handle completes, not when it
//! is posted.
//!
//! Collectives (`barrier`, `broadcast_bytes`, `gather_bytes`, the all-reduces)
//! have default implementations on top of point-to-point messages using the
//! reserved [`tags::COLLECTIVE`] block; backends with native collectives
//! override them.

use crate::algs::wire::{cast_slice, decode_pod_vec, WireCount};
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Message tag wrapper; the sweep layer reserves disjoint blocks of tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(v: u16) -> Self {
        Self(v)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// First tag of the block.
    pub const fn base(self) -> u16 {
        self.0
    }
    /// `k`-th tag of the block, if it does not wrap.
    pub fn offset(self, k: usize) -> Option<u16> {
        u16::try_from(k).ok().and_then(|k| self.0.checked_add(k))
    }
}

/// Reserved tag blocks.
pub mod tags {
    use super::CommTag;
    /// FLUDS beta pass: compact cell views (size, then payload).
    pub const BETA_PASS: CommTag = CommTag(101);
    /// Sweep angular-flux messages start here.
    pub const SWEEP_BASE: CommTag = CommTag(0x0200);
    /// Default collectives (size, then payload).
    pub const COLLECTIVE: CommTag = CommTag(0xFF00);
    /// Number of sweep tags below the collective block.
    pub const SWEEP_TAG_CAPACITY: usize = (COLLECTIVE.0 - SWEEP_BASE.0) as usize;
}

/// Non-blocking communication interface.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Test;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + Test;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive of at most `len` bytes; longer messages are truncated.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// Broadcast `data` from `root`; non-root ranks pass an empty vector and
    /// receive the root's payload. Size goes first, then the payload.
    fn broadcast_bytes(&self, root: usize, data: Vec<u8>) -> Vec<u8> {
        if self.size() <= 1 {
            return data;
        }
        let size_tag = tags::COLLECTIVE.base();
        let data_tag = size_tag + 1;
        if self.rank() == root {
            let count = [WireCount::new(data.len())];
            let mut pending = Vec::with_capacity(2 * self.size());
            for p in (0..self.size()).filter(|&p| p != root) {
                pending.push(self.isend(p, size_tag, cast_slice(&count)));
                pending.push(self.isend(p, data_tag, &data));
            }
            for h in pending {
                let _ = h.wait();
            }
            data
        } else {
            let len = self
                .irecv(root, size_tag, std::mem::size_of::<WireCount>())
                .wait()
                .and_then(|raw| decode_pod_vec::<WireCount>(&raw).ok())
                .and_then(|c| c.first().map(WireCount::get))
                .unwrap_or(0);
            self.irecv(root, data_tag, len).wait().unwrap_or_default()
        }
    }

    /// Gather one byte vector per rank on `root` (in rank order).
    fn gather_bytes(&self, root: usize, data: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        if self.size() <= 1 {
            return Some(vec![data]);
        }
        let size_tag = tags::COLLECTIVE.base() + 2;
        let data_tag = size_tag + 1;
        if self.rank() == root {
            let mut out = Vec::with_capacity(self.size());
            for p in 0..self.size() {
                if p == root {
                    out.push(data.clone());
                    continue;
                }
                let len = self
                    .irecv(p, size_tag, std::mem::size_of::<WireCount>())
                    .wait()
                    .and_then(|raw| decode_pod_vec::<WireCount>(&raw).ok())
                    .and_then(|c| c.first().map(WireCount::get))
                    .unwrap_or(0);
                out.push(self.irecv(p, data_tag, len).wait().unwrap_or_default());
            }
            Some(out)
        } else {
            let count = [WireCount::new(data.len())];
            let a = self.isend(root, size_tag, cast_slice(&count));
            let b = self.isend(root, data_tag, &data);
            let _ = a.wait();
            let _ = b.wait();
            None
        }
    }

    fn barrier(&self) {
        if self.size() <= 1 {
            return;
        }
        let _ = self.gather_bytes(0, Vec::new());
        let _ = self.broadcast_bytes(0, Vec::new());
    }

    fn allreduce_max_f64(&self, value: f64) -> f64 {
        let gathered = self.gather_bytes(0, value.to_le_bytes().to_vec());
        let reduced = gathered.map(|all| {
            all.iter()
                .filter_map(|b| b.as_slice().try_into().ok().map(f64::from_le_bytes))
                .fold(f64::NEG_INFINITY, f64::max)
        });
        let out = self.broadcast_bytes(0, reduced.unwrap_or_default().to_le_bytes().to_vec());
        out.as_slice()
            .try_into()
            .map(f64::from_le_bytes)
            .unwrap_or(value)
    }

    fn allreduce_sum_u64(&self, value: u64) -> u64 {
        let gathered = self.gather_bytes(0, value.to_le_bytes().to_vec());
        let reduced = gathered.map(|all| {
            all.iter()
                .filter_map(|b| b.as_slice().try_into().ok().map(u64::from_le_bytes))
                .sum::<u64>()
        });
        let out = self.broadcast_bytes(0, reduced.unwrap_or_default().to_le_bytes().to_vec());
        out.as_slice()
            .try_into()
            .map(u64::from_le_bytes)
            .unwrap_or(value)
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking completion check (MPI_Test-like).
pub trait Test {
    /// True once the operation has completed; never blocks.
    fn test(&mut self) -> bool;
}

/// Compile-time no-op comm for pure serial runs: rank 0 of 1.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Test for () {
    fn test(&mut self) -> bool {
        true
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}
}

// --- RayonComm: intra-process, one thread per simulated rank ---
type Key = (usize, usize, u16); // (src, dst, tag)
type Mailbox = DashMap<Key, VecDeque<Bytes>>;

static MAILBOX: Lazy<Arc<Mailbox>> = Lazy::new(|| Arc::new(DashMap::new()));

/// In-process communicator: every rank is a handle sharing one mailbox.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl RayonComm {
    /// Handle on the process-wide mailbox. Tests sharing it must use
    /// disjoint tags.
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: Arc::clone(&*MAILBOX),
        }
    }

    /// `size` handles on a fresh, isolated mailbox (ranks `0..size`).
    pub fn world(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(DashMap::new());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }
}

impl fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
    len: usize,
    data: Option<Vec<u8>>,
}

impl Test for LocalHandle {
    fn test(&mut self) -> bool {
        if self.data.is_none() {
            if let Some(mut queue) = self.mailbox.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    let n = bytes.len().min(self.len);
                    self.data = Some(bytes[..n].to_vec());
                }
            }
        }
        self.data.is_some()
    }
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        while !self.test() {
            std::thread::yield_now();
        }
        self.data.take()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        self.mailbox
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> LocalHandle {
        LocalHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
            len,
            data: None,
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Test, Wait};
    use mpi::collective::SystemOperation;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::sync::Arc;

    pub struct MpiComm {
        world: Arc<SimpleCommunicator>,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                world: Arc::new(world),
                rank,
                size,
            }
        }

        pub fn world(&self) -> &SimpleCommunicator {
            &self.world
        }
    }

    /// Non-blocking send owning its payload until completion.
    pub struct MpiSendHandle {
        request: Option<Request<'static, [u8], StaticScope>>,
        buffer: *mut [u8],
    }

    impl MpiSendHandle {
        fn release(&mut self) {
            // SAFETY: `buffer` came from `Box::into_raw` in `isend` and the
            // request that borrowed it has completed.
            unsafe { drop(Box::from_raw(self.buffer)) };
        }
    }

    impl Test for MpiSendHandle {
        fn test(&mut self) -> bool {
            match self.request.take() {
                None => true,
                Some(req) => match req.test() {
                    Ok(_) => {
                        self.release();
                        true
                    }
                    Err(req) => {
                        self.request = Some(req);
                        false
                    }
                },
            }
        }
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.request.take() {
                req.wait();
                self.release();
            }
            None
        }
    }

    /// Receive matched lazily with a non-blocking probe.
    pub struct MpiRecvHandle {
        world: Arc<SimpleCommunicator>,
        peer: i32,
        tag: i32,
        len: usize,
        data: Option<Vec<u8>>,
    }

    impl Test for MpiRecvHandle {
        fn test(&mut self) -> bool {
            if self.data.is_none() {
                let src = self.world.process_at_rank(self.peer);
                if let Some((msg, _status)) = src.immediate_matched_probe_with_tag(self.tag) {
                    let (mut data, _status) = msg.matched_receive_vec::<u8>();
                    data.truncate(self.len);
                    self.data = Some(data);
                }
            }
            self.data.is_some()
        }
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if self.data.is_none() {
                let src = self.world.process_at_rank(self.peer);
                let (msg, _status) = src.matched_probe_with_tag(self.tag);
                let (mut data, _status) = msg.matched_receive_vec::<u8>();
                data.truncate(self.len);
                self.data = Some(data);
            }
            self.data.take()
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let buffer: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation stays alive until the handle releases it
            // after the request completes.
            let payload: &'static [u8] = unsafe { &*buffer };
            let request = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, payload, tag as i32);
            MpiSendHandle {
                request: Some(request),
                buffer,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> MpiRecvHandle {
            MpiRecvHandle {
                world: Arc::clone(&self.world),
                peer: peer as i32,
                tag: tag as i32,
                len,
                data: None,
            }
        }

        fn broadcast_bytes(&self, root: usize, data: Vec<u8>) -> Vec<u8> {
            let root_process = self.world.process_at_rank(root as i32);
            let mut len = data.len() as u64;
            root_process.broadcast_into(&mut len);
            let mut buf = if self.rank == root {
                data
            } else {
                vec![0u8; len as usize]
            };
            root_process.broadcast_into(&mut buf[..]);
            buf
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn allreduce_max_f64(&self, value: f64) -> f64 {
            let mut out = 0.0f64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::max());
            out
        }

        fn allreduce_sum_u64(&self, value: u64) -> u64 {
            let mut out = 0u64;
            self.world
                .all_reduce_into(&value, &mut out, SystemOperation::sum());
            out
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
