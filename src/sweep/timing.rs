//! Timed sweep events.
//!
//! The scheduler brackets every sweep with [`SWEEP_TIMING`] and every chunk
//! execution with [`SWEEP_CHUNK_TIMING`]. Events go to an injected
//! [`SweepEvents`] sink; [`LogEvents`] forwards them to the `log` facade and
//! keeps running totals so callers can report average times.

use hashbrown::HashMap;
use std::time::{Duration, Instant};

pub const SWEEP_TIMING: &str = "Sweep Timing";
pub const SWEEP_CHUNK_TIMING: &str = "Sweep Chunk Only Timing";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Begin,
    End,
}

pub trait SweepEvents {
    fn log_event(&mut self, tag: &str, kind: EventKind);
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl SweepEvents for NoEvents {
    fn log_event(&mut self, _tag: &str, _kind: EventKind) {}
}

#[derive(Debug, Default)]
struct Accumulator {
    open: Option<Instant>,
    total: Duration,
    count: u64,
}

/// Logs events at debug level and accumulates durations per tag.
#[derive(Debug, Default)]
pub struct LogEvents {
    tags: HashMap<String, Accumulator>,
}

impl LogEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed begin/end pairs for `tag`.
    pub fn count(&self, tag: &str) -> u64 {
        self.tags.get(tag).map_or(0, |a| a.count)
    }

    pub fn total_duration(&self, tag: &str) -> Duration {
        self.tags.get(tag).map_or(Duration::ZERO, |a| a.total)
    }

    pub fn average_duration(&self, tag: &str) -> Option<Duration> {
        let acc = self.tags.get(tag)?;
        (acc.count > 0).then(|| acc.total / acc.count as u32)
    }
}

impl SweepEvents for LogEvents {
    fn log_event(&mut self, tag: &str, kind: EventKind) {
        let acc = self.tags.entry_ref(tag).or_default();
        match kind {
            EventKind::Begin => {
                log::trace!("{tag}: begin");
                acc.open = Some(Instant::now());
            }
            EventKind::End => {
                if let Some(start) = acc.open.take() {
                    let dt = start.elapsed();
                    acc.total += dt;
                    acc.count += 1;
                    log::debug!("{tag}: {:.3} ms", dt.as_secs_f64() * 1e3);
                } else {
                    log::warn!("{tag}: end event without matching begin");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_counted() {
        let mut ev = LogEvents::new();
        ev.log_event(SWEEP_TIMING, EventKind::Begin);
        ev.log_event(SWEEP_TIMING, EventKind::End);
        ev.log_event(SWEEP_TIMING, EventKind::End);
        assert_eq!(ev.count(SWEEP_TIMING), 1);
        assert!(ev.average_duration(SWEEP_TIMING).is_some());
        assert_eq!(ev.average_duration(SWEEP_CHUNK_TIMING), None);
    }
}
