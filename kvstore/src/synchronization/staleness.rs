use std::{
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use comms::specs::ConsistencySpec;
use log::debug;

use crate::Result;

/// The progress table of a bounded staleness cluster.
///
/// Each rank publishes how many iterations it completed, updates only move forward.
#[derive(Debug)]
pub struct StalenessClock {
    progress: Box<[AtomicU64]>,
}

impl StalenessClock {
    pub fn new(num_workers: usize) -> Self {
        Self {
            progress: (0..num_workers).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Records that `rank` completed `iteration` iterations.
    ///
    /// # Returns
    /// `false` if `rank` isn't part of the table.
    pub fn report(&self, rank: usize, iteration: u64) -> bool {
        match self.progress.get(rank) {
            Some(progress) => {
                progress.fetch_max(iteration, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// The least amount of completed iterations across ranks.
    pub fn min(&self) -> u64 {
        self.progress
            .iter()
            .map(|p| p.load(Ordering::Acquire))
            .min()
            .unwrap_or_default()
    }
}

/// Decides whether a worker is a straggler that must not wait on the others.
pub trait StragglerPolicy: Send + Sync {
    /// # Arguments
    /// * `rank` - The worker about to wait.
    /// * `iteration` - The iteration it's about to start.
    fn is_straggler(&self, rank: usize, iteration: u64) -> bool;
}

impl<F> StragglerPolicy for F
where
    F: Fn(usize, u64) -> bool + Send + Sync,
{
    fn is_straggler(&self, rank: usize, iteration: u64) -> bool {
        self(rank, iteration)
    }
}

/// Never declares anyone a straggler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStraggler;

impl StragglerPolicy for NeverStraggler {
    fn is_straggler(&self, _rank: usize, _iteration: u64) -> bool {
        false
    }
}

/// How a staleness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleWait {
    /// The worker was within the bound, possibly after polling.
    Proceeded,
    /// The wait ceiling was reached, the worker proceeds anyway.
    TimedOut,
    /// The worker is a straggler and didn't wait.
    Bypassed,
}

/// Holds a worker back while it's more than `max_stale` iterations ahead of the slowest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessGate {
    max_stale: u64,
    poll_interval: Duration,
    max_wait: Duration,
}

impl StalenessGate {
    /// Creates a new `StalenessGate`.
    ///
    /// # Arguments
    /// * `max_stale` - How many iterations a worker may run ahead.
    /// * `poll_interval` - The pause between progress queries.
    /// * `max_wait` - The total wait after which the worker proceeds anyway.
    pub fn new(max_stale: u64, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            max_stale,
            poll_interval,
            max_wait,
        }
    }

    /// Creates the gate of a bounded staleness consistency, `None` for any other.
    pub fn from_spec(spec: &ConsistencySpec) -> Option<Self> {
        match *spec {
            ConsistencySpec::BoundedStaleness {
                max_stale,
                poll_interval_ms,
                max_wait_ms,
            } => Some(Self::new(
                max_stale,
                Duration::from_millis(poll_interval_ms),
                Duration::from_millis(max_wait_ms),
            )),
            _ => None,
        }
    }

    pub fn max_stale(&self) -> u64 {
        self.max_stale
    }

    /// Whether a worker starting `iteration` may proceed given the slowest progress.
    pub fn may_proceed(&self, iteration: u64, min_progress: u64) -> bool {
        iteration.saturating_sub(min_progress) <= self.max_stale
    }

    /// Polls `min_progress` until the worker may start `iteration` or the ceiling is hit.
    ///
    /// # Arguments
    /// * `iteration` - The iteration about to start.
    /// * `min_progress` - Queries the least completed iteration across workers.
    ///
    /// # Returns
    /// How the wait ended or the query's error.
    pub fn wait<F>(&self, iteration: u64, mut min_progress: F) -> Result<StaleWait>
    where
        F: FnMut() -> Result<u64>,
    {
        let start = Instant::now();

        loop {
            let min = min_progress()?;
            if self.may_proceed(iteration, min) {
                return Ok(StaleWait::Proceeded);
            }

            if start.elapsed() >= self.max_wait {
                debug!(iteration = iteration, min_progress = min; "staleness wait timed out");
                return Ok(StaleWait::TimedOut);
            }

            thread::sleep(self.poll_interval);
        }
    }
}
