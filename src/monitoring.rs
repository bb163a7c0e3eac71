//! Runtime statistics of a sweep: how far it got, how full the work queues ran
//! and how often the receiver dropped samples.

use std::time::Duration;

use tracing::debug;

use crate::pool::BoundedExecutor;

/// Occupancy of one executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub workers: usize,
    /// `None` when the queue is unbounded
    pub max_queue_size: Option<usize>,
    pub max_queue_size_reached: usize,
}

impl QueueStats {
    pub fn of(executor: &BoundedExecutor) -> Self {
        Self {
            workers: executor.max_workers(),
            max_queue_size: executor.max_queue_size(),
            max_queue_size_reached: executor.max_queue_size_reached(),
        }
    }

    fn limit(&self) -> String {
        self.max_queue_size
            .map_or_else(|| "unbounded".to_owned(), |n| n.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepStats {
    pub runs: usize,
    pub hops: usize,
    pub buffer_overflows: u64,
    pub psd: QueueStats,
    pub writer: QueueStats,
    pub elapsed: Duration,
}

impl SweepStats {
    pub fn log(&self) {
        debug!("Number of buffer overflow errors: {}", self.buffer_overflows);
        debug!("PSD worker threads: {}", self.psd.workers);
        debug!(
            "Max. PSD queue size: {} / {}",
            self.psd.max_queue_size_reached,
            self.psd.limit()
        );
        debug!("Writer worker threads: {}", self.writer.workers);
        debug!(
            "Max. Writer queue size: {} / {}",
            self.writer.max_queue_size_reached,
            self.writer.limit()
        );
        debug!(
            "{} runs, {} hops in {:.3} s",
            self.runs,
            self.hops,
            self.elapsed.as_secs_f64()
        );
    }
}
