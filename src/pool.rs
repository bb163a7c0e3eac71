//! Fixed-size worker pool draining a bounded work queue
//!
//! `submit` blocks when the queue is full. That block is the only backpressure in the
//! sweep: if FFTs or writes fall behind acquisition, the next tune/read simply waits.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle of a submitted task
pub struct TaskHandle<T> {
    result: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finished and take its output
    pub fn wait(self) -> Result<T> {
        match self.result.recv() {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(panic)) => Err(Error::TaskFailed(panic_message(&*panic))),
            Err(_) => Err(Error::TaskFailed("task dropped before completion".to_owned())),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_owned()
    }
}

pub struct BoundedExecutor {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    max_queue_size: Option<usize>,
    high_water: Arc<AtomicUsize>,
}

impl BoundedExecutor {
    /// `max_workers == 0` uses the available parallelism. `max_queue_size == 0` means
    /// ten slots per worker, a negative size means unbounded.
    pub fn new(name: &str, max_workers: usize, max_queue_size: i64) -> Result<Self> {
        let max_workers = if max_workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            max_workers
        };
        let max_queue_size = match max_queue_size {
            0 => Some(max_workers * 10),
            n if n < 0 => None,
            n => Some(n as usize),
        };
        let (sender, receiver) = match max_queue_size {
            Some(cap) => bounded::<Job>(cap),
            None => unbounded::<Job>(),
        };
        let workers = (0..max_workers)
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        for job in receiver {
                            job();
                        }
                    })
                    .map_err(|e| Error::TaskFailed(format!("could not spawn {name} worker: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "{} executor: {} workers, queue size {:?}",
            name, max_workers, max_queue_size
        );
        Ok(Self {
            name: name.to_owned(),
            sender: Some(sender),
            workers,
            max_queue_size,
            high_water: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Queue `task`, blocking while the queue is full
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            let out = panic::catch_unwind(AssertUnwindSafe(task));
            // Nobody waiting is fine
            let _ = tx.send(out);
        });
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                error!("{} executor has no workers left, task dropped", self.name);
            }
            self.high_water.fetch_max(sender.len(), Ordering::Relaxed);
        }
        TaskHandle { result: rx }
    }

    pub fn max_workers(&self) -> usize {
        self.workers.len()
    }

    /// `None` when unbounded
    pub fn max_queue_size(&self) -> Option<usize> {
        self.max_queue_size
    }

    /// Largest number of queued, not yet started tasks seen right after a submit
    pub fn max_queue_size_reached(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        // Closing the channel lets workers finish what's queued and exit
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("{} worker exited abnormally", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_results_come_back() {
        let pool = BoundedExecutor::new("test", 4, 0).unwrap();
        assert_eq!(pool.max_workers(), 4);
        assert_eq!(pool.max_queue_size(), Some(40));
        let handles: Vec<_> = (0..32u64).map(|i| pool.submit(move || i * i)).collect();
        let results: Vec<u64> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, (0..32u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_worker_preserves_order() {
        let pool = BoundedExecutor::new("ordered", 1, -1).unwrap();
        assert_eq!(pool.max_queue_size(), None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let log = log.clone();
                pool.submit(move || {
                    // Earlier tasks take longer; order must still hold
                    thread::sleep(Duration::from_micros(200 - i * 10));
                    log.lock().unwrap().push(i);
                })
            })
            .collect();
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_submit_blocks_when_full() {
        let pool = BoundedExecutor::new("tiny", 1, 2).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        // Occupies the only worker until the gate opens
        let first = pool.submit(move || gate_rx.recv().is_ok());
        thread::sleep(Duration::from_millis(20));
        let _a = pool.submit(|| ());
        let _b = pool.submit(|| ());
        assert_eq!(pool.max_queue_size_reached(), 2);

        let blocked = Arc::new(AtomicUsize::new(0));
        let flag = blocked.clone();
        let pool = Arc::new(pool);
        let submitter = {
            let pool = pool.clone();
            thread::spawn(move || {
                pool.submit(|| ()).wait().unwrap();
                flag.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(blocked.load(Ordering::SeqCst), 0);
        gate_tx.send(()).unwrap();
        submitter.join().unwrap();
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
        assert!(first.wait().unwrap());
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let pool = BoundedExecutor::new("panicky", 1, 0).unwrap();
        let handle = pool.submit(|| -> u32 { panic!("boom") });
        assert!(matches!(handle.wait(), Err(Error::TaskFailed(msg)) if msg == "boom"));
        // Worker survives
        assert_eq!(pool.submit(|| 7).wait().unwrap(), 7);
    }
}
