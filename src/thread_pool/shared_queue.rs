use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, instrument};

use super::ThreadPool;
use crate::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool implemented with a shared job queue (i.e. channel).
///
/// The pool itself is the single producer of a crossbeam MPMC channel and every worker is a
/// consumer. Jobs here are dispatcher calls, which block on network I/O against the backends
/// for as long as the backend takes to answer.
///
/// If a job panics, its worker is replaced by a fresh one. Workers exit once the pool is
/// dropped and the queue has drained.
pub struct SharedQueueThreadPool {
    tx: Sender<Job>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for id in 0..threads {
            let worker = Worker { id, rx: rx.clone() };
            thread::Builder::new()
                .name(format!("dbcmp-worker-{}", id))
                .spawn(move || run_jobs(worker))?;
        }
        Ok(SharedQueueThreadPool { tx })
    }

    /// Queues a job. If every worker is gone the job is dropped and the failure logged.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            error!("no worker left to run the job");
        }
    }
}

/// The receiving end of the queue owned by one worker thread. Responsible for restarting the
/// worker when a job panics.
#[derive(Clone, Debug)]
struct Worker {
    id: u32,
    rx: Receiver<Job>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        if thread::panicking() {
            debug!("worker {} panicked, starting a replacement", self.id);
            let worker = self.clone();
            let spawned = thread::Builder::new()
                .name(format!("dbcmp-worker-{}", self.id))
                .spawn(move || run_jobs(worker));
            if let Err(e) = spawned {
                error!("failed to respawn worker {}: {}", self.id, e);
            }
        }
    }
}

#[instrument(skip(worker), fields(worker = worker.id))]
fn run_jobs(worker: Worker) {
    while let Ok(job) = worker.rx.recv() {
        debug!("running a job");
        job();
    }
    debug!("queue closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    #[test]
    fn runs_every_job() {
        let pool = SharedQueueThreadPool::new(3).unwrap();
        let (tx, rx) = bounded(10);
        for i in 0..10 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap());
        }
        let mut seen: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn survives_a_panicking_job() {
        let pool = SharedQueueThreadPool::new(1).unwrap();
        pool.spawn(|| panic!("job failed"));
        let (tx, rx) = bounded(1);
        pool.spawn(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
