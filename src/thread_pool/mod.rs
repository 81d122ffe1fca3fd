//! Worker pools that run the blocking dispatcher calls off the HTTP runtime.
use crate::Result;

mod shared_queue;

pub use self::shared_queue::SharedQueueThreadPool;

/// A pool of threads that jobs can be handed to.
pub trait ThreadPool {
    /// creates a pool with `threads` workers
    ///
    /// # Errors
    /// returns an error if a worker thread could not be started
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// queues `job` to run on one of the workers
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}
