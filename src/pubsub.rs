//! Subscription handles for the backends that offer publish/subscribe.
//!
//! A [`Subscription`] receives the messages of one channel until it is cancelled or dropped.
//! Receiving is always bounded: callers wait with [`Subscription::recv_timeout`] or poll with
//! [`Subscription::try_recv`], never block indefinitely.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, error};

use crate::{DbError, Result};

/// A live subscription to one pub/sub channel.
pub struct Subscription {
    channel: String,
    rx: Receiver<String>,
    cancelled: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl Subscription {
    /// wraps the receiving end of a channel. `listener`, when present, is the background thread
    /// feeding `rx`; it is expected to stop once `cancelled` is set.
    pub fn new(
        channel: impl Into<String>,
        rx: Receiver<String>,
        cancelled: Arc<AtomicBool>,
        listener: Option<JoinHandle<()>>,
    ) -> Self {
        Subscription {
            channel: channel.into(),
            rx,
            cancelled,
            listener,
        }
    }

    /// name of the subscribed channel
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// waits at most `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout, and an error if the subscription was cancelled or its
    /// listener went away.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<String>> {
        if self.is_cancelled() {
            return Err(DbError::StringErr(format!("subscription to {} was cancelled", self.channel)));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// returns the next message if one is already waiting
    pub fn try_recv(&self) -> Result<Option<String>> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// stops the listener; any further receive fails
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                error!("listener thread for {} panicked", self.channel);
            }
        }
        debug!("subscription to {} cancelled", self.channel);
    }

    /// whether [`Subscription::cancel`] has run
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> DbError {
        DbError::StringErr(format!("listener for {} disconnected", self.channel))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.is_cancelled() {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn timeout_yields_none() {
        let (_tx, rx) = unbounded();
        let sub = Subscription::new("c", rx, Arc::new(AtomicBool::new(false)), None);
        assert_eq!(sub.recv_timeout(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn delivers_then_reports_disconnect() {
        let (tx, rx) = unbounded();
        let sub = Subscription::new("c", rx, Arc::new(AtomicBool::new(false)), None);
        tx.send("hello".to_string()).unwrap();
        drop(tx);
        assert_eq!(sub.try_recv().unwrap().as_deref(), Some("hello"));
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn cancel_stops_listener_thread() {
        let (tx, rx) = unbounded::<String>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let listener = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            drop(tx);
        });
        let mut sub = Subscription::new("c", rx, cancelled, Some(listener));
        sub.cancel();
        assert!(sub.is_cancelled());
        assert!(sub.recv_timeout(Duration::from_millis(1)).is_err());
    }
}
