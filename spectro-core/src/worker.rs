//! Named worker threads with a bounded join.
//!
//! `JoinHandle::join` cannot time out, so each worker carries the receiving
//! side of a channel whose only sender lives inside the thread. The sender
//! drops when the thread exits (normally or by unwinding), which
//! disconnects the channel and lets `join` wait with a deadline.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{Error, Result};
use crate::log_context::LogContext;

pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (alive_tx, exited) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _alive = alive_tx;
                body();
            })
            .map_err(|e| Error::Spawn(name, e))?;
        Ok(Self {
            name,
            handle,
            exited,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits up to `timeout` for the thread to finish.
    ///
    /// Returns `false` if the thread was still running; it is then detached.
    pub(crate) fn join(self, timeout: Duration, log: &LogContext) -> bool {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if self.handle.join().is_err() {
                    log.error(self.name, "worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                log.warn(
                    self.name,
                    format!("worker did not exit within {timeout:?}; detaching"),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn join_returns_once_the_thread_exits() {
        let log = LogContext::in_memory(8);
        let worker = Worker::spawn("quick", || {}).unwrap();
        assert!(worker.join(Duration::from_secs(1), &log));
    }

    #[test]
    fn join_gives_up_on_a_stuck_thread() {
        let log = LogContext::in_memory(8);
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();
        let worker = Worker::spawn("stuck", move || {
            while !flag.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert!(!worker.join(Duration::from_millis(20), &log));
        assert_eq!(log.entries().last().unwrap().level, log::Level::Warn);
        release.store(true, Ordering::Release);
    }

    #[test]
    fn panicking_worker_is_reported() {
        let log = LogContext::in_memory(8);
        let worker = Worker::spawn("boom", || panic!("worker failure")).unwrap();
        assert!(worker.join(Duration::from_secs(1), &log));
        assert_eq!(log.entries().last().unwrap().level, log::Level::Error);
    }
}
