//! Deadline for blocking I/O.
//!
//! A read from a hung mount can sit in the kernel forever, and no check in
//! the calling thread runs until it returns. Calls that may stall are
//! therefore run on a helper thread while the worker waits with a deadline.
//! On expiry the worker reports a `TimedOut` transient error and walks away;
//! the helper is abandoned and exits on its own if the call ever returns.

use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use tracing::warn;

use crate::error::MigrateError;

type Job = Box<dyn FnOnce() + Send>;

pub struct Watchdog {
    jobs: Option<Sender<Job>>,
    timeout: Duration,
}

impl Watchdog {
    pub fn spawn(timeout: Duration) -> Result<Self, MigrateError> {
        let (jobs, queue) = unbounded::<Job>();
        thread::Builder::new()
            .name("safemove-io".to_string())
            .spawn(move || {
                for job in queue.iter() {
                    job();
                }
            })
            .map_err(|e| MigrateError::io("io helper thread", e))?;
        Ok(Watchdog {
            jobs: Some(jobs),
            timeout,
        })
    }

    /// Run `call` on the helper thread, giving up after the timeout.
    ///
    /// After a timeout the helper is still busy, so every later call fails
    /// immediately; the attempt has to start over with a new watchdog.
    pub fn run<R, F>(&mut self, path: &Path, call: F) -> Result<R, MigrateError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let jobs = self.jobs.as_ref().ok_or_else(|| stalled(path, self.timeout))?;
        let (reply, result) = bounded(1);
        jobs.send(Box::new(move || {
            // the waiter may have given up already
            let _ = reply.send(call());
        }))
        .map_err(|_| {
            MigrateError::transient(path, io::Error::new(io::ErrorKind::BrokenPipe, "io helper exited"))
        })?;

        match result.recv_timeout(self.timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                warn!(path = %path.display(), timeout = ?self.timeout, "I/O call stalled, abandoning it");
                self.jobs = None;
                Err(stalled(path, self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(MigrateError::transient(
                path,
                io::Error::new(io::ErrorKind::BrokenPipe, "io helper panicked"),
            )),
        }
    }
}

fn stalled(path: &Path, timeout: Duration) -> MigrateError {
    MigrateError::TransientIo {
        path: path.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::TimedOut,
            format!("I/O stalled for more than {:?}", timeout),
        ),
    }
}
