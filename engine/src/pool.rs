//! Worker dispatch.
//!
//! The coordinating thread feeds journal entries into bounded channels; a
//! fixed set of scoped worker threads drains them. With per-device pinning
//! every worker owns a private lane and each destination device is assigned
//! to one lane (first seen, round-robin), so a device never serves two copies
//! at once. Without pinning all workers compete on one shared lane.
//!
//! A fatal error in a worker cancels the run token; the remaining queued
//! entries are drained without being processed so the feeder never blocks.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::thread;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::cancel::CancellationToken;
use crate::config::MigrationConfig;
use crate::error::MigrateError;
use crate::fs_ops;
use crate::model::JournalEntry;

/// Routes entries to worker lanes.
pub struct Dispatcher {
    lanes: Vec<Sender<JournalEntry>>,
    devices: HashMap<u64, usize>,
    next_lane: usize,
    dispatched: u64,
}

impl Dispatcher {
    fn new(lanes: Vec<Sender<JournalEntry>>) -> Self {
        Dispatcher {
            lanes,
            devices: HashMap::new(),
            next_lane: 0,
            dispatched: 0,
        }
    }

    /// Queue `entry`, blocking while its lane is full.
    pub fn dispatch(&mut self, entry: JournalEntry) -> Result<(), MigrateError> {
        let lane = self.lane_for(&entry.destination);
        self.lanes[lane].send(entry).map_err(|err| {
            let entry = err.into_inner();
            MigrateError::io(
                entry.destination,
                io::Error::new(io::ErrorKind::BrokenPipe, "worker lane closed"),
            )
        })?;
        self.dispatched += 1;
        Ok(())
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    fn lane_for(&mut self, destination: &Path) -> usize {
        if self.lanes.len() == 1 {
            return 0;
        }
        let device = fs_ops::device_id(destination).unwrap_or_else(|e| {
            debug!(destination = %destination.display(), error = %e, "cannot stat destination device");
            0
        });
        let lanes = self.lanes.len();
        let next_lane = &mut self.next_lane;
        *self.devices.entry(device).or_insert_with(|| {
            let lane = *next_lane % lanes;
            *next_lane += 1;
            debug!(device, lane, "device pinned to worker");
            lane
        })
    }
}

/// Run `work` over everything `feed` dispatches, on `config.workers` threads.
///
/// Returns the first fatal error from a worker, else the feeder's result. A
/// panicking worker re-raises its panic here once every thread has stopped.
pub fn run<F, W>(
    config: &MigrationConfig,
    cancel: &CancellationToken,
    feed: F,
    work: W,
) -> Result<(), MigrateError>
where
    F: FnOnce(&mut Dispatcher) -> Result<(), MigrateError>,
    W: Fn(JournalEntry) -> Result<(), MigrateError> + Sync,
{
    let workers = config.workers.max(1);
    let lane_count = if config.pin_workers_per_device {
        workers
    } else {
        1
    };
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..lane_count)
        .map(|_| bounded::<JournalEntry>(config.queue_depth))
        .unzip();
    let fatal: Mutex<Option<MigrateError>> = Mutex::new(None);

    let fed = thread::scope(|scope| -> Result<Result<(), MigrateError>, MigrateError> {
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let lane = receivers[index % lane_count].clone();
            let work = &work;
            let fatal = &fatal;
            let handle = thread::Builder::new()
                .name(format!("safemove-worker-{}", index))
                .spawn_scoped(scope, move || {
                    for entry in lane.iter() {
                        if cancel.is_cancelled() {
                            continue;
                        }
                        if let Err(e) = work(entry) {
                            error!(worker = index, error = %e, "fatal error, stopping run");
                            let mut slot = fatal.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            cancel.cancel();
                        }
                    }
                })
                .map_err(|e| MigrateError::io("worker thread", e))?;
            handles.push(handle);
        }
        // lanes disconnect once the workers' clones are gone
        drop(receivers);

        let mut dispatcher = Dispatcher::new(senders);
        let fed = feed(&mut dispatcher);
        if fed.is_err() {
            cancel.cancel();
        }
        debug!(entries = dispatcher.dispatched(), "dispatch finished");
        drop(dispatcher);

        for handle in handles {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
        Ok(fed)
    })?;

    match fatal.into_inner() {
        Some(e) => Err(e),
        None => fed,
    }
}
