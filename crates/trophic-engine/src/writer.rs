//! Background persistence.
//!
//! The [`BackgroundWriter`] owns the [`TimestepLog`] on a dedicated thread and
//! appends snapshot batches in the order they were submitted, so the tick loop
//! never waits on disk. Jobs travel over a `crossbeam` channel; control jobs
//! (drain, sync, truncate) carry a reply channel and act as barriers because
//! the queue is FIFO.
//!
//! The first append failure stops persistence: later batches are dropped and
//! every subsequent call reports [`RunError::WriterStopped`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use trophic_log::log::TimestepLog;
use trophic_log::reader::LogReader;
use trophic_log::LogError;
use trophic_store::snapshot::TimestepSnapshot;

use crate::RunError;

enum Job {
    Append(Vec<TimestepSnapshot>),
    Drain(Sender<()>),
    Sync(Sender<Result<(), LogError>>),
    Truncate {
        after: u64,
        reply: Sender<Result<u64, LogError>>,
    },
}

#[derive(Debug, Default)]
struct WriterShared {
    /// First append failure, if any.
    failure: Mutex<Option<String>>,
    /// Set by `discard`; queued batches are skipped.
    cancelled: AtomicBool,
}

/// Handle to the log-owning writer thread.
#[derive(Debug)]
pub struct BackgroundWriter {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<TimestepLog>>,
    shared: Arc<WriterShared>,
    reader: LogReader,
}

impl BackgroundWriter {
    /// Move `log` onto a new writer thread.
    pub fn spawn(log: TimestepLog) -> Result<Self, RunError> {
        let reader = log.reader();
        let shared = Arc::new(WriterShared::default());
        let (jobs, queue) = channel::unbounded();

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("trophic-log-writer".to_owned())
            .spawn(move || run_writer(log, queue, worker_shared))
            .map_err(LogError::Io)?;

        Ok(Self {
            jobs: Some(jobs),
            handle: Some(handle),
            shared,
            reader,
        })
    }

    /// A read handle on the log this writer appends to.
    pub fn reader(&self) -> &LogReader {
        &self.reader
    }

    /// Queue a batch of consecutive snapshots.
    pub fn submit(&self, batch: Vec<TimestepSnapshot>) -> Result<(), RunError> {
        self.check()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.send(Job::Append(batch))
    }

    /// Block until every batch queued so far has been handled.
    pub fn drain(&self) -> Result<(), RunError> {
        let (reply, done) = channel::bounded(1);
        self.send(Job::Drain(reply))?;
        done.recv().map_err(|_| self.stopped())?;
        self.check()
    }

    /// Drain, then force the log to disk.
    pub fn sync(&self) -> Result<(), RunError> {
        let (reply, done) = channel::bounded(1);
        self.send(Job::Sync(reply))?;
        done.recv().map_err(|_| self.stopped())??;
        self.check()
    }

    /// Drain, then discard every snapshot after `after`.
    pub fn truncate_after(&self, after: u64) -> Result<u64, RunError> {
        self.check()?;
        let (reply, done) = channel::bounded(1);
        self.send(Job::Truncate { after, reply })?;
        Ok(done.recv().map_err(|_| self.stopped())??)
    }

    /// Finish every queued job and return the log.
    pub fn close(mut self) -> Result<TimestepLog, RunError> {
        let log = self.join()?;
        self.check()?;
        Ok(log)
    }

    /// Stop without persisting queued batches.
    pub fn discard(mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        if let Err(e) = self.join() {
            tracing::warn!(error = %e, "writer did not shut down cleanly");
        }
    }

    fn join(&mut self) -> Result<TimestepLog, RunError> {
        // Closing the channel ends the worker loop once the queue is empty.
        self.jobs.take();
        let handle = self.handle.take().ok_or_else(|| self.stopped())?;
        handle.join().map_err(|_| RunError::WriterStopped {
            reason: "writer thread panicked".to_owned(),
        })
    }

    fn send(&self, job: Job) -> Result<(), RunError> {
        self.jobs
            .as_ref()
            .ok_or_else(|| self.stopped())?
            .send(job)
            .map_err(|_| self.stopped())
    }

    fn check(&self) -> Result<(), RunError> {
        match self.shared.failure.lock().as_ref() {
            Some(reason) => Err(RunError::WriterStopped {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn stopped(&self) -> RunError {
        RunError::WriterStopped {
            reason: self
                .shared
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| "writer is gone".to_owned()),
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.join() {
                tracing::warn!(error = %e, "writer did not shut down cleanly");
            }
        }
    }
}

fn run_writer(mut log: TimestepLog, queue: Receiver<Job>, shared: Arc<WriterShared>) -> TimestepLog {
    for job in queue {
        match job {
            Job::Append(batch) => {
                if shared.cancelled.load(Ordering::SeqCst) || shared.failure.lock().is_some() {
                    tracing::debug!(snapshots = batch.len(), "dropping queued batch");
                    continue;
                }
                for snapshot in &batch {
                    if let Err(e) = log.append(snapshot) {
                        tracing::error!(index = snapshot.index, error = %e, "background append failed");
                        *shared.failure.lock() = Some(e.to_string());
                        break;
                    }
                }
            }
            Job::Drain(reply) => {
                let _ = reply.send(());
            }
            Job::Sync(reply) => {
                let _ = reply.send(log.sync());
            }
            Job::Truncate { after, reply } => {
                let _ = reply.send(log.truncate_after(after));
            }
        }
    }
    log
}
