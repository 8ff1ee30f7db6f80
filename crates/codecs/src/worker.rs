//! Background worker thread for asynchronous codec completion.
//!
//! Jobs run in submission order. `flush` blocks until every job queued
//! before it has run. Detaching closes the queue: jobs already queued still
//! run, then the thread exits on its own.

use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};
use vcs_common::{CodingError, CodingResult};

enum Task<J> {
    Run(J),
    Flush(Sender<()>),
}

pub(crate) struct Worker<J: Send + 'static> {
    name: String,
    tx: Option<Sender<Task<J>>>,
    handle: Option<JoinHandle<()>>,
}

impl<J: Send + 'static> Worker<J> {
    pub(crate) fn spawn(name: &str, mut run: impl FnMut(J) + Send + 'static) -> CodingResult<Self> {
        let (tx, rx) = channel::unbounded::<Task<J>>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in rx {
                    match task {
                        Task::Run(job) => run(job),
                        Task::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| {
                CodingError::AllocationFailed(format!("Failed to spawn worker thread {name}: {e}"))
            })?;
        debug!(worker = name, "Codec worker started");
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn submit(&self, job: J) -> CodingResult<()> {
        self.sender()?
            .send(Task::Run(job))
            .map_err(|_| self.gone())
    }

    /// Wait until every job submitted so far has run.
    pub(crate) fn flush(&self) -> CodingResult<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.sender()?
            .send(Task::Flush(ack_tx))
            .map_err(|_| self.gone())?;
        ack_rx.recv().map_err(|_| self.gone())
    }

    /// Close the queue without waiting for the thread.
    pub(crate) fn detach(&mut self) {
        if self.tx.take().is_some() {
            debug!(worker = %self.name, "Codec worker detached");
        }
        self.handle.take();
    }

    fn sender(&self) -> CodingResult<&Sender<Task<J>>> {
        self.tx.as_ref().ok_or_else(|| {
            CodingError::CodecMalfunction(format!("worker {} no longer accepts jobs", self.name))
        })
    }

    fn gone(&self) -> CodingError {
        warn!(worker = %self.name, "Codec worker thread exited unexpectedly");
        CodingError::CodecMalfunction(format!("worker {} exited", self.name))
    }
}

impl<J: Send + 'static> Drop for Worker<J> {
    fn drop(&mut self) {
        self.detach();
    }
}
