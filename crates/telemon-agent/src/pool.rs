//! Fixed-size worker pool fed through a bounded queue.
//!
//! `rate_limit` workers pull jobs from one shared queue, so at most that many
//! jobs run at once and producers wait once the queue is full. Job failures
//! are published on an error stream as soon as they happen; the stream
//! closes after the last worker exits.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A unit of work executed by exactly one worker.
#[async_trait]
pub trait Job: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
}

pub struct WorkerPool<J> {
    sender: Mutex<Option<mpsc::Sender<J>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<J>>>,
    span: tracing::Span,
}

/// Queue capacity used when none is given: one slot per available core.
pub fn default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl<J: Job> WorkerPool<J> {
    pub fn new(capacity: usize, span: tracing::Span) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            span,
        }
    }

    /// Spawns `workers` tasks and returns the error stream.
    ///
    /// Workers stop when `token` is cancelled (a job already running is
    /// finished first) or when the queue is closed and drained.
    pub fn start(
        &self,
        token: CancellationToken,
        workers: usize,
    ) -> mpsc::UnboundedReceiver<anyhow::Error> {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        for worker in 0..workers.max(1) {
            let receiver = self.receiver.clone();
            let errors = err_tx.clone();
            let token = token.clone();
            let span = tracing::debug_span!(parent: &self.span, "worker", worker);
            tokio::spawn(
                async move {
                    loop {
                        let job = tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            job = next_job(&receiver) => match job {
                                Some(job) => job,
                                None => break,
                            },
                        };
                        let name = job.name();
                        tracing::trace!(job = name, "Job started");
                        if let Err(e) = job.run().await {
                            tracing::warn!(job = name, error = %e, "Job failed");
                            // The receiver may already be gone during shutdown.
                            let _ = errors.send(e);
                        }
                    }
                    tracing::debug!("Worker stopped");
                }
                .instrument(span),
            );
        }
        err_rx
    }

    /// Queues a job, waiting while the queue is full.
    pub async fn submit(&self, job: J) -> Result<(), PoolError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(PoolError::Closed)?;
        sender.send(job).await.map_err(|_| PoolError::Closed)
    }

    /// Closes the queue. Jobs already queued are still handed out; further
    /// submits fail with [`PoolError::Closed`]. Calling it again is a no-op.
    pub fn stop(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

async fn next_job<J>(receiver: &tokio::sync::Mutex<mpsc::Receiver<J>>) -> Option<J> {
    receiver.lock().await.recv().await
}
