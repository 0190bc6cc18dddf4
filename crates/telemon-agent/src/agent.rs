//! The agent pipeline: two tickers feed collection and report jobs into a
//! [`WorkerPool`], and the first job failure ends the run.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use telemon_collector::Collector;
use telemon_common::types::Metric;
use telemon_storage::Storage;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::pool::{self, Job, WorkerPool};
use crate::sender::MetricSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

pub enum AgentJob {
    Collect(Arc<dyn Collector>),
    Report {
        storage: Arc<dyn Storage>,
        senders: Vec<Arc<dyn MetricSender>>,
    },
}

#[async_trait]
impl Job for AgentJob {
    fn name(&self) -> &'static str {
        match self {
            AgentJob::Collect(_) => "collect",
            AgentJob::Report { .. } => "report",
        }
    }

    async fn run(self) -> Result<()> {
        match self {
            AgentJob::Collect(collector) => collector.collect().await,
            AgentJob::Report { storage, senders } => report(storage.as_ref(), &senders).await,
        }
    }
}

/// Sends everything in the local cache to each sender in turn, then takes
/// the reported counter deltas back out so the next report only carries what
/// accumulated since.
///
/// Nothing is sent while the cache is empty. The first failed send stops the
/// report and leaves the cache untouched, so counters are only drained once
/// every sender has accepted the batch.
pub async fn report(storage: &dyn Storage, senders: &[Arc<dyn MetricSender>]) -> Result<()> {
    let gauges = storage.list_gauges().await?;
    let counters = storage.list_counters().await?;
    if gauges.is_empty() && counters.is_empty() {
        tracing::debug!("Nothing to report");
        return Ok(());
    }

    let mut batch: Vec<Metric> = Vec::with_capacity(gauges.len() + counters.len());
    batch.extend(gauges.into_values());
    batch.extend(counters.values().cloned());
    for sender in senders {
        sender.send(&batch).await?;
    }

    for counter in counters.values() {
        match counter.delta {
            Some(delta) if delta != 0 => {
                storage
                    .write_counter(&Metric::counter(counter.id.clone(), -delta))
                    .await?;
            }
            _ => {}
        }
    }
    tracing::info!(count = batch.len(), senders = senders.len(), "Metrics reported");
    Ok(())
}

pub struct Agent {
    collectors: Vec<Arc<dyn Collector>>,
    storage: Arc<dyn Storage>,
    senders: Vec<Arc<dyn MetricSender>>,
    poll_interval: Duration,
    report_interval: Duration,
    rate_limit: usize,
    queue_capacity: usize,
    state: watch::Sender<AgentState>,
    span: tracing::Span,
}

impl Agent {
    pub fn new(
        storage: Arc<dyn Storage>,
        sender: Arc<dyn MetricSender>,
        span: tracing::Span,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Idle);
        Self {
            collectors: Vec::new(),
            storage,
            senders: vec![sender],
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            rate_limit: 2,
            queue_capacity: pool::default_capacity(),
            state,
            span,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Adds another destination; every report goes to all of them in the
    /// order they were added.
    pub fn with_sender(mut self, sender: Arc<dyn MetricSender>) -> Self {
        self.senders.push(sender);
        self
    }

    pub fn with_intervals(mut self, poll: Duration, report: Duration) -> Self {
        self.poll_interval = poll;
        self.report_interval = report;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: usize) -> Self {
        self.rate_limit = rate_limit.max(1);
        self
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Runs until `token` is cancelled or a job fails.
    ///
    /// Returns the first job error, if any. Either way the pool is stopped
    /// and every worker has exited before this returns.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        self.run_pipeline(token).instrument(self.span.clone()).await
    }

    async fn run_pipeline(&self, token: CancellationToken) -> Result<()> {
        self.state.send_replace(AgentState::Running);

        let workers = token.child_token();
        let pool = WorkerPool::new(self.queue_capacity, self.span.clone());
        let mut errors = pool.start(workers.clone(), self.rate_limit);

        let start = Instant::now();
        let mut poll = interval_at(start + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval_at(start + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_secs = self.poll_interval.as_secs_f64(),
            report_secs = self.report_interval.as_secs_f64(),
            rate_limit = self.rate_limit,
            collectors = self.collectors.len(),
            "Agent running"
        );

        let mut failure = None;
        'run: loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(err) = errors.recv() => {
                    failure = Some(err);
                    break;
                }
                _ = poll.tick() => {
                    for collector in &self.collectors {
                        if !self.submit(&pool, &token, AgentJob::Collect(collector.clone())).await {
                            break 'run;
                        }
                    }
                }
                _ = report.tick() => {
                    let job = AgentJob::Report {
                        storage: self.storage.clone(),
                        senders: self.senders.clone(),
                    };
                    if !self.submit(&pool, &token, job).await {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(AgentState::ShuttingDown);
        workers.cancel();
        pool.stop();
        while let Some(err) = errors.recv().await {
            if failure.is_none() {
                failure = Some(err);
            } else {
                tracing::warn!(error = %err, "Additional job failure during shutdown");
            }
        }
        self.state.send_replace(AgentState::Stopped);

        match failure {
            Some(err) => {
                tracing::error!(error = %err, "Agent stopped after job failure");
                Err(err)
            }
            None => {
                tracing::info!("Agent stopped");
                Ok(())
            }
        }
    }

    async fn submit(&self, pool: &WorkerPool<AgentJob>, token: &CancellationToken, job: AgentJob) -> bool {
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            res = pool.submit(job) => res.is_ok(),
        }
    }
}
