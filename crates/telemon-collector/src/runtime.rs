use crate::Collector;
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use telemon_common::types::Metric;
use telemon_storage::Storage;

/// Agent process and async-runtime figures, plus the two bookkeeping
/// metrics every poll produces: a fresh `RandomValue` gauge and a
/// `PollCount` counter increment.
pub struct RuntimeCollector {
    storage: Arc<dyn Storage>,
    started: Instant,
}

impl RuntimeCollector {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            started: Instant::now(),
        }
    }

    fn gauges(&self) -> Vec<Metric> {
        let load = System::load_average();
        let mut gauges = vec![
            Metric::gauge("Uptime", self.started.elapsed().as_secs_f64()),
            Metric::gauge("HostUptime", System::uptime() as f64),
            Metric::gauge("LoadAverage1", load.one),
            Metric::gauge("LoadAverage5", load.five),
            Metric::gauge("LoadAverage15", load.fifteen),
            Metric::gauge("RandomValue", rand::thread_rng().gen::<f64>()),
        ];
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let metrics = handle.metrics();
            gauges.push(Metric::gauge("RuntimeWorkers", metrics.num_workers() as f64));
            gauges.push(Metric::gauge(
                "RuntimeAliveTasks",
                metrics.num_alive_tasks() as f64,
            ));
        }
        gauges
    }
}

#[async_trait]
impl Collector for RuntimeCollector {
    fn name(&self) -> &str {
        "runtime"
    }

    async fn collect(&self) -> Result<()> {
        for gauge in self.gauges() {
            self.storage.write_gauge(&gauge).await?;
        }
        let polls = self
            .storage
            .write_counter(&Metric::counter("PollCount", 1))
            .await?;
        tracing::debug!(collector = self.name(), poll = ?polls.delta, "Poll collected");
        Ok(())
    }
}
