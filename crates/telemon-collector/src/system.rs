use crate::Collector;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use telemon_common::types::Metric;
use telemon_storage::Storage;

/// Host memory and per-core CPU utilization, written as one batch.
pub struct SystemCollector {
    storage: Arc<dyn Storage>,
    system: Mutex<System>,
}

impl SystemCollector {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let mut system = System::new();
        // CPU usage is computed between two refreshes; prime the first one.
        system.refresh_cpu_all();
        Self {
            storage,
            system: Mutex::new(system),
        }
    }

    fn sample(&self) -> Vec<Metric> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_memory();
        system.refresh_cpu_all();

        let mut metrics = vec![
            Metric::gauge("TotalMemory", system.total_memory() as f64),
            Metric::gauge("FreeMemory", system.free_memory() as f64),
        ];
        metrics.extend(
            system
                .cpus()
                .iter()
                .enumerate()
                .map(|(i, cpu)| Metric::gauge(format!("CPUutilization{i}"), finite(cpu.cpu_usage()))),
        );
        metrics
    }
}

fn finite(usage: f32) -> f64 {
    if usage.is_finite() {
        f64::from(usage)
    } else {
        0.0
    }
}

#[async_trait]
impl Collector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    async fn collect(&self) -> Result<()> {
        let metrics = self.sample();
        self.storage.write_batch(&metrics).await?;
        tracing::debug!(collector = self.name(), count = metrics.len(), "Poll collected");
        Ok(())
    }
}
