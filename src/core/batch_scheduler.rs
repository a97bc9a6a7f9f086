// src/core/batch_scheduler.rs
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tracing::info;

use crate::config::PipelineConfig;

/// Split `items` into contiguous batches of at most `batch_size`, keeping order.
///
/// A `batch_size` of zero is treated as one.
pub fn partition<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);

    for item in items {
        current.push(item);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub batches: usize,
    pub throttle_pauses: usize,
    pub items: usize,
}

/// Runs work in sequential batches with a join-all barrier and a pause between batches
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    delay: Duration,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            delay,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.batch_size, Duration::from_millis(config.batch_delay_ms))
    }

    /// Drive `work` over every item.
    ///
    /// Items of one batch run concurrently and all of them settle before the next
    /// batch starts. `work` owns its failure handling: it has no way to abort the
    /// schedule.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, mut work: F) -> ScheduleStats
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        let batches = partition(items, self.batch_size);
        let total = batches.len();
        let mut stats = ScheduleStats::default();

        for (index, batch) in batches.into_iter().enumerate() {
            info!("Processing batch {}/{} ({} files)", index + 1, total, batch.len());
            stats.items += batch.len();

            join_all(batch.into_iter().map(&mut work)).await;
            stats.batches += 1;

            if index + 1 < total {
                info!("Throttling for {}ms before next batch", self.delay.as_millis());
                tokio::time::sleep(self.delay).await;
                stats.throttle_pauses += 1;
            }
        }

        stats
    }
}
