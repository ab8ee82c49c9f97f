//! Worker pool running shard builds in parallel.
//!
//! A producer thread walks the partition stream once and sends
//! [`PartitionTask`]s over a bounded channel, so at most a few partitions are
//! held in memory at a time. Each worker builds its own [`EncoderContext`]
//! from its [`WorkerConfig`] before taking tasks. Outcomes flow back over a
//! result channel to the calling thread.
//!
//! `run` returns only after every worker has exited (join-all barrier) and
//! reports one outcome per partition, failed or not.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, info, warn};

use crate::error::{IndexError, IndexResult, PartitionFailure};
use crate::vector::codebook::Codebook;
use crate::vector::corpus::Partition;
use crate::vector::embedding::{DeviceHandle, EncoderContext, EncoderFactory};
use crate::vector::segment::SegmentSummary;
use crate::vector::shard::{PartitionTask, ShardBuilder, reusable_segment};
use crate::vector::types::PartitionIndex;

/// Identity and device of one worker, fixed at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_index: usize,
    pub device: DeviceHandle,
}

/// Result of one partition.
#[derive(Debug)]
pub struct PartitionOutcome {
    pub partition: PartitionIndex,
    pub result: IndexResult<SegmentSummary>,
}

/// Everything the pool did, ordered by partition.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub outcomes: Vec<PartitionOutcome>,
}

impl PoolReport {
    pub fn partition_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    pub fn reused_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Ok(summary) if summary.reused))
            .count()
    }

    /// All summaries, or `PartitionsFailed` naming every failed partition.
    pub fn into_result(self) -> IndexResult<Vec<SegmentSummary>> {
        let mut summaries = Vec::with_capacity(self.outcomes.len());
        let mut failures = Vec::new();
        for outcome in self.outcomes {
            match outcome.result {
                Ok(summary) => summaries.push(summary),
                Err(error) => failures.push(PartitionFailure {
                    partition: outcome.partition,
                    error,
                }),
            }
        }
        if failures.is_empty() {
            Ok(summaries)
        } else {
            Err(IndexError::PartitionsFailed { failures })
        }
    }
}

/// Fixed-size pool of shard builders.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    gpus: usize,
    resume: bool,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            gpus: 0,
            resume: false,
        }
    }

    /// Spread workers over `gpus` accelerators instead of the CPU.
    #[must_use]
    pub fn with_gpus(mut self, gpus: usize) -> Self {
        self.gpus = gpus;
        self
    }

    /// Reuse segments that already match their partition.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn worker_config(&self, worker_index: usize) -> WorkerConfig {
        WorkerConfig {
            worker_index,
            device: DeviceHandle::for_worker(worker_index, self.gpus),
        }
    }

    /// Builds every partition of `partitions` and waits for all of them.
    ///
    /// A failed partition never stops the others. An error reading the
    /// partition stream stops dispatch; partitions already dispatched still
    /// finish and the read error is returned.
    pub fn run<I>(
        &self,
        partitions: I,
        codebook: Arc<Codebook>,
        output_dir: &Path,
        builder: &ShardBuilder,
        factory: &dyn EncoderFactory,
        on_outcome: &(dyn Fn(&PartitionOutcome) + Sync),
    ) -> IndexResult<PoolReport>
    where
        I: IntoIterator<Item = IndexResult<Partition>>,
        I::IntoIter: Send,
    {
        let (task_tx, task_rx) = bounded::<PartitionTask>(self.workers);
        let (result_tx, result_rx) = unbounded::<PartitionOutcome>();
        let output_dir = output_dir.to_path_buf();
        let partitions = partitions.into_iter();
        let resume = self.resume;

        info!("Starting {} shard workers", self.workers);

        let (outcomes, produced) = std::thread::scope(|scope| {
            for worker_index in 0..self.workers {
                let config = self.worker_config(worker_index);
                let tasks = task_rx.clone();
                let results = result_tx.clone();
                scope.spawn(move || run_worker(config, factory, builder, tasks, results));
            }
            drop(task_rx);

            let producer_results = result_tx.clone();
            let producer_codebook = Arc::clone(&codebook);
            let producer = scope.spawn(move || {
                produce(
                    partitions,
                    producer_codebook,
                    output_dir,
                    resume,
                    task_tx,
                    producer_results,
                )
            });
            drop(result_tx);

            // Ends once the producer and every worker have dropped their senders
            let mut outcomes = Vec::new();
            for outcome in result_rx.iter() {
                on_outcome(&outcome);
                outcomes.push(outcome);
            }

            let produced = producer.join().unwrap_or_else(|_| {
                Err(IndexError::Encoder("partition producer panicked".to_string()))
            });
            (outcomes, produced)
        });

        let mut report = PoolReport { outcomes };
        report.outcomes.sort_by_key(|o| o.partition);
        let dispatched = produced?;
        debug_assert_eq!(dispatched, report.outcomes.len());

        info!(
            "Shard workers finished: {} partitions, {} reused, {} failed",
            report.partition_count(),
            report.reused_count(),
            report.failed_count()
        );
        Ok(report)
    }
}

/// Sends every partition to the workers, or answers it directly when its
/// segment can be reused. Returns the number of partitions seen.
fn produce<I>(
    partitions: I,
    codebook: Arc<Codebook>,
    output_dir: PathBuf,
    resume: bool,
    tasks: Sender<PartitionTask>,
    results: Sender<PartitionOutcome>,
) -> IndexResult<usize>
where
    I: Iterator<Item = IndexResult<Partition>>,
{
    let mut seen = 0;
    for partition in partitions {
        let partition = partition?;
        seen += 1;

        if resume {
            if let Some(summary) = reusable_segment(&output_dir, &partition, &codebook) {
                info!("Partition {} already built, skipping", partition.index);
                let _ = results.send(PartitionOutcome {
                    partition: partition.index,
                    result: Ok(summary),
                });
                continue;
            }
        }

        let task = PartitionTask {
            partition,
            codebook: Arc::clone(&codebook),
            output_dir: output_dir.clone(),
        };
        if let Err(unsent) = tasks.send(task) {
            // Every worker is gone; report instead of dropping the partition
            let task = unsent.into_inner();
            let _ = results.send(PartitionOutcome {
                partition: task.partition.index,
                result: Err(IndexError::ShardEncodingFailure {
                    partition: task.partition.index,
                    reason: "no shard worker available".to_string(),
                }),
            });
        }
    }
    Ok(seen)
}

fn run_worker(
    config: WorkerConfig,
    factory: &dyn EncoderFactory,
    builder: &ShardBuilder,
    tasks: Receiver<PartitionTask>,
    results: Sender<PartitionOutcome>,
) {
    let ctx: Result<EncoderContext, String> = factory.create(&config).map_err(|e| e.to_string());
    match &ctx {
        Ok(ctx) => debug!("Worker {} ready on {}", config.worker_index, ctx.device()),
        Err(e) => warn!("Worker {} has no encoder: {e}", config.worker_index),
    }

    for task in tasks.iter() {
        let partition = task.partition.index;
        let result = match &ctx {
            Ok(ctx) => catch_unwind(AssertUnwindSafe(|| builder.build(&task, ctx)))
                .unwrap_or_else(|_| {
                    Err(IndexError::ShardEncodingFailure {
                        partition,
                        reason: format!("worker {} panicked", config.worker_index),
                    })
                }),
            Err(e) => Err(IndexError::ShardEncodingFailure {
                partition,
                reason: format!("encoder unavailable on worker {}: {e}", config.worker_index),
            }),
        };
        if let Err(e) = &result {
            warn!("Partition {partition} failed: {e}");
        }
        if results.send(PartitionOutcome { partition, result }).is_err() {
            break;
        }
    }
}
