// Copyright [2020] [Balaji Rajendran]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::options::options::Options;
use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use weir_core::partition::balancer::throughput_weighted;
use weir_core::partition::config::{BufferStrategy, PartitionPolicy, QueueConfig, ThreadPolicy};
use weir_core::partition::partitioned_queue::{BatchConsumer, PartitionedQueue};
use weir_core::queue::queue::{new_queue, QueueKind};
use weir_core::utils::utils::group_digits;

/// DrainRun is the outcome of one drain to exhaustion run against one queue
/// kind.
#[derive(Serialize, Debug)]
pub struct DrainRun {
    pub queue: &'static str,
    pub producers: usize,
    pub consumers: usize,
    pub total_elements: u64,
    pub collected_elements: u64,
    pub elapsed_ms: u64,
    pub throughput_per_sec: u64,
}

/// PartitionRun is the outcome of one timed partitioned queue run.
#[derive(Serialize, Debug)]
pub struct PartitionRun {
    pub label: &'static str,
    pub workers: usize,
    pub partitions: usize,
    pub attempted: u64,
    pub accepted: u64,
    pub consumed: u64,
    pub drop_rate_percent: f64,
    pub consume_rate_per_sec: u64,
}

/// BenchReport bundles every run for the json output.
#[derive(Serialize, Debug)]
pub struct BenchReport {
    pub drain_runs: Vec<DrainRun>,
    pub partition_runs: Vec<PartitionRun>,
}

/// run_drain_to_exhaustion drives one queue kind with the fixed workload: N
/// producers each appending batches_per_producer batches of batch_len distinct
/// values, M consumers draining until the queue reports closed and empty. The
/// element count and a checksum are verified before the run is reported, a
/// lossy queue would taint the numbers.
pub fn run_drain_to_exhaustion(kind: QueueKind, opt: &Options) -> DrainRun {
    let queue = new_queue::<u64>(kind, opt.max_batch_size);
    let per_producer = (opt.batches_per_producer * opt.batch_len) as u64;
    let total = opt.producers as u64 * per_producer;
    let collected = AtomicU64::new(0);
    let checksum = AtomicU64::new(0);
    let start = Instant::now();
    crossbeam::thread::scope(|s| {
        let mut producer_handles = Vec::with_capacity(opt.producers);
        for producer in 0..opt.producers {
            let queue = queue.clone();
            let batch_len = opt.batch_len as u64;
            let batches = opt.batches_per_producer as u64;
            producer_handles.push(s.spawn(move |_| {
                let base = producer as u64 * per_producer;
                for batch_index in 0..batches {
                    let from = base + batch_index * batch_len;
                    queue.put_many((from..from + batch_len).collect());
                }
            }));
        }
        let mut consumer_handles = Vec::with_capacity(opt.consumers);
        for _ in 0..opt.consumers {
            let queue = queue.clone();
            let collected = &collected;
            let checksum = &checksum;
            consumer_handles.push(s.spawn(move |_| loop {
                let batch = queue.pop_many();
                if batch.is_empty() {
                    break;
                }
                collected.fetch_add(batch.len() as u64, Ordering::Relaxed);
                let mut batch_sum = 0u64;
                for element in batch {
                    batch_sum = batch_sum.wrapping_add(element);
                }
                checksum.fetch_add(batch_sum, Ordering::Relaxed);
            }));
        }
        for producer in producer_handles {
            producer.join().unwrap();
        }
        queue.no_further_appending();
        for consumer in consumer_handles {
            consumer.join().unwrap();
        }
    })
    .unwrap();
    let elapsed = start.elapsed();

    let collected_elements = collected.load(Ordering::Relaxed);
    // Sum of 0..total, wrapped to u64 the same way the consumers wrap.
    let expected_checksum = if total == 0 {
        0
    } else {
        (total as u128 * (total as u128 - 1) / 2) as u64
    };
    if collected_elements != total || checksum.load(Ordering::Relaxed) != expected_checksum {
        warn!(
            "queue {} lost elements: expected {} got {}",
            kind.name(),
            total,
            collected_elements
        );
    }
    let elapsed_ms = elapsed.as_millis() as u64;
    DrainRun {
        queue: kind.name(),
        producers: opt.producers,
        consumers: opt.consumers,
        total_elements: total,
        collected_elements,
        elapsed_ms,
        throughput_per_sec: total * 1000 / std::cmp::max(1, elapsed_ms),
    }
}

struct CountingConsumer {
    consumed: Arc<AtomicU64>,
}

impl BatchConsumer<u64> for CountingConsumer {
    fn consume(&self, batch: Vec<u64>) {
        self.consumed.fetch_add(batch.len() as u64, Ordering::Relaxed);
    }
}

/// run_partitioned_throughput hammers a partitioned queue for measure_secs
/// with a counting consumer, with or without rebalancing, and reports the
/// consume rate and drop rate.
pub fn run_partitioned_throughput(opt: &Options, rebalance: bool) -> PartitionRun {
    let workers = if opt.partition_workers == 0 {
        num_cpus::get()
    } else {
        opt.partition_workers
    };
    let consumed = Arc::new(AtomicU64::new(0));
    let label = if rebalance { "rebalanced" } else { "static" };
    let mut config = QueueConfig::new(label)
        .threads(ThreadPolicy::Fixed(workers))
        .partitions(PartitionPolicy::ThreadMultiply(4))
        .buffer_size(50_000)
        .strategy(BufferStrategy::IfPossible)
        .min_idle_ms(1)
        .max_idle_ms(50);
    if rebalance {
        config = config.balancer(throughput_weighted(), 500);
    }
    let queue = PartitionedQueue::new(
        config,
        Box::new(CountingConsumer {
            consumed: consumed.clone(),
        }),
    );
    let partitions = queue.partition_count();

    let attempted = AtomicU64::new(0);
    let accepted = AtomicU64::new(0);
    let deadline = Instant::now() + Duration::from_secs(opt.measure_secs);
    let measure_start = Instant::now();
    crossbeam::thread::scope(|s| {
        for producer in 0..opt.producers {
            let queue = &queue;
            let attempted = &attempted;
            let accepted = &accepted;
            s.spawn(move |_| {
                let mut value = producer as u64;
                while Instant::now() < deadline {
                    for _ in 0..100 {
                        attempted.fetch_add(1, Ordering::Relaxed);
                        if queue.produce(value) {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                        value = value.wrapping_add(1);
                    }
                }
            });
        }
    })
    .unwrap();
    let measure_elapsed = measure_start.elapsed();

    // Let the drain workers catch up with the accepted tail, then the
    // shutdown drain picks up whatever is left.
    let accepted_total = accepted.load(Ordering::Relaxed);
    let settle_deadline = Instant::now() + Duration::from_secs(5);
    while consumed.load(Ordering::Relaxed) < accepted_total && Instant::now() < settle_deadline {
        thread::sleep(Duration::from_millis(20));
    }
    queue.shutdown();

    let attempted_total = attempted.load(Ordering::Relaxed);
    let consumed_total = consumed.load(Ordering::Relaxed);
    if consumed_total != accepted_total {
        warn!(
            "partitioned run {} lost elements: accepted {} consumed {}",
            label, accepted_total, consumed_total
        );
    }
    let elapsed_ms = std::cmp::max(1, measure_elapsed.as_millis() as u64);
    PartitionRun {
        label,
        workers,
        partitions,
        attempted: attempted_total,
        accepted: accepted_total,
        consumed: consumed_total,
        drop_rate_percent: if attempted_total == 0 {
            0.0
        } else {
            (attempted_total - accepted_total) as f64 * 100.0 / attempted_total as f64
        },
        consume_rate_per_sec: consumed_total * 1000 / elapsed_ms,
    }
}

/// log_report prints the aligned result tables the way the storage team reads
/// them in CI logs.
pub fn log_report(report: &BenchReport) {
    info!("=== blocking batch queue, drain to exhaustion ===");
    info!(
        "{:<12} {:>10} {:>10} {:>12} {:>10} {:>14}",
        "queue", "producers", "consumers", "elements", "ms", "elements/sec"
    );
    for run in &report.drain_runs {
        info!(
            "{:<12} {:>10} {:>10} {:>12} {:>10} {:>14}",
            run.queue,
            run.producers,
            run.consumers,
            group_digits(run.total_elements),
            run.elapsed_ms,
            group_digits(run.throughput_per_sec)
        );
    }
    info!("=== partitioned queue, timed produce ===");
    info!(
        "{:<12} {:>8} {:>11} {:>14} {:>14} {:>8} {:>14}",
        "mode", "workers", "partitions", "accepted", "consumed", "drop%", "consumed/sec"
    );
    for run in &report.partition_runs {
        info!(
            "{:<12} {:>8} {:>11} {:>14} {:>14} {:>8.2} {:>14}",
            run.label,
            run.workers,
            run.partitions,
            group_digits(run.accepted),
            group_digits(run.consumed),
            run.drop_rate_percent,
            group_digits(run.consume_rate_per_sec)
        );
    }
}
