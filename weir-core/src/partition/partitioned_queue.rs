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
use crate::partition::balancer::{DrainBalancer, UNOWNED};
use crate::partition::config::{BufferStrategy, PartitionSelector, QueueConfig};
use crate::partition::stats::QueueStats;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

/// BatchConsumer receives the batches a partitioned queue drains. One consumer
/// serves the whole queue, it must tolerate being called from several drain
/// workers at once.
pub trait BatchConsumer<E>: Send + Sync {
    /// consume processes one drained batch.
    fn consume(&self, batch: Vec<E>);

    /// on_idle fires when a drain cycle found nothing, so consumers holding
    /// partial state can flush it downstream.
    fn on_idle(&self) {}
}

/// Shared is the state every worker thread hangs on to.
struct Shared<E> {
    name: String,
    buffer_size: usize,
    strategy: BufferStrategy,
    min_idle_ms: u64,
    max_idle_ms: u64,
    /// partitions keeps both channel ends. Producers send into a partition,
    /// drain workers try_recv it empty. Holding the senders here means a send
    /// can never observe a disconnect.
    partitions: Vec<(Sender<E>, Receiver<E>)>,
    selector: Option<PartitionSelector<E>>,
    round_robin: AtomicUsize,
    consumer: Box<dyn BatchConsumer<E>>,
    running: AtomicBool,
    /// assigned lists the partitions each drain worker walks, rebuilt by the
    /// rebalancer and re-read at the top of every drain cycle.
    assigned: RwLock<Vec<Vec<usize>>>,
    /// throughput counts produces per partition since the last rebalance
    /// snapshot. Empty unless rebalancing is on.
    throughput: Vec<AtomicU64>,
    /// owner maps partition to draining worker while rebalancing. The drain
    /// loop skips partitions it no longer owns.
    owner: Vec<AtomicUsize>,
    /// cycles counts finished drain cycles per worker. The rebalancer fences
    /// on it during the two phase handoff.
    cycles: Vec<AtomicU64>,
    rebalancing: bool,
}

/// PartitionedQueue spreads a high rate element stream over a fixed set of
/// bounded partition buffers and drains them with a pool of worker threads,
/// each walking its own disjoint partition subset. Producers and drain workers
/// therefore contend per partition, never on one global lock.
pub struct PartitionedQueue<E> {
    shared: Arc<Shared<E>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl<E: Send + 'static> PartitionedQueue<E> {
    /// new builds the partitions, spawns the drain workers and, when a
    /// balancer is configured, the rebalance thread. The queue accepts
    /// produces immediately.
    pub fn new(config: QueueConfig<E>, consumer: Box<dyn BatchConsumer<E>>) -> PartitionedQueue<E> {
        let QueueConfig {
            name,
            threads,
            partitions: partition_policy,
            buffer_size,
            strategy,
            min_idle_ms,
            max_idle_ms,
            selector,
            balancer,
            rebalance_interval_ms,
        } = config;
        assert!(buffer_size > 0, "buffer_size must be positive");
        assert!(
            min_idle_ms > 0 && min_idle_ms <= max_idle_ms,
            "idle backoff range must be positive and ordered"
        );
        let mut worker_count = threads.resolve();
        assert!(worker_count > 0, "thread policy resolved to zero workers");
        let partition_count = partition_policy.resolve(worker_count);
        assert!(partition_count > 0, "partition policy resolved to zero partitions");
        if partition_count < worker_count {
            warn!(
                "queue {}: {} partitions for {} workers, reducing workers to {}",
                name, partition_count, worker_count, partition_count
            );
            worker_count = partition_count;
        }

        let partitions: Vec<(Sender<E>, Receiver<E>)> =
            (0..partition_count).map(|_| bounded(buffer_size)).collect();
        // Round robin partition to worker assignment to start from.
        let mut assigned = vec![Vec::new(); worker_count];
        for partition in 0..partition_count {
            assigned[partition % worker_count].push(partition);
        }

        let rebalancing =
            balancer.is_some() && rebalance_interval_ms > 0 && worker_count > 1;
        let (throughput, owner, cycles) = if rebalancing {
            (
                (0..partition_count).map(|_| AtomicU64::new(0)).collect(),
                (0..partition_count)
                    .map(|partition| AtomicUsize::new(partition % worker_count))
                    .collect(),
                (0..worker_count).map(|_| AtomicU64::new(0)).collect(),
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        let shared = Arc::new(Shared {
            name,
            buffer_size,
            strategy,
            min_idle_ms,
            max_idle_ms,
            partitions,
            selector,
            round_robin: AtomicUsize::new(0),
            consumer,
            running: AtomicBool::new(true),
            assigned: RwLock::new(assigned),
            throughput,
            owner,
            cycles,
            rebalancing,
        });

        let mut workers = Vec::with_capacity(worker_count + 1);
        for task in 0..worker_count {
            let shared = shared.clone();
            workers.push(thread::spawn(move || drain_loop(&shared, task)));
        }
        if rebalancing {
            let balancer = balancer.unwrap();
            let interval = Duration::from_millis(rebalance_interval_ms);
            let shared_for_rebalance = shared.clone();
            workers.push(thread::spawn(move || {
                rebalance_loop(&shared_for_rebalance, &*balancer, interval)
            }));
            info!(
                "queue {}: rebalancing every {}ms across {} workers",
                shared.name, rebalance_interval_ms, worker_count
            );
        }
        info!(
            "queue {}: spinning {} drain workers over {} partitions",
            shared.name, worker_count, partition_count
        );

        PartitionedQueue {
            shared,
            workers: Mutex::new(workers),
            worker_count,
        }
    }
}

impl<E> PartitionedQueue<E> {
    /// produce routes one element to a partition. Returns false once the queue
    /// is stopped, or under the IfPossible strategy when the partition is full
    /// and the element was dropped. Under Blocking it parks the caller until
    /// the partition has room.
    pub fn produce(&self, data: E) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let partition_count = self.shared.partitions.len();
        let index = match &self.shared.selector {
            Some(selector) => selector(&data, partition_count) % partition_count,
            None => self.shared.round_robin.fetch_add(1, Ordering::Relaxed) % partition_count,
        };
        // Counted before the send so the rebalancer sees the produce demand,
        // not the drain throttled rate.
        if self.shared.rebalancing {
            self.shared.throughput[index].fetch_add(1, Ordering::Relaxed);
        }
        match self.shared.strategy {
            BufferStrategy::Blocking => self.shared.partitions[index].0.send(data).is_ok(),
            BufferStrategy::IfPossible => self.shared.partitions[index].0.try_send(data).is_ok(),
        }
    }

    /// stats takes a point in time usage snapshot across all partitions.
    pub fn stats(&self) -> QueueStats {
        QueueStats::new(
            self.shared.buffer_size,
            self.shared
                .partitions
                .iter()
                .map(|(_, receiver)| receiver.len())
                .collect(),
        )
    }

    /// partition_count returns the number of partition buffers.
    pub fn partition_count(&self) -> usize {
        self.shared.partitions.len()
    }

    /// worker_count returns the number of drain workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// rebalancing_enabled tells whether the rebalance thread is running.
    pub fn rebalancing_enabled(&self) -> bool {
        self.shared.rebalancing
    }

    /// shutdown rejects further produces, joins every worker and dispatches
    /// whatever is still buffered as one final batch. Safe to call twice, the
    /// second call is a no-op.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        let mut remainder = Vec::new();
        for (_, receiver) in &self.shared.partitions {
            while let Ok(element) = receiver.try_recv() {
                remainder.push(element);
            }
        }
        if !remainder.is_empty() {
            debug!(
                "queue {}: dispatching {} leftover elements on shutdown",
                self.shared.name,
                remainder.len()
            );
            self.shared.consumer.consume(remainder);
        }
        info!("queue {} stopped", self.shared.name);
    }
}

impl<E> Drop for PartitionedQueue<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// drain_loop is one worker's life: drain every owned partition to exhaustion
/// into a combined batch, dispatch it, back off exponentially while idle.
fn drain_loop<E: Send>(shared: &Shared<E>, task: usize) {
    debug!("queue {}: drain worker {} started", shared.name, task);
    let mut idle_cycles: u32 = 0;
    while shared.running.load(Ordering::SeqCst) {
        let my_partitions = shared.assigned.read()[task].clone();
        let mut combined = Vec::new();
        for partition in my_partitions {
            // Skip partitions the rebalancer revoked from this worker.
            if shared.rebalancing && shared.owner[partition].load(Ordering::SeqCst) != task {
                continue;
            }
            while let Ok(element) = shared.partitions[partition].1.try_recv() {
                combined.push(element);
            }
        }
        let drained = !combined.is_empty();
        if drained {
            idle_cycles = 0;
            shared.consumer.consume(combined);
        } else {
            idle_cycles += 1;
            shared.consumer.on_idle();
        }
        // Bumped only after the dispatch is done. The rebalancer fences on
        // this, a fenced cycle proves the worker is out of any partition it
        // was draining when the revoke landed.
        if shared.rebalancing {
            shared.cycles[task].fetch_add(1, Ordering::SeqCst);
        }
        if !drained {
            let delay = idle_delay(shared.min_idle_ms, shared.max_idle_ms, idle_cycles);
            thread::sleep(Duration::from_millis(delay));
        }
    }
    debug!("queue {}: drain worker {} exiting", shared.name, task);
}

/// idle_delay doubles with every consecutive empty cycle, starting from
/// min_idle_ms, capped at max_idle_ms.
fn idle_delay(min_idle_ms: u64, max_idle_ms: u64, idle_cycles: u32) -> u64 {
    let exponent = cmp::min(idle_cycles, 20);
    cmp::min(min_idle_ms.saturating_mul(1u64 << exponent), max_idle_ms)
}

/// rebalance_loop periodically snapshots the per partition produce counters,
/// asks the balancer for a new assignment and moves partitions between
/// workers with a two phase handoff: revoke to UNOWNED, fence on the old
/// owner's cycle counter, then assign. A partition is never drained by two
/// workers at once.
fn rebalance_loop<E: Send>(shared: &Shared<E>, balancer: &dyn DrainBalancer, interval: Duration) {
    let worker_count = shared.cycles.len();
    while shared.running.load(Ordering::SeqCst) {
        sleep_while_running(shared, interval);
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let snapshot: Vec<u64> = shared
            .throughput
            .iter()
            .map(|counter| counter.swap(0, Ordering::SeqCst))
            .collect();
        let current: Vec<usize> = shared
            .owner
            .iter()
            .map(|owner| owner.load(Ordering::SeqCst))
            .collect();
        let new_owner = match balancer.assign(&snapshot, &current, worker_count) {
            Some(new_owner) => new_owner,
            None => continue,
        };
        let mut moves = Vec::new();
        for partition in 0..current.len() {
            let old = current[partition];
            let new = new_owner[partition];
            if old != new && old != UNOWNED && new != UNOWNED {
                moves.push((partition, old, new));
            }
        }
        if moves.is_empty() {
            continue;
        }
        // Phase one: revoke. The old owners stop touching the moved
        // partitions on their next cycle.
        let mut need_fence = vec![false; worker_count];
        for &(partition, old, _) in &moves {
            shared.owner[partition].store(UNOWNED, Ordering::SeqCst);
            need_fence[old] = true;
        }
        let fences: Vec<u64> = shared
            .cycles
            .iter()
            .map(|cycle| cycle.load(Ordering::SeqCst))
            .collect();
        for worker in 0..worker_count {
            if !need_fence[worker] {
                continue;
            }
            // The cycle the worker was inside when the revoke landed may
            // still drain a moved partition, wait for it to finish.
            while shared.cycles[worker].load(Ordering::SeqCst) <= fences[worker]
                && shared.running.load(Ordering::SeqCst)
            {
                thread::sleep(Duration::from_millis(1));
            }
        }
        // Phase two: assign the new owners and publish the rebuilt walk
        // lists.
        for &(partition, _, new) in &moves {
            shared.owner[partition].store(new, Ordering::SeqCst);
        }
        let mut assigned = vec![Vec::new(); worker_count];
        for (partition, owner) in shared.owner.iter().enumerate() {
            let owner = owner.load(Ordering::SeqCst);
            if owner != UNOWNED {
                assigned[owner].push(partition);
            }
        }
        *shared.assigned.write() = assigned;
        info!(
            "queue {}: rebalanced {} partitions",
            shared.name,
            moves.len()
        );
    }
}

/// sleep_while_running sleeps in small slices so a shutdown is not stuck
/// behind a long rebalance interval.
fn sleep_while_running<E>(shared: &Shared<E>, interval: Duration) {
    let slice = Duration::from_millis(20);
    let mut slept = Duration::from_millis(0);
    while slept < interval && shared.running.load(Ordering::SeqCst) {
        let step = cmp::min(slice, interval - slept);
        thread::sleep(step);
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::balancer::throughput_weighted;
    use crate::partition::config::{PartitionPolicy, ThreadPolicy};
    use crate::utils::utils::tests::wait_until;

    #[derive(Clone)]
    struct CountingConsumer {
        received: Arc<AtomicUsize>,
        idle_calls: Arc<AtomicUsize>,
        /// While the gate is up consume busy waits, simulating a slow
        /// downstream writer.
        gate: Arc<AtomicBool>,
    }

    impl CountingConsumer {
        fn new() -> CountingConsumer {
            CountingConsumer {
                received: Arc::new(AtomicUsize::new(0)),
                idle_calls: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl BatchConsumer<u64> for CountingConsumer {
        fn consume(&self, batch: Vec<u64>) {
            while self.gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            self.received.fetch_add(batch.len(), Ordering::SeqCst);
        }

        fn on_idle(&self) {
            self.idle_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_all_items_reach_consumer() {
        let consumer = CountingConsumer::new();
        let received = consumer.received.clone();
        let queue = PartitionedQueue::new(
            QueueConfig::new("drain-test")
                .threads(ThreadPolicy::Fixed(2))
                .partitions(PartitionPolicy::Fixed(4))
                .buffer_size(1000)
                .min_idle_ms(1)
                .max_idle_ms(10),
            Box::new(consumer),
        );
        for value in 0..1000u64 {
            assert!(queue.produce(value));
        }
        wait_until(
            || received.load(Ordering::SeqCst) == 1000,
            Duration::from_secs(5),
        );
        queue.shutdown();
        assert_eq!(received.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_produce_false_after_shutdown() {
        let consumer = CountingConsumer::new();
        let queue = PartitionedQueue::new(QueueConfig::new("stopped-test"), Box::new(consumer));
        assert!(queue.produce(1));
        queue.shutdown();
        assert!(!queue.produce(2));
    }

    #[test]
    fn test_if_possible_drops_when_full() {
        let consumer = CountingConsumer::new();
        let gate = consumer.gate.clone();
        gate.store(true, Ordering::SeqCst);
        let queue = PartitionedQueue::new(
            QueueConfig::new("drop-test")
                .strategy(BufferStrategy::IfPossible)
                .buffer_size(5)
                .min_idle_ms(1)
                .max_idle_ms(5),
            Box::new(consumer),
        );
        // The worker is stuck in consume behind the gate, so the single
        // partition eventually fills and produce starts returning false.
        wait_until(
            || {
                queue.produce(0);
                !queue.produce(0)
            },
            Duration::from_secs(2),
        );
        gate.store(false, Ordering::SeqCst);
        queue.shutdown();
    }

    #[test]
    fn test_shutdown_dispatches_remainder() {
        let consumer = CountingConsumer::new();
        let received = consumer.received.clone();
        let queue = PartitionedQueue::new(
            QueueConfig::new("remainder-test")
                .partitions(PartitionPolicy::Fixed(2))
                .min_idle_ms(500)
                .max_idle_ms(500),
            Box::new(consumer),
        );
        for value in 0..200u64 {
            assert!(queue.produce(value));
        }
        // The worker is most likely still in its idle backoff, the final
        // drain on shutdown must pick up whatever it has not.
        queue.shutdown();
        assert_eq!(received.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_stats_reflect_partition_usage() {
        let consumer = CountingConsumer::new();
        let gate = consumer.gate.clone();
        let received = consumer.received.clone();
        gate.store(true, Ordering::SeqCst);
        let queue = PartitionedQueue::new(
            QueueConfig::new("stats-test")
                .partitions(PartitionPolicy::Fixed(4))
                .strategy(BufferStrategy::IfPossible)
                .buffer_size(100)
                .min_idle_ms(1)
                .max_idle_ms(5)
                .selector(Box::new(|value: &u64, count| *value as usize % count)),
            Box::new(consumer),
        );
        // Park the worker inside consume. The trigger routes to the last
        // partition so the drain cycle that picks it up has already walked
        // the earlier ones.
        queue.produce(3);
        wait_until(|| queue.stats().total_used() == 0, Duration::from_secs(2));
        for value in 1..=20u64 {
            assert!(queue.produce(value));
        }
        let stats = queue.stats();
        assert_eq!(stats.partition_count(), 4);
        assert_eq!(stats.buffer_size(), 100);
        assert_eq!(stats.total_capacity(), 400);
        assert_eq!(stats.total_used(), 20);
        for partition in 0..4 {
            assert_eq!(stats.partition_used(partition), 5);
            assert!((stats.partition_used_percentage(partition) - 5.0).abs() < 0.001);
        }
        // The snapshot is immutable, later produces do not change it.
        assert!(queue.produce(0));
        assert_eq!(stats.total_used(), 20);
        gate.store(false, Ordering::SeqCst);
        wait_until(
            || received.load(Ordering::SeqCst) == 22,
            Duration::from_secs(5),
        );
        queue.shutdown();
    }

    #[test]
    fn test_on_idle_called_when_empty() {
        let consumer = CountingConsumer::new();
        let idle_calls = consumer.idle_calls.clone();
        let queue = PartitionedQueue::new(
            QueueConfig::new("idle-test").min_idle_ms(1).max_idle_ms(5),
            Box::new(consumer),
        );
        wait_until(
            || idle_calls.load(Ordering::SeqCst) > 0,
            Duration::from_secs(2),
        );
        queue.shutdown();
    }

    #[test]
    fn test_workers_reduced_to_partition_count() {
        let consumer = CountingConsumer::new();
        let queue = PartitionedQueue::new(
            QueueConfig::new("reduce-test")
                .threads(ThreadPolicy::Fixed(4))
                .partitions(PartitionPolicy::Fixed(2)),
            Box::new(consumer),
        );
        assert_eq!(queue.partition_count(), 2);
        assert_eq!(queue.worker_count(), 2);
        queue.shutdown();
    }

    #[test]
    fn test_each_partition_assigned_to_one_worker() {
        let consumer = CountingConsumer::new();
        let queue = PartitionedQueue::new(
            QueueConfig::new("assign-test")
                .threads(ThreadPolicy::Fixed(3))
                .partitions(PartitionPolicy::Fixed(9)),
            Box::new(consumer),
        );
        let assigned = queue.shared.assigned.read().clone();
        assert_eq!(assigned.len(), 3);
        let mut seen = vec![false; 9];
        for worker_partitions in &assigned {
            for &partition in worker_partitions {
                assert!(!seen[partition], "partition {} assigned twice", partition);
                seen[partition] = true;
            }
        }
        assert!(seen.iter().all(|&assigned| assigned));
        queue.shutdown();
    }

    #[test]
    fn test_rebalancing_gating() {
        let single = PartitionedQueue::new(
            QueueConfig::new("rebal-single")
                .partitions(PartitionPolicy::Fixed(4))
                .balancer(throughput_weighted(), 100),
            Box::new(CountingConsumer::new()),
        );
        assert!(!single.rebalancing_enabled());
        single.shutdown();

        let without = PartitionedQueue::new(
            QueueConfig::new("rebal-none")
                .threads(ThreadPolicy::Fixed(2))
                .partitions(PartitionPolicy::Fixed(4)),
            Box::new(CountingConsumer::new()),
        );
        assert!(!without.rebalancing_enabled());
        without.shutdown();

        let with = PartitionedQueue::new(
            QueueConfig::new("rebal-on")
                .threads(ThreadPolicy::Fixed(2))
                .partitions(PartitionPolicy::Fixed(4))
                .balancer(throughput_weighted(), 100),
            Box::new(CountingConsumer::new()),
        );
        assert!(with.rebalancing_enabled());
        with.shutdown();
    }

    #[test]
    fn test_rebalance_no_loss_under_skew() {
        let consumer = CountingConsumer::new();
        let received = consumer.received.clone();
        let queue = PartitionedQueue::new(
            QueueConfig::new("rebal-skew")
                .threads(ThreadPolicy::Fixed(2))
                .partitions(PartitionPolicy::Fixed(8))
                .buffer_size(2000)
                .min_idle_ms(1)
                .max_idle_ms(10)
                .balancer(throughput_weighted(), 50)
                // Nine out of ten elements land on partition zero.
                .selector(Box::new(|value: &u64, count| {
                    if value % 10 < 9 {
                        0
                    } else {
                        *value as usize % count
                    }
                })),
            Box::new(consumer),
        );
        for value in 0..5000u64 {
            assert!(queue.produce(value));
        }
        wait_until(
            || received.load(Ordering::SeqCst) == 5000,
            Duration::from_secs(10),
        );
        queue.shutdown();
        assert_eq!(received.load(Ordering::SeqCst), 5000);
    }

    #[test]
    fn test_idle_delay_backoff() {
        assert_eq!(idle_delay(1, 50, 0), 1);
        assert_eq!(idle_delay(1, 50, 1), 2);
        assert_eq!(idle_delay(1, 50, 3), 8);
        assert_eq!(idle_delay(1, 50, 10), 50);
        assert_eq!(idle_delay(5, 5, 4), 5);
        // A huge idle streak must not overflow the shift.
        assert_eq!(idle_delay(1, 50, 1000), 50);
    }
}
