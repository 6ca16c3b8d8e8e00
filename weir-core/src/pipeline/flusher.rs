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
use crate::queue::queue::{new_queue, QueueKind};
use anyhow::Result;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// BatchSource builds one round's worth of write requests. Every persistence
/// worker of the storage pipeline is one source.
pub trait BatchSource<E>: Send + Sync {
    /// prepare fills out with the requests this source accumulated since the
    /// previous round.
    fn prepare(&self, out: &mut Vec<E>);

    /// end_of_round is called after this source's requests were handed to the
    /// queue, with the time elapsed since the previous round started.
    fn end_of_round(&self, _elapsed: Duration) {}
}

/// BatchSink is the slow downstream bulk write, typically the storage client.
pub trait BatchSink<E>: Send + Sync {
    fn write(&self, batch: Vec<E>) -> Result<()>;
}

/// FlushConfig sizes one flush round.
pub struct FlushConfig {
    /// max_batch_size caps the batch a sync worker hands to the sink.
    pub max_batch_size: usize,
    /// sync_threads is the number of workers draining the queue into the sink.
    pub sync_threads: usize,
    /// queue_kind selects the blocking batch queue implementation in between.
    pub queue_kind: QueueKind,
    /// period is the delay between two rounds of the periodic runner.
    pub period: Duration,
}

impl Default for FlushConfig {
    fn default() -> FlushConfig {
        FlushConfig {
            max_batch_size: 50_000,
            sync_threads: 2,
            queue_kind: QueueKind::Channel,
            period: Duration::from_secs(25),
        }
    }
}

/// Flusher moves batches from the prepare stage into the storage sink. Each
/// round spins one prepare thread per source and a pool of sync workers around
/// a fresh blocking batch queue: the sources append in bulk, the queue is
/// closed once every prepare thread finished, and the sync workers drain it to
/// empty. A sink failure is counted and logged, the rest of the round still
/// flushes.
pub struct Flusher<E> {
    sources: Vec<Arc<dyn BatchSource<E>>>,
    sink: Arc<dyn BatchSink<E>>,
    config: FlushConfig,
    stop: AtomicBool,
    error_count: AtomicU64,
    last_round_at: Mutex<Instant>,
}

impl<E: Send + 'static> Flusher<E> {
    /// new returns a flusher over the given sources and sink.
    pub fn new(
        sources: Vec<Arc<dyn BatchSource<E>>>,
        sink: Arc<dyn BatchSink<E>>,
        config: FlushConfig,
    ) -> Flusher<E> {
        assert!(config.sync_threads > 0, "sync_threads must be positive");
        Flusher {
            sources,
            sink,
            config,
            stop: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
            last_round_at: Mutex::new(Instant::now()),
        }
    }

    /// flush_round runs one complete prepare and drain cycle.
    pub fn flush_round(&self) {
        let round_start = Instant::now();
        let since_last_round = {
            let mut last_round_at = self.last_round_at.lock();
            let elapsed = last_round_at.elapsed();
            *last_round_at = Instant::now();
            elapsed
        };
        let queue = new_queue::<E>(self.config.queue_kind, self.config.max_batch_size);
        crossbeam::thread::scope(|s| {
            let mut prepare_handles = Vec::with_capacity(self.sources.len());
            for source in &self.sources {
                let queue = queue.clone();
                prepare_handles.push(s.spawn(move |_| {
                    let prepare_start = Instant::now();
                    let mut requests = Vec::with_capacity(5000);
                    source.prepare(&mut requests);
                    if !requests.is_empty() {
                        queue.put_many(requests);
                    }
                    source.end_of_round(since_last_round);
                    debug!("prepare stage took {:?}", prepare_start.elapsed());
                }));
            }
            let mut sync_handles = Vec::with_capacity(self.config.sync_threads);
            for _ in 0..self.config.sync_threads {
                let queue = queue.clone();
                sync_handles.push(s.spawn(move |_| loop {
                    let partition = queue.pop_many();
                    if partition.is_empty() {
                        break;
                    }
                    let execute_start = Instant::now();
                    if let Err(err) = self.sink.write(partition) {
                        self.error_count.fetch_add(1, Ordering::SeqCst);
                        error!("storage write failed {:?}", err);
                    }
                    debug!("execute stage took {:?}", execute_start.elapsed());
                }));
            }
            // The queue only stops handing out partial batches once the whole
            // prepare stage is done, so close strictly after the joins.
            for prepare in prepare_handles {
                prepare.join().unwrap();
            }
            queue.no_further_appending();
            for sync in sync_handles {
                sync.join().unwrap();
            }
        })
        .unwrap();
        debug!("flush round took {:?}", round_start.elapsed());
    }

    /// error_count returns how many sink writes failed since construction.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// start spawns the periodic runner. It flushes every config.period until
    /// shutdown, then runs one last round so nothing prepared is left behind.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        thread::spawn(move || {
            info!("spinning persistence flusher");
            loop {
                let mut slept = Duration::from_millis(0);
                while slept < self.config.period && !self.stop.load(Ordering::SeqCst) {
                    let step = std::cmp::min(
                        Duration::from_millis(100),
                        self.config.period - slept,
                    );
                    thread::sleep(step);
                    slept += step;
                }
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                self.flush_round();
            }
            // Drain whatever the sources accumulated while we were stopping.
            self.flush_round();
            info!("persistence flusher stopped");
        })
    }

    /// shutdown asks the periodic runner to stop after a final round.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    /// FixedSource hands out one fixed range every round.
    struct FixedSource {
        from: u64,
        to: u64,
        rounds: Arc<AtomicUsize>,
    }

    impl BatchSource<u64> for FixedSource {
        fn prepare(&self, out: &mut Vec<u64>) {
            out.extend(self.from..self.to);
        }

        fn end_of_round(&self, _elapsed: Duration) {
            self.rounds.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CollectingSink {
        written: Mutex<Vec<u64>>,
        max_batch_seen: AtomicUsize,
        /// Write calls that should fail before the sink starts accepting.
        fail_first: AtomicUsize,
        rejected: Mutex<Vec<u64>>,
    }

    impl CollectingSink {
        fn new(fail_first: usize) -> CollectingSink {
            CollectingSink {
                written: Mutex::new(Vec::new()),
                max_batch_seen: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
                rejected: Mutex::new(Vec::new()),
            }
        }
    }

    impl BatchSink<u64> for CollectingSink {
        fn write(&self, batch: Vec<u64>) -> Result<()> {
            let mut max_seen = self.max_batch_seen.load(Ordering::SeqCst);
            while batch.len() > max_seen {
                match self.max_batch_seen.compare_exchange(
                    max_seen,
                    batch.len(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(current) => max_seen = current,
                }
            }
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                self.rejected.lock().extend(batch);
                return Err(anyhow!("storage unavailable"));
            }
            self.written.lock().extend(batch);
            Ok(())
        }
    }

    #[test]
    fn test_round_moves_every_request() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let sources: Vec<Arc<dyn BatchSource<u64>>> = (0..3)
            .map(|idx| {
                Arc::new(FixedSource {
                    from: idx * 1000,
                    to: idx * 1000 + 1000,
                    rounds: rounds.clone(),
                }) as Arc<dyn BatchSource<u64>>
            })
            .collect();
        let sink = Arc::new(CollectingSink::new(0));
        let flusher = Flusher::new(
            sources,
            sink.clone(),
            FlushConfig {
                max_batch_size: 100,
                sync_threads: 2,
                queue_kind: QueueKind::Channel,
                period: Duration::from_secs(25),
            },
        );
        flusher.flush_round();
        let written = sink.written.lock();
        assert_eq!(written.len(), 3000);
        let distinct: HashSet<u64> = written.iter().cloned().collect();
        assert_eq!(distinct.len(), 3000);
        assert!(sink.max_batch_seen.load(Ordering::SeqCst) <= 100);
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
        assert_eq!(flusher.error_count(), 0);
    }

    #[test]
    fn test_sink_failure_does_not_abort_round() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let sources: Vec<Arc<dyn BatchSource<u64>>> = vec![Arc::new(FixedSource {
            from: 0,
            to: 500,
            rounds,
        })];
        let sink = Arc::new(CollectingSink::new(1));
        let flusher = Flusher::new(
            sources,
            sink.clone(),
            FlushConfig {
                max_batch_size: 50,
                sync_threads: 1,
                queue_kind: QueueKind::Condvar,
                period: Duration::from_secs(25),
            },
        );
        flusher.flush_round();
        assert_eq!(flusher.error_count(), 1);
        // The failed batch is accounted for, everything else still flushed.
        let written_len = sink.written.lock().len();
        let rejected_len = sink.rejected.lock().len();
        assert_eq!(written_len + rejected_len, 500);
        assert!(rejected_len > 0);
    }

    #[test]
    fn test_round_over_empty_sources_terminates() {
        struct EmptySource;
        impl BatchSource<u64> for EmptySource {
            fn prepare(&self, _out: &mut Vec<u64>) {}
        }
        let sink = Arc::new(CollectingSink::new(0));
        let flusher = Flusher::new(
            vec![Arc::new(EmptySource) as Arc<dyn BatchSource<u64>>],
            sink.clone(),
            FlushConfig::default(),
        );
        flusher.flush_round();
        assert!(sink.written.lock().is_empty());
    }

    #[test]
    fn test_periodic_runner_flushes_until_shutdown() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let sources: Vec<Arc<dyn BatchSource<u64>>> = vec![Arc::new(FixedSource {
            from: 0,
            to: 10,
            rounds: rounds.clone(),
        })];
        let sink = Arc::new(CollectingSink::new(0));
        let flusher = Arc::new(Flusher::new(
            sources,
            sink.clone(),
            FlushConfig {
                max_batch_size: 100,
                sync_threads: 1,
                queue_kind: QueueKind::ParkingLot,
                period: Duration::from_millis(50),
            },
        ));
        let runner = flusher.clone().start();
        crate::utils::utils::tests::wait_until(
            || rounds.load(Ordering::SeqCst) >= 2,
            Duration::from_secs(5),
        );
        flusher.shutdown();
        runner.join().unwrap();
        // The final round after shutdown ran too.
        let rounds_after = rounds.load(Ordering::SeqCst);
        assert!(rounds_after >= 3);
        assert_eq!(sink.written.lock().len(), 10 * rounds_after);
    }
}
