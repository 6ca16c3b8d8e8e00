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
use crate::partition::balancer::DrainBalancer;
use std::cmp;

/// ThreadPolicy decides how many drain workers a partitioned queue runs.
pub enum ThreadPolicy {
    /// Exactly this many workers.
    Fixed(usize),
    /// A multiple of the machine's core count, at least one worker.
    CpuCores(f64),
}

impl ThreadPolicy {
    /// resolve turns the policy into a concrete worker count.
    pub fn resolve(&self) -> usize {
        match self {
            ThreadPolicy::Fixed(count) => *count,
            ThreadPolicy::CpuCores(multiplier) => {
                cmp::max(1, (num_cpus::get() as f64 * multiplier) as usize)
            }
        }
    }
}

/// PartitionPolicy decides how many partition buffers the queue allocates.
pub enum PartitionPolicy {
    /// Exactly this many partitions.
    Fixed(usize),
    /// A multiple of the resolved worker count.
    ThreadMultiply(usize),
}

impl PartitionPolicy {
    /// resolve turns the policy into a concrete partition count.
    pub fn resolve(&self, workers: usize) -> usize {
        match self {
            PartitionPolicy::Fixed(count) => *count,
            PartitionPolicy::ThreadMultiply(multiplier) => workers * multiplier,
        }
    }
}

/// BufferStrategy controls what produce does against a full partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStrategy {
    /// Block the producer until the partition has room. Nothing is dropped.
    Blocking,
    /// Drop the element and return false. Producers never stall.
    IfPossible,
}

/// PartitionSelector routes an element to a partition index, given the element
/// and the partition count. The returned index is taken modulo the partition
/// count.
pub type PartitionSelector<E> = Box<dyn Fn(&E, usize) -> usize + Send + Sync>;

/// QueueConfig collects everything a partitioned queue needs at construction.
/// Built with chained setters, unset knobs keep the defaults below.
pub struct QueueConfig<E> {
    pub(crate) name: String,
    pub(crate) threads: ThreadPolicy,
    pub(crate) partitions: PartitionPolicy,
    pub(crate) buffer_size: usize,
    pub(crate) strategy: BufferStrategy,
    pub(crate) min_idle_ms: u64,
    pub(crate) max_idle_ms: u64,
    pub(crate) selector: Option<PartitionSelector<E>>,
    pub(crate) balancer: Option<Box<dyn DrainBalancer>>,
    pub(crate) rebalance_interval_ms: u64,
}

impl<E> QueueConfig<E> {
    /// new returns a config with a single drain worker, one partition per
    /// worker, a 10k element buffer and blocking produce.
    pub fn new(name: &str) -> QueueConfig<E> {
        QueueConfig {
            name: name.to_string(),
            threads: ThreadPolicy::Fixed(1),
            partitions: PartitionPolicy::ThreadMultiply(1),
            buffer_size: 10_000,
            strategy: BufferStrategy::Blocking,
            min_idle_ms: 1,
            max_idle_ms: 50,
            selector: None,
            balancer: None,
            rebalance_interval_ms: 0,
        }
    }

    pub fn threads(mut self, threads: ThreadPolicy) -> QueueConfig<E> {
        self.threads = threads;
        self
    }

    pub fn partitions(mut self, partitions: PartitionPolicy) -> QueueConfig<E> {
        self.partitions = partitions;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> QueueConfig<E> {
        self.buffer_size = buffer_size;
        self
    }

    pub fn strategy(mut self, strategy: BufferStrategy) -> QueueConfig<E> {
        self.strategy = strategy;
        self
    }

    pub fn min_idle_ms(mut self, min_idle_ms: u64) -> QueueConfig<E> {
        self.min_idle_ms = min_idle_ms;
        self
    }

    pub fn max_idle_ms(mut self, max_idle_ms: u64) -> QueueConfig<E> {
        self.max_idle_ms = max_idle_ms;
        self
    }

    /// selector installs a custom partition routing function. Without one the
    /// queue spreads elements round robin.
    pub fn selector(mut self, selector: PartitionSelector<E>) -> QueueConfig<E> {
        self.selector = Some(selector);
        self
    }

    /// balancer enables periodic partition rebalancing with the given
    /// interval. Ignored for single worker queues.
    pub fn balancer(mut self, balancer: Box<dyn DrainBalancer>, interval_ms: u64) -> QueueConfig<E> {
        self.balancer = Some(balancer);
        self.rebalance_interval_ms = interval_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_policy_resolve() {
        assert_eq!(ThreadPolicy::Fixed(4).resolve(), 4);
        assert_eq!(ThreadPolicy::CpuCores(1.0).resolve(), num_cpus::get());
        // A tiny multiplier still yields at least one worker.
        assert_eq!(ThreadPolicy::CpuCores(0.0001).resolve(), 1);
    }

    #[test]
    fn test_partition_policy_resolve() {
        assert_eq!(PartitionPolicy::Fixed(8).resolve(3), 8);
        assert_eq!(PartitionPolicy::ThreadMultiply(2).resolve(3), 6);
    }
}
