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

/// PartitionUsage is one partition's entry in a stats snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionUsage {
    pub partition: usize,
    pub used: usize,
    pub used_percentage: f64,
}

/// QueueStats is an immutable point in time snapshot of a partitioned queue's
/// buffer usage. Taking a snapshot never blocks producers or drain workers,
/// the numbers can be stale the moment they are read.
#[derive(Debug, Clone)]
pub struct QueueStats {
    buffer_size: usize,
    used: Vec<usize>,
}

impl QueueStats {
    pub(crate) fn new(buffer_size: usize, used: Vec<usize>) -> QueueStats {
        QueueStats { buffer_size, used }
    }

    /// partition_count returns the number of partitions in the snapshot.
    pub fn partition_count(&self) -> usize {
        self.used.len()
    }

    /// buffer_size returns the per partition capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// total_capacity is buffer_size summed over every partition.
    pub fn total_capacity(&self) -> usize {
        self.buffer_size * self.used.len()
    }

    /// total_used is the number of buffered elements across all partitions.
    pub fn total_used(&self) -> usize {
        self.used.iter().sum()
    }

    /// total_used_percentage is total usage as a percentage of total capacity.
    pub fn total_used_percentage(&self) -> f64 {
        let capacity = self.total_capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.total_used() as f64 * 100.0 / capacity as f64
    }

    /// partition_used returns the buffered element count of one partition.
    pub fn partition_used(&self, partition: usize) -> usize {
        self.used[partition]
    }

    /// partition_used_percentage returns one partition's usage against its own
    /// buffer.
    pub fn partition_used_percentage(&self, partition: usize) -> f64 {
        if self.buffer_size == 0 {
            return 0.0;
        }
        self.used[partition] as f64 * 100.0 / self.buffer_size as f64
    }

    /// top_n returns the n fullest partitions, fullest first. Asking for more
    /// than the partition count returns them all.
    pub fn top_n(&self, n: usize) -> Vec<PartitionUsage> {
        let mut usages: Vec<PartitionUsage> = self
            .used
            .iter()
            .enumerate()
            .map(|(partition, &used)| PartitionUsage {
                partition,
                used,
                used_percentage: self.partition_used_percentage(partition),
            })
            .collect();
        usages.sort_by(|a, b| b.used.cmp(&a.used));
        usages.truncate(n);
        usages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals() {
        let stats = QueueStats::new(100, vec![10, 0, 30, 0]);
        assert_eq!(stats.partition_count(), 4);
        assert_eq!(stats.buffer_size(), 100);
        assert_eq!(stats.total_capacity(), 400);
        assert_eq!(stats.total_used(), 40);
        assert!((stats.total_used_percentage() - 10.0).abs() < 0.001);
        assert_eq!(stats.partition_used(2), 30);
        assert!((stats.partition_used_percentage(2) - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_top_n_orders_by_usage() {
        let stats = QueueStats::new(100, vec![20, 5, 15, 10]);
        let top = stats.top_n(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].partition, 0);
        assert_eq!(top[0].used, 20);
        assert_eq!(top[1].partition, 2);
        assert_eq!(top[1].used, 15);
        // Asking for more than we have returns everything.
        assert_eq!(stats.top_n(10).len(), 4);
    }
}
