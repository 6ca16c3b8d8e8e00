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
use crate::queue::queue::{BlockingBatchQueue, POP_WAIT_INTERVAL};
use parking_lot::{Condvar, Mutex};
use std::cmp;

/// QueueState is the list plus the appending flag, kept under one lock for the
/// same reason as the condvar variant.
struct QueueState<E> {
    elements: Vec<E>,
    appending: bool,
}

/// ParkingLotBatchQueue runs the exact algorithm of CondvarBatchQueue on
/// parking_lot primitives. Functionally equivalent, it exists so the benchmark
/// can compare the primitive overhead against std, and it never poisons on a
/// panicking peer.
pub struct ParkingLotBatchQueue<E> {
    max_batch_size: usize,
    state: Mutex<QueueState<E>>,
    batch_ready: Condvar,
}

impl<E: Send> ParkingLotBatchQueue<E> {
    /// new returns a queue that hands out batches of at most max_batch_size.
    pub fn new(max_batch_size: usize) -> ParkingLotBatchQueue<E> {
        assert!(max_batch_size > 0, "max_batch_size must be positive");
        ParkingLotBatchQueue {
            max_batch_size,
            state: Mutex::new(QueueState {
                elements: Vec::new(),
                appending: true,
            }),
            batch_ready: Condvar::new(),
        }
    }
}

impl<E: Send> BlockingBatchQueue<E> for ParkingLotBatchQueue<E> {
    fn put_many(&self, mut elements: Vec<E>) {
        let mut state = self.state.lock();
        state.elements.append(&mut elements);
        if state.elements.len() >= self.max_batch_size {
            self.batch_ready.notify_one();
        }
    }

    /// pop_many carries the same O(backlog) head drain note as the condvar
    /// variant.
    fn pop_many(&self) -> Vec<E> {
        let mut state = self.state.lock();
        while state.elements.len() < self.max_batch_size && state.appending {
            self.batch_ready.wait_for(&mut state, POP_WAIT_INTERVAL);
        }
        let batch_len = cmp::min(self.max_batch_size, state.elements.len());
        if batch_len == 0 {
            return Vec::new();
        }
        state.elements.drain(..batch_len).collect()
    }

    fn no_further_appending(&self) {
        let mut state = self.state.lock();
        state.appending = false;
        self.batch_ready.notify_all();
    }

    fn further_appending(&self) {
        let mut state = self.state.lock();
        state.appending = true;
        self.batch_ready.notify_all();
    }

    fn size(&self) -> usize {
        self.state.lock().elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "max_batch_size must be positive")]
    fn test_zero_batch_size_is_rejected() {
        ParkingLotBatchQueue::<u64>::new(0);
    }

    #[test]
    fn test_single_thread_round_trip() {
        let queue = ParkingLotBatchQueue::new(2);
        queue.put_many(vec![1, 2, 3]);
        assert_eq!(queue.pop_many(), vec![1, 2]);
        queue.no_further_appending();
        assert_eq!(queue.pop_many(), vec![3]);
        assert!(queue.pop_many().is_empty());
    }
}
