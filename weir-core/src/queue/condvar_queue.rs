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
use std::cmp;
use std::sync::{Condvar, Mutex};

/// QueueState is the shared state of the queue. The appending flag lives under
/// the same lock as the backing list so a popper checking the flag can never
/// race a closer setting it and then sleep past the close.
struct QueueState<E> {
    elements: Vec<E>,
    appending: bool,
}

/// CondvarBatchQueue guards the backing list with a single std mutex and parks
/// poppers on a condvar. This is the simplest of the three queue
/// implementations, one lock, one wait loop.
pub struct CondvarBatchQueue<E> {
    max_batch_size: usize,
    state: Mutex<QueueState<E>>,
    batch_ready: Condvar,
}

impl<E: Send> CondvarBatchQueue<E> {
    /// new returns a queue that hands out batches of at most max_batch_size.
    pub fn new(max_batch_size: usize) -> CondvarBatchQueue<E> {
        assert!(max_batch_size > 0, "max_batch_size must be positive");
        CondvarBatchQueue {
            max_batch_size,
            state: Mutex::new(QueueState {
                elements: Vec::new(),
                appending: true,
            }),
            batch_ready: Condvar::new(),
        }
    }
}

impl<E: Send> BlockingBatchQueue<E> for CondvarBatchQueue<E> {
    fn put_many(&self, mut elements: Vec<E>) {
        let mut state = self.state.lock().unwrap();
        state.elements.append(&mut elements);
        if state.elements.len() >= self.max_batch_size {
            self.batch_ready.notify_one();
        }
    }

    /// pop_many drains up to max_batch_size elements from the head. Draining
    /// the head of a Vec shifts the whole remaining tail, so a pop against a
    /// very large backlog costs O(backlog). Queue depths in the write pipeline
    /// stay in the tens of thousands, where the copy is cheaper than a fancier
    /// structure.
    fn pop_many(&self) -> Vec<E> {
        let mut state = self.state.lock().unwrap();
        while state.elements.len() < self.max_batch_size && state.appending {
            let (guard, _) = self
                .batch_ready
                .wait_timeout(state, POP_WAIT_INTERVAL)
                .unwrap();
            state = guard;
        }
        let batch_len = cmp::min(self.max_batch_size, state.elements.len());
        if batch_len == 0 {
            return Vec::new();
        }
        state.elements.drain(..batch_len).collect()
    }

    fn no_further_appending(&self) {
        let mut state = self.state.lock().unwrap();
        state.appending = false;
        self.batch_ready.notify_all();
    }

    fn further_appending(&self) {
        let mut state = self.state.lock().unwrap();
        state.appending = true;
        self.batch_ready.notify_all();
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().elements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "max_batch_size must be positive")]
    fn test_zero_batch_size_is_rejected() {
        CondvarBatchQueue::<u64>::new(0);
    }

    #[test]
    fn test_single_thread_round_trip() {
        let queue = CondvarBatchQueue::new(2);
        queue.put_many(vec![1, 2, 3]);
        assert_eq!(queue.pop_many(), vec![1, 2]);
        queue.no_further_appending();
        assert_eq!(queue.pop_many(), vec![3]);
        assert!(queue.pop_many().is_empty());
    }
}
