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
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};

/// ChannelBatchQueue backs the queue with an unbounded crossbeam channel
/// instead of a single lock around a list. Producers append straight into the
/// channel so producer side contention never touches the consumer side, which
/// is where this variant wins once many producers pile up. A popper assembles
/// its batch by polling the channel with a timeout.
pub struct ChannelBatchQueue<E> {
    max_batch_size: usize,
    sender: Sender<E>,
    receiver: Receiver<E>,
    appending: AtomicBool,
}

impl<E: Send> ChannelBatchQueue<E> {
    /// new returns a queue that hands out batches of at most max_batch_size.
    pub fn new(max_batch_size: usize) -> ChannelBatchQueue<E> {
        assert!(max_batch_size > 0, "max_batch_size must be positive");
        let (sender, receiver) = unbounded();
        ChannelBatchQueue {
            max_batch_size,
            sender,
            receiver,
            appending: AtomicBool::new(true),
        }
    }
}

impl<E: Send> BlockingBatchQueue<E> for ChannelBatchQueue<E> {
    fn put_many(&self, elements: Vec<E>) {
        for element in elements {
            // The queue owns both channel ends, the send side can not
            // disconnect while self is alive.
            self.sender.send(element).unwrap();
        }
    }

    fn pop_many(&self) -> Vec<E> {
        let mut batch = Vec::with_capacity(self.max_batch_size);
        loop {
            if batch.len() >= self.max_batch_size {
                break;
            }
            // Checked before every poll so a drained closed queue returns the
            // partial batch right away instead of eating a full timeout.
            if !self.appending.load(Ordering::SeqCst) && self.receiver.is_empty() {
                break;
            }
            match self.receiver.recv_timeout(POP_WAIT_INTERVAL) {
                Ok(element) => batch.push(element),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        batch
    }

    fn no_further_appending(&self) {
        // Poppers parked inside recv_timeout observe the flag on their next
        // bounded wake, there is nothing to notify here.
        self.appending.store(false, Ordering::SeqCst);
    }

    fn further_appending(&self) {
        self.appending.store(true, Ordering::SeqCst);
    }

    fn size(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "max_batch_size must be positive")]
    fn test_zero_batch_size_is_rejected() {
        ChannelBatchQueue::<u64>::new(0);
    }

    #[test]
    fn test_size_tracks_channel_len() {
        let queue = ChannelBatchQueue::new(4);
        queue.put_many(vec![1, 2, 3]);
        assert_eq!(queue.size(), 3);
        queue.no_further_appending();
        assert_eq!(queue.pop_many(), vec![1, 2, 3]);
        assert_eq!(queue.size(), 0);
    }
}
