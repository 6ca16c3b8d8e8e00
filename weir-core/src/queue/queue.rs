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
use crate::queue::channel_queue::ChannelBatchQueue;
use crate::queue::condvar_queue::CondvarBatchQueue;
use crate::queue::parking_lot_queue::ParkingLotBatchQueue;
use std::sync::Arc;
use std::time::Duration;

/// POP_WAIT_INTERVAL is the bounded wait used by a blocked pop_many. A popper
/// never sleeps longer than this without re-checking the exit conditions, so a
/// close signal is observed within one interval even if the wake notification
/// is missed.
pub const POP_WAIT_INTERVAL: Duration = Duration::from_millis(1000);

/// BlockingBatchQueue decouples a high rate stream of incoming elements from a
/// slower batch writer. Producers append in bulk with put_many while consumers
/// take batches of at most max_batch_size with pop_many. The queue starts in
/// appending mode; once no_further_appending is called every blocked popper
/// drains what is left and the draining loop terminates on the first empty
/// batch. further_appending reopens the queue for another round without losing
/// anything accumulated in between.
pub trait BlockingBatchQueue<E>: Send + Sync {
    /// put_many appends all the given elements to the tail of the queue in
    /// order. Safe to call from any number of producer threads.
    fn put_many(&self, elements: Vec<E>);

    /// pop_many removes up to max_batch_size elements from the head of the
    /// queue. Blocks while the queue holds fewer than max_batch_size elements
    /// and is still in appending mode. Once the queue is closed it returns
    /// whatever is available, an empty batch means closed and fully drained.
    fn pop_many(&self) -> Vec<E>;

    /// no_further_appending flips the queue out of appending mode and wakes
    /// every blocked popper so the remaining elements can be drained.
    fn no_further_appending(&self);

    /// further_appending puts the queue back into appending mode for the next
    /// round of batching.
    fn further_appending(&self);

    /// size returns a best effort snapshot of the element count. It can be
    /// stale the moment it returns, callers must treat it as advisory only.
    fn size(&self) -> usize;
}

/// QueueKind selects one of the queue implementations. All three honour the
/// same contract, they differ only in the synchronization primitive carrying
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Single std mutex around the backing list with a condvar for waiters.
    Condvar,
    /// Same algorithm on parking_lot's lock and condvar.
    ParkingLot,
    /// Unbounded crossbeam channel polled with a timeout.
    Channel,
}

impl QueueKind {
    /// all returns every queue kind, in the order the benchmark reports them.
    pub fn all() -> [QueueKind; 3] {
        [QueueKind::Condvar, QueueKind::ParkingLot, QueueKind::Channel]
    }

    /// name returns a short label for logs and benchmark tables.
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Condvar => "condvar",
            QueueKind::ParkingLot => "parking-lot",
            QueueKind::Channel => "channel",
        }
    }
}

/// new_queue builds the queue implementation for the given kind. max_batch_size
/// must be positive, the constructors reject zero.
pub fn new_queue<E: Send + 'static>(
    kind: QueueKind,
    max_batch_size: usize,
) -> Arc<dyn BlockingBatchQueue<E>> {
    match kind {
        QueueKind::Condvar => Arc::new(CondvarBatchQueue::new(max_batch_size)),
        QueueKind::ParkingLot => Arc::new(ParkingLotBatchQueue::new(max_batch_size)),
        QueueKind::Channel => Arc::new(ChannelBatchQueue::new(max_batch_size)),
    }
}
