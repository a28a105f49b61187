/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

use crate::message::ReceivedMessage;
use crate::queue::QueueId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, TryLockError};

/// Per-queue buffer of pulled, not-yet-consumed messages.
///
/// Owned jointly by the pull scheduler (producer side) and the consumption
/// dispatcher (consumer side) of one queue. The `dropped` flag is set when a
/// rebalance revokes the queue; all in-flight work observes it at suspension
/// points and ceases without committing offsets.
///
/// The buffer holds messages keyed by offset. In concurrent mode, dispatched
/// batches are clones and entries stay buffered until [`remove`] computes the
/// new commit watermark: the lowest still-buffered offset, so out-of-order
/// completions can never commit past a gap. In orderly mode, [`take`] moves
/// entries into a staging area that is either [`commit_taken`] on success or
/// [`rollback_taken`] for redelivery.
///
/// [`remove`]: ProcessQueue::remove
/// [`take`]: ProcessQueue::take
/// [`commit_taken`]: ProcessQueue::commit_taken
/// [`rollback_taken`]: ProcessQueue::rollback_taken
#[derive(Debug)]
pub struct ProcessQueue {
    queue: QueueId,
    dropped: AtomicBool,
    inner: Mutex<Buffer>,
    consuming_lock: Arc<AsyncMutex<()>>,
}

#[derive(Debug, Default)]
struct Buffer {
    pending: BTreeMap<u64, ReceivedMessage>,
    consuming: BTreeMap<u64, ReceivedMessage>,
    bytes: u64,
    /// Highest offset ever buffered, the commit point once the buffer drains.
    max_seen: Option<u64>,
}

impl ProcessQueue {
    pub fn new(queue: QueueId) -> Self {
        Self {
            queue,
            dropped: AtomicBool::new(false),
            inner: Mutex::new(Buffer::default()),
            consuming_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn queue(&self) -> &QueueId {
        &self.queue
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// Buffers pulled messages. Ignored once the queue is dropped.
    pub fn put(&self, messages: &[ReceivedMessage]) {
        if self.is_dropped() {
            return;
        }
        let mut inner = self.inner.lock().expect("process queue lock poisoned");
        for message in messages {
            inner.bytes += message.message.body.len() as u64;
            inner.max_seen = Some(inner.max_seen.map_or(message.offset, |m| m.max(message.offset)));
            inner.pending.insert(message.offset, message.clone());
        }
    }

    /// Buffered messages, pending plus staged.
    pub fn message_count(&self) -> usize {
        let inner = self.inner.lock().expect("process queue lock poisoned");
        inner.pending.len() + inner.consuming.len()
    }

    pub fn has_pending(&self) -> bool {
        let inner = self.inner.lock().expect("process queue lock poisoned");
        !inner.pending.is_empty()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.inner.lock().expect("process queue lock poisoned").bytes
    }

    /// Offset distance between the newest and oldest buffered message.
    pub fn span(&self) -> u64 {
        let inner = self.inner.lock().expect("process queue lock poisoned");
        let lowest = inner
            .consuming
            .first_key_value()
            .or_else(|| inner.pending.first_key_value())
            .map(|(offset, _)| *offset);
        let highest = inner
            .pending
            .last_key_value()
            .or_else(|| inner.consuming.last_key_value())
            .map(|(offset, _)| *offset);
        match (lowest, highest) {
            (Some(low), Some(high)) => high.saturating_sub(low),
            _ => 0,
        }
    }

    /// Removes consumed messages and returns the new commit watermark: the
    /// lowest offset still buffered, or one past the highest offset ever seen
    /// once the buffer is empty. `None` when nothing was ever buffered.
    pub fn remove(&self, offsets: &[u64]) -> Option<u64> {
        let mut inner = self.inner.lock().expect("process queue lock poisoned");
        for offset in offsets {
            if let Some(message) = inner.pending.remove(offset) {
                inner.bytes = inner.bytes.saturating_sub(message.message.body.len() as u64);
            }
        }
        Self::watermark(&inner)
    }

    fn watermark(inner: &Buffer) -> Option<u64> {
        inner
            .consuming
            .first_key_value()
            .or_else(|| inner.pending.first_key_value())
            .map(|(offset, _)| *offset)
            .or_else(|| inner.max_seen.map(|m| m + 1))
    }

    /// Acquires the per-queue ordering lock, used by orderly consumption and
    /// by the rebalancer's revocation grace period.
    pub async fn begin_orderly(&self) -> OwnedMutexGuard<()> {
        self.consuming_lock.clone().lock_owned().await
    }

    pub fn try_begin_orderly(&self) -> Result<OwnedMutexGuard<()>, TryLockError> {
        self.consuming_lock.clone().try_lock_owned()
    }

    /// Orderly mode: moves up to `count` messages from the front of the
    /// buffer into the staging area and returns them in offset order. Must be
    /// called with the ordering lock held.
    pub fn take(&self, count: usize) -> Vec<ReceivedMessage> {
        let mut inner = self.inner.lock().expect("process queue lock poisoned");
        let mut batch = Vec::with_capacity(count.min(inner.pending.len()));
        for _ in 0..count {
            let Some((offset, message)) = inner.pending.pop_first() else {
                break;
            };
            inner.consuming.insert(offset, message.clone());
            batch.push(message);
        }
        batch
    }

    /// Orderly mode: drops the staged batch as consumed and returns the new
    /// commit point, one past the staged batch.
    pub fn commit_taken(&self) -> Option<u64> {
        let mut inner = self.inner.lock().expect("process queue lock poisoned");
        let last = inner.consuming.last_key_value().map(|(offset, _)| *offset)?;
        let staged: Vec<ReceivedMessage> = std::mem::take(&mut inner.consuming).into_values().collect();
        for message in &staged {
            inner.bytes = inner.bytes.saturating_sub(message.message.body.len() as u64);
        }
        Some(last + 1)
    }

    /// Orderly mode: returns the staged batch to the buffer for redelivery,
    /// bumping each message's delivery count.
    pub fn rollback_taken(&self) {
        let mut inner = self.inner.lock().expect("process queue lock poisoned");
        let staged = std::mem::take(&mut inner.consuming);
        for (offset, mut message) in staged {
            message.delivery_count += 1;
            inner.pending.insert(offset, message);
        }
    }
}
