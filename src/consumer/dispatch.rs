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

use crate::broker::BrokerClient;
use crate::consumer::config::{ConsumeMode, ConsumerConfig};
use crate::consumer::process_queue::ProcessQueue;
use crate::listener::{ConsumeOutcome, MessageListener};
use crate::message::ReceivedMessage;
use crate::offset::OffsetStore;
use crate::queue::QueueId;
use futures_util::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

enum OrderlyFollowup {
    /// Pause the queue briefly, then redeliver.
    Suspend,
    /// The batch exhausted its deliveries; forward it to the broker and move
    /// the queue past it.
    DeadLetter(Vec<ReceivedMessage>),
}

/// Drains process queues into listener invocations through a bounded worker
/// pool, and advances committed offsets for completed work.
pub(crate) struct Dispatcher {
    config: Arc<ConsumerConfig>,
    client: Arc<dyn BrokerClient>,
    offsets: Arc<dyn OffsetStore>,
    listener: Arc<dyn MessageListener>,
    permits: Arc<Semaphore>,
    workers: usize,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: Arc<ConsumerConfig>,
        client: Arc<dyn BrokerClient>,
        offsets: Arc<dyn OffsetStore>,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        let workers = config.consume_thread_max.max(config.consume_thread_min).max(1);
        Self {
            config,
            client,
            offsets,
            listener,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Listener invocations currently running or holding a worker slot.
    pub fn in_flight(&self) -> usize {
        self.workers.saturating_sub(self.permits.available_permits())
    }

    /// Stops admitting work; queued batches that have not started are
    /// discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
    }

    /// Hands freshly pulled messages to the configured dispatch mode. The
    /// messages are already buffered in `pq`.
    pub fn submit(self: Arc<Self>, messages: Vec<ReceivedMessage>, pq: &Arc<ProcessQueue>) {
        if self.is_closed() {
            return;
        }
        match self.config.mode {
            ConsumeMode::Concurrent => {
                for chunk in messages.chunks(self.config.consume_batch_size.max(1)) {
                    self.clone().spawn_concurrent(chunk.to_vec(), pq.clone());
                }
            }
            ConsumeMode::Orderly => self.dispatch_orderly(pq.clone()),
        }
    }

    fn spawn_concurrent(self: Arc<Self>, batch: Vec<ReceivedMessage>, pq: Arc<ProcessQueue>) {
        tokio::spawn(async move {
            self.run_concurrent(batch, pq).await;
        });
    }

    async fn run_concurrent(self: Arc<Self>, batch: Vec<ReceivedMessage>, pq: Arc<ProcessQueue>) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        if pq.is_dropped() {
            debug!(queue = %pq.queue(), "queue dropped, discarding batch");
            return;
        }
        let outcome = self.invoke_listener(&batch).await;
        if pq.is_dropped() {
            debug!(queue = %pq.queue(), "queue dropped mid-consume, discarding result");
            return;
        }
        match outcome {
            ConsumeOutcome::Success => {
                let consumed: Vec<u64> = batch.iter().map(|m| m.offset).collect();
                self.finalize(&consumed, &pq).await;
            }
            ConsumeOutcome::RetryLater | ConsumeOutcome::SuspendCurrentQueue => {
                let mut consumed = Vec::new();
                let mut redeliver = Vec::new();
                for mut message in batch {
                    if message.delivery_count < self.config.local_retry_limit {
                        message.delivery_count += 1;
                        redeliver.push(message);
                        continue;
                    }
                    match self
                        .client
                        .send_retry_message(&self.config.group, &message, self.config.retry_delay_level)
                        .await
                    {
                        Ok(()) => {
                            debug!(
                                queue = %message.queue,
                                offset = message.offset,
                                deliveries = message.delivery_count + 1,
                                "forwarded exhausted message to broker for delayed retry"
                            );
                            consumed.push(message.offset);
                        }
                        Err(e) => {
                            warn!(
                                queue = %message.queue,
                                offset = message.offset,
                                error = %e,
                                "failed to forward retry message, redelivering locally"
                            );
                            redeliver.push(message);
                        }
                    }
                }
                if !consumed.is_empty() {
                    self.finalize(&consumed, &pq).await;
                }
                if !redeliver.is_empty() {
                    self.schedule_concurrent_redelivery(redeliver, pq);
                }
            }
        }
    }

    fn schedule_concurrent_redelivery(self: Arc<Self>, batch: Vec<ReceivedMessage>, pq: Arc<ProcessQueue>) {
        let delay = self.config.local_retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if self.is_closed() || pq.is_dropped() {
                return;
            }
            self.run_concurrent(batch, pq).await;
        });
    }

    /// Starts an orderly consume session for the queue unless one is already
    /// running; a running session drains everything pending by itself.
    fn dispatch_orderly(self: Arc<Self>, pq: Arc<ProcessQueue>) {
        let Ok(guard) = pq.try_begin_orderly() else {
            return;
        };
        tokio::spawn(async move {
            self.orderly_session(guard, pq).await;
        });
    }

    async fn orderly_session(
        self: Arc<Self>,
        mut guard: tokio::sync::OwnedMutexGuard<()>,
        pq: Arc<ProcessQueue>,
    ) {
        loop {
            let followup = {
                let Ok(_permit) = self.permits.clone().acquire_owned().await else {
                    return;
                };
                loop {
                    if self.is_closed() || pq.is_dropped() {
                        break None;
                    }
                    let batch = pq.take(self.config.consume_batch_size.max(1));
                    if batch.is_empty() {
                        break None;
                    }
                    let deliveries = batch.iter().map(|m| m.delivery_count).max().unwrap_or(0);
                    if deliveries >= self.config.max_deliveries {
                        pq.rollback_taken();
                        break Some(OrderlyFollowup::DeadLetter(batch));
                    }
                    match self.invoke_listener(&batch).await {
                        ConsumeOutcome::Success => {
                            if pq.is_dropped() {
                                break None;
                            }
                            if let Some(commit) = pq.commit_taken() {
                                self.update_offset(pq.queue(), commit).await;
                            }
                        }
                        ConsumeOutcome::RetryLater | ConsumeOutcome::SuspendCurrentQueue => {
                            pq.rollback_taken();
                            break Some(OrderlyFollowup::Suspend);
                        }
                    }
                }
            };
            // The ordering lock is released before any sleep or network call.
            drop(guard);
            match followup {
                None => {
                    if !self.is_closed() && !pq.is_dropped() && pq.has_pending() {
                        // A pull landed between the last take and the lock
                        // release; pick it up instead of waiting for the next
                        // trigger.
                        match pq.try_begin_orderly() {
                            Ok(next) => {
                                guard = next;
                                continue;
                            }
                            Err(_) => return,
                        }
                    }
                    return;
                }
                Some(OrderlyFollowup::Suspend) => {
                    tokio::time::sleep(self.config.suspend_queue_delay).await;
                    if self.is_closed() || pq.is_dropped() {
                        return;
                    }
                    guard = pq.begin_orderly().await;
                }
                Some(OrderlyFollowup::DeadLetter(batch)) => {
                    let mut forwarded = true;
                    for message in &batch {
                        if let Err(e) = self
                            .client
                            .send_retry_message(&self.config.group, message, self.config.retry_delay_level)
                            .await
                        {
                            warn!(
                                queue = %message.queue,
                                offset = message.offset,
                                error = %e,
                                "failed to dead-letter orderly batch, will redeliver"
                            );
                            forwarded = false;
                            break;
                        }
                    }
                    if self.is_closed() {
                        return;
                    }
                    if forwarded {
                        guard = pq.begin_orderly().await;
                        if pq.is_dropped() {
                            return;
                        }
                        let offsets: Vec<u64> = batch.iter().map(|m| m.offset).collect();
                        warn!(
                            queue = %pq.queue(),
                            count = offsets.len(),
                            deliveries = self.config.max_deliveries,
                            "orderly batch exhausted its deliveries, moved past it"
                        );
                        if let Some(commit) = pq.remove(&offsets) {
                            self.update_offset(pq.queue(), commit).await;
                        }
                    } else {
                        tokio::time::sleep(self.config.suspend_queue_delay).await;
                        if self.is_closed() || pq.is_dropped() {
                            return;
                        }
                        guard = pq.begin_orderly().await;
                    }
                }
            }
        }
    }

    async fn invoke_listener(&self, batch: &[ReceivedMessage]) -> ConsumeOutcome {
        match std::panic::AssertUnwindSafe(self.listener.consume(batch))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!("message listener panicked: {panic:?}");
                ConsumeOutcome::RetryLater
            }
        }
    }

    async fn finalize(&self, consumed: &[u64], pq: &Arc<ProcessQueue>) {
        if pq.is_dropped() {
            return;
        }
        if let Some(commit) = pq.remove(consumed) {
            self.update_offset(pq.queue(), commit).await;
        }
    }

    async fn update_offset(&self, queue: &QueueId, offset: u64) {
        if let Err(e) = self.offsets.update(queue, offset, false).await {
            warn!(queue = %queue, offset, error = %e, "failed to update offset");
        }
    }
}
