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

use crate::broker::{BrokerClient, PullQuery, PullStatus};
use crate::consumer::config::{ConsumeMode, ConsumerConfig};
use crate::consumer::dispatch::Dispatcher;
use crate::consumer::process_queue::ProcessQueue;
use crate::offset::OffsetStore;
use crate::queue::QueueId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Delay before retrying a pull for a paused consumer.
const PAUSE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The perpetual pull loop of one assigned queue.
///
/// Created by the rebalance engine on assignment and re-enqueued into the
/// scheduler after every pull until the queue's process queue is dropped.
#[derive(Debug)]
pub(crate) struct PullTask {
    pub queue: QueueId,
    /// Offset the next pull starts at.
    pub next_offset: u64,
    pub process_queue: Arc<ProcessQueue>,
    /// Consecutive transport failures, drives the exponential backoff.
    pub failures: u32,
}

/// Issues long-poll pull requests for every live [`PullTask`], feeds results
/// into the process queues and hands fresh batches to the dispatcher.
pub(crate) struct PullScheduler {
    config: Arc<ConsumerConfig>,
    client: Arc<dyn BrokerClient>,
    offsets: Arc<dyn OffsetStore>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Arc<DashMap<String, Option<String>>>,
    paused: Arc<AtomicBool>,
    tx: flume::Sender<PullTask>,
    rx: flume::Receiver<PullTask>,
}

impl PullScheduler {
    pub fn new(
        config: Arc<ConsumerConfig>,
        client: Arc<dyn BrokerClient>,
        offsets: Arc<dyn OffsetStore>,
        dispatcher: Arc<Dispatcher>,
        subscriptions: Arc<DashMap<String, Option<String>>>,
        paused: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            config,
            client,
            offsets,
            dispatcher,
            subscriptions,
            paused,
            tx,
            rx,
        }
    }

    /// Enqueues a pull task for immediate execution.
    pub fn enqueue(&self, task: PullTask) {
        let _ = self.tx.send(task);
    }

    /// Re-enqueues a pull task once `delay` elapses, unless its queue is
    /// dropped by then.
    pub fn enqueue_after(&self, task: PullTask, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(task);
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if task.process_queue.is_dropped() {
                return;
            }
            let _ = tx.send(task);
        });
    }

    /// The scheduling loop: receives due pull tasks and runs each pull as its
    /// own task, so pulls for different queues proceed fully in parallel.
    pub async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                task = self.rx.recv_async() => {
                    match task {
                        Ok(task) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.pull_once(task).await });
                        }
                        Err(_) => break,
                    }
                }
                _ = stop.recv() => break,
            }
        }
        debug!("pull scheduler stopped");
    }

    async fn pull_once(self: Arc<Self>, mut task: PullTask) {
        let pq = task.process_queue.clone();
        if pq.is_dropped() {
            debug!(queue = %task.queue, "queue dropped, retiring pull task");
            return;
        }
        if self.paused.load(Ordering::Acquire) {
            self.enqueue_after(task, PAUSE_RETRY_DELAY);
            return;
        }
        if let Some(delay) = self.flow_control_delay(&pq) {
            self.enqueue_after(task, delay);
            return;
        }

        let filter = self
            .subscriptions
            .get(&task.queue.topic)
            .and_then(|entry| entry.value().clone());
        let query = PullQuery {
            queue: task.queue.clone(),
            offset: task.next_offset,
            max_count: self.config.pull_batch_size,
            long_poll_wait: self.config.long_poll_wait,
            filter,
        };
        trace!(queue = %task.queue, offset = task.next_offset, "pulling");

        match self.client.pull(query).await {
            Ok(response) => {
                task.failures = 0;
                if pq.is_dropped() {
                    debug!(queue = %task.queue, "queue dropped mid-pull, discarding result");
                    return;
                }
                match response.status {
                    PullStatus::Found => {
                        let messages = response.messages;
                        trace!(queue = %task.queue, count = messages.len(), "pulled messages");
                        task.next_offset = response.next_offset;
                        if !messages.is_empty() {
                            pq.put(&messages);
                            self.dispatcher.clone().submit(messages, &pq);
                        }
                        self.enqueue_after(task, self.config.pull_interval);
                    }
                    PullStatus::NoNewMessages => {
                        task.next_offset = response.next_offset;
                        self.enqueue_after(task, self.config.idle_pull_delay);
                    }
                    PullStatus::OffsetIllegal => {
                        warn!(
                            queue = %task.queue,
                            offset = task.next_offset,
                            corrected = response.next_offset,
                            "pull offset outside broker range, resetting"
                        );
                        task.next_offset = response.next_offset;
                        if let Err(e) = self
                            .offsets
                            .update(&task.queue, response.next_offset, true)
                            .await
                        {
                            warn!(queue = %task.queue, error = %e, "failed to persist corrected offset");
                        }
                        self.enqueue_after(task, self.config.pull_backoff_base);
                    }
                    PullStatus::SlaveNotAvailable => {
                        warn!(queue = %task.queue, "replica not available, continuing from suggested offset");
                        task.next_offset = response.next_offset;
                        self.enqueue_after(task, self.config.pull_backoff_base);
                    }
                }
            }
            Err(e) => {
                task.failures = task.failures.saturating_add(1);
                let delay = backoff_delay(
                    self.config.pull_backoff_base,
                    task.failures,
                    self.config.pull_backoff_max,
                );
                warn!(
                    queue = %task.queue,
                    failures = task.failures,
                    delay = ?delay,
                    error = %e,
                    "pull failed, backing off"
                );
                self.enqueue_after(task, delay);
            }
        }
    }

    /// Returns the cooldown to apply when a flow-control ceiling is breached.
    fn flow_control_delay(&self, pq: &ProcessQueue) -> Option<Duration> {
        let buffered = pq.message_count();
        if buffered >= self.config.queue_buffer_limit {
            debug!(queue = %pq.queue(), buffered, "queue buffer full, suspending pull");
            return Some(self.config.flow_control_delay);
        }
        let bytes = pq.buffered_bytes();
        if bytes >= self.config.queue_buffer_bytes_limit {
            debug!(queue = %pq.queue(), bytes, "queue buffer bytes full, suspending pull");
            return Some(self.config.flow_control_delay);
        }
        if self.config.mode == ConsumeMode::Concurrent && pq.span() > self.config.max_span {
            debug!(queue = %pq.queue(), span = pq.span(), "offset span too wide, suspending pull");
            return Some(self.config.flow_control_delay);
        }
        None
    }
}

fn backoff_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerClient, PullResponse};
    use crate::listener::{ConsumeOutcome, MessageListener};
    use crate::message::{Message, ReceivedMessage};
    use crate::offset::InMemoryOffsetStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    fn queue() -> QueueId {
        QueueId::new("orders", "broker-a", 0)
    }

    fn received(offset: u64) -> ReceivedMessage {
        ReceivedMessage::new(
            Message::new("orders", "payload"),
            queue(),
            offset,
            format!("msg-{offset}"),
        )
    }

    fn found(offsets: std::ops::Range<u64>) -> PullResponse {
        PullResponse {
            status: PullStatus::Found,
            messages: offsets.clone().map(received).collect(),
            next_offset: offsets.end,
            min_offset: 0,
            max_offset: offsets.end,
        }
    }

    fn idle(next_offset: u64) -> PullResponse {
        PullResponse {
            status: PullStatus::NoNewMessages,
            messages: Vec::new(),
            next_offset,
            min_offset: 0,
            max_offset: next_offset.saturating_sub(1),
        }
    }

    struct NoopListener;

    #[async_trait]
    impl MessageListener for NoopListener {
        async fn consume(&self, _messages: &[ReceivedMessage]) -> ConsumeOutcome {
            ConsumeOutcome::Success
        }
    }

    struct Harness {
        scheduler: Arc<PullScheduler>,
        offsets: Arc<InMemoryOffsetStore>,
        stop: broadcast::Sender<()>,
    }

    fn harness(config: ConsumerConfig, client: MockBrokerClient) -> Harness {
        let config = Arc::new(config);
        let client: Arc<dyn BrokerClient> = Arc::new(client);
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            client.clone(),
            offsets.clone(),
            Arc::new(NoopListener),
        ));
        let subscriptions = Arc::new(DashMap::new());
        subscriptions.insert("orders".to_string(), None);
        let scheduler = Arc::new(PullScheduler::new(
            config,
            client,
            offsets.clone(),
            dispatcher,
            subscriptions,
            Arc::new(AtomicBool::new(false)),
        ));
        let (stop, _) = broadcast::channel(1);
        tokio::spawn(scheduler.clone().run(stop.subscribe()));
        Harness {
            scheduler,
            offsets,
            stop,
        }
    }

    fn task(pq: &Arc<ProcessQueue>, next_offset: u64) -> PullTask {
        PullTask {
            queue: queue(),
            next_offset,
            process_queue: pq.clone(),
            failures: 0,
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder()
            .group("billing".to_string())
            .idle_pull_delay(Duration::from_secs(3600))
            .build()
    }

    #[tokio::test]
    async fn found_messages_are_buffered_dispatched_and_committed() {
        let mut client = MockBrokerClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.expect_pull().returning(move |query| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    assert_eq!(query.offset, 0);
                    Ok(found(0..3))
                }
                _ => Ok(idle(3)),
            }
        });
        let h = harness(config(), client);
        let pq = Arc::new(ProcessQueue::new(queue()));

        h.scheduler.enqueue(task(&pq, 0));
        sleep(Duration::from_millis(200)).await;

        assert_eq!(h.offsets.load(&queue()).await.unwrap(), Some(3));
        assert_eq!(pq.message_count(), 0);
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn no_new_messages_repulls_after_backoff_with_unchanged_offset() {
        let config = ConsumerConfig::builder()
            .group("billing".to_string())
            .idle_pull_delay(Duration::from_millis(150))
            .build();
        let mut client = MockBrokerClient::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen.clone();
        client.expect_pull().returning(move |query| {
            recorder.lock().unwrap().push(query.offset);
            Ok(idle(5))
        });
        let h = harness(config, client);
        let pq = Arc::new(ProcessQueue::new(queue()));

        h.scheduler.enqueue(task(&pq, 5));
        sleep(Duration::from_millis(75)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        // The idle delay elapses and the queue is pulled again, same offset.
        sleep(Duration::from_millis(150)).await;
        let seen = seen.lock().unwrap().clone();
        assert!(seen.len() >= 2);
        assert!(seen.iter().all(|offset| *offset == 5));
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn breached_buffer_ceiling_suspends_pulling() {
        let config = ConsumerConfig::builder()
            .group("billing".to_string())
            .queue_buffer_limit(2)
            .flow_control_delay(Duration::from_secs(3600))
            .build();
        let mut client = MockBrokerClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.expect_pull().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(idle(3))
        });
        let h = harness(config, client);
        let pq = Arc::new(ProcessQueue::new(queue()));
        pq.put(&[received(0), received(1), received(2)]);

        h.scheduler.enqueue(task(&pq, 3));
        sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "pull must stay suspended");
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn wide_span_suspends_pulling_in_concurrent_mode() {
        let config = ConsumerConfig::builder()
            .group("billing".to_string())
            .max_span(100)
            .flow_control_delay(Duration::from_secs(3600))
            .build();
        let mut client = MockBrokerClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.expect_pull().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(idle(501))
        });
        let h = harness(config, client);
        let pq = Arc::new(ProcessQueue::new(queue()));
        pq.put(&[received(0), received(500)]);

        h.scheduler.enqueue(task(&pq, 501));
        sleep(Duration::from_millis(150)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "pull must stay suspended");
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn illegal_offset_is_reset_to_broker_boundary_and_persisted() {
        let config = ConsumerConfig::builder()
            .group("billing".to_string())
            .idle_pull_delay(Duration::from_secs(3600))
            .pull_backoff_base(Duration::from_millis(20))
            .build();
        let mut client = MockBrokerClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.expect_pull().returning(move |query| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(PullResponse {
                    status: PullStatus::OffsetIllegal,
                    messages: Vec::new(),
                    next_offset: 100,
                    min_offset: 100,
                    max_offset: 250,
                }),
                _ => {
                    assert_eq!(query.offset, 100);
                    Ok(idle(100))
                }
            }
        });
        let h = harness(config, client);
        let pq = Arc::new(ProcessQueue::new(queue()));

        h.scheduler.enqueue(task(&pq, 3));
        sleep(Duration::from_millis(200)).await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(h.offsets.load(&queue()).await.unwrap(), Some(100));
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn transport_errors_back_off_but_never_abandon_the_queue() {
        let config = ConsumerConfig::builder()
            .group("billing".to_string())
            .idle_pull_delay(Duration::from_secs(3600))
            .pull_backoff_base(Duration::from_millis(10))
            .build();
        let mut client = MockBrokerClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        client.expect_pull().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(crate::error::PropelError::Transport("connection refused".into())),
                _ => Ok(idle(0)),
            }
        });
        let h = harness(config, client);
        let pq = Arc::new(ProcessQueue::new(queue()));

        h.scheduler.enqueue(task(&pq, 0));
        sleep(Duration::from_millis(300)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn result_for_dropped_queue_is_discarded() {
        let pq = Arc::new(ProcessQueue::new(queue()));
        let mut client = MockBrokerClient::new();
        let inner = pq.clone();
        client.expect_pull().times(1).returning(move |_| {
            // Rebalance revokes the queue while the pull is in flight.
            inner.mark_dropped();
            Ok(found(0..5))
        });
        let h = harness(config(), client);

        h.scheduler.enqueue(task(&pq, 0));
        sleep(Duration::from_millis(150)).await;

        assert_eq!(pq.message_count(), 0);
        assert_eq!(h.offsets.load(&queue()).await.unwrap(), None);
        let _ = h.stop.send(());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3, max), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 12, max), max);
    }
}
