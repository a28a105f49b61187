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
use crate::consumer::config::{ConsumerConfig, StartPosition};
use crate::consumer::process_queue::ProcessQueue;
use crate::consumer::pull::{PullScheduler, PullTask};
use crate::error::PropelError;
use crate::offset::OffsetStore;
use crate::queue::QueueId;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Periodically recomputes this member's fair share of every subscribed
/// topic's queues and reconciles the local assignment set against it.
///
/// The rebalancer is the only writer of the assignment map; the pull
/// scheduler and dispatcher observe revocations through each process queue's
/// dropped flag.
pub(crate) struct Rebalancer {
    config: Arc<ConsumerConfig>,
    client: Arc<dyn BrokerClient>,
    offsets: Arc<dyn OffsetStore>,
    assignment: Arc<DashMap<QueueId, Arc<ProcessQueue>>>,
    subscriptions: Arc<DashMap<String, Option<String>>>,
    scheduler: Arc<PullScheduler>,
    wake: Arc<Notify>,
}

impl Rebalancer {
    pub fn new(
        config: Arc<ConsumerConfig>,
        client: Arc<dyn BrokerClient>,
        offsets: Arc<dyn OffsetStore>,
        assignment: Arc<DashMap<QueueId, Arc<ProcessQueue>>>,
        subscriptions: Arc<DashMap<String, Option<String>>>,
        scheduler: Arc<PullScheduler>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            client,
            offsets,
            assignment,
            subscriptions,
            scheduler,
            wake,
        }
    }

    /// The rebalance loop: a fixed interval plus on-demand wakes after
    /// subscription changes. The first tick fires immediately.
    pub async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.rebalance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.rebalance_all().await,
                _ = self.wake.notified() => self.rebalance_all().await,
                _ = stop.recv() => break,
            }
        }
        debug!("rebalance loop stopped");
    }

    pub async fn rebalance_all(&self) {
        let topics: Vec<String> = self.subscriptions.iter().map(|entry| entry.key().clone()).collect();
        for topic in &topics {
            self.rebalance_topic(topic).await;
        }
        // Queues of topics that are no longer subscribed.
        let stale: Vec<(QueueId, Arc<ProcessQueue>)> = self
            .assignment
            .iter()
            .filter(|entry| !self.subscriptions.contains_key(&entry.key().topic))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (queue, pq) in stale {
            self.revoke(queue, pq);
        }
    }

    async fn rebalance_topic(&self, topic: &str) {
        let mut queues = match self.client.fetch_queues(topic).await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(topic, error = %e, "failed to fetch topic queues, keeping previous assignment");
                return;
            }
        };
        let mut members = match self.client.fetch_group_members(&self.config.group).await {
            Ok(members) => members,
            Err(e) => {
                warn!(topic, error = %e, "failed to fetch group members, keeping previous assignment");
                return;
            }
        };
        if members.is_empty() {
            warn!(topic, group = %self.config.group, "group has no members, keeping previous assignment");
            return;
        }
        queues.sort();
        queues.dedup();
        members.sort();
        members.dedup();

        let target: HashSet<QueueId> = self
            .config
            .allocation
            .allocate(&self.config.member_id, &members, &queues)
            .into_iter()
            .collect();
        debug!(
            topic,
            strategy = self.config.allocation.name(),
            members = members.len(),
            queues = queues.len(),
            assigned = target.len(),
            "computed target assignment"
        );

        let stale: Vec<(QueueId, Arc<ProcessQueue>)> = self
            .assignment
            .iter()
            .filter(|entry| entry.key().topic == topic && !target.contains(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (queue, pq) in stale {
            self.revoke(queue, pq);
        }

        for queue in target {
            if self.assignment.contains_key(&queue) {
                continue;
            }
            self.assign(queue).await;
        }
    }

    async fn assign(&self, queue: QueueId) {
        let next_offset = match self.initial_offset(&queue).await {
            Ok(offset) => offset,
            Err(e) => {
                warn!(queue = %queue, error = %e, "failed to seed offset, deferring assignment to next cycle");
                return;
            }
        };
        let pq = Arc::new(ProcessQueue::new(queue.clone()));
        self.assignment.insert(queue.clone(), pq.clone());
        info!(queue = %queue, next_offset, "assigned queue");
        self.scheduler.enqueue(PullTask {
            queue,
            next_offset,
            process_queue: pq,
            failures: 0,
        });
    }

    /// Marks the queue dropped, grants in-flight consumption a bounded grace
    /// period, persists its offset and discards its buffer.
    fn revoke(&self, queue: QueueId, pq: Arc<ProcessQueue>) {
        info!(queue = %queue, "revoking queue");
        pq.mark_dropped();
        let offsets = self.offsets.clone();
        let assignment = self.assignment.clone();
        let grace = self.config.revoke_grace;
        tokio::spawn(async move {
            let _ = tokio::time::timeout(grace, pq.begin_orderly()).await;
            if let Err(e) = offsets.persist(&queue).await {
                warn!(queue = %queue, error = %e, "failed to persist offset of revoked queue");
            }
            assignment.remove_if(&queue, |_, current| Arc::ptr_eq(current, &pq));
            if let Err(e) = offsets.remove(&queue).await {
                warn!(queue = %queue, error = %e, "failed to forget offset of revoked queue");
            }
        });
    }

    /// Offset a fresh assignment starts pulling at: the committed offset when
    /// one exists, else the configured start position.
    async fn initial_offset(&self, queue: &QueueId) -> Result<u64, PropelError> {
        if let Some(offset) = self.offsets.load(queue).await? {
            return Ok(offset);
        }
        match self.config.start_position {
            StartPosition::Earliest => {
                let (min, _) = self.client.queue_offset_range(queue).await?;
                Ok(min)
            }
            StartPosition::Latest => {
                let (_, max) = self.client.queue_offset_range(queue).await?;
                Ok(max)
            }
            StartPosition::FromTimestamp(timestamp_ms) => {
                self.client.search_offset(queue, timestamp_ms).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerClient, PullResponse, PullStatus};
    use crate::consumer::config::ConsumeMode;
    use crate::consumer::dispatch::Dispatcher;
    use crate::listener::{ConsumeOutcome, MessageListener};
    use crate::message::ReceivedMessage;
    use crate::offset::InMemoryOffsetStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    struct NoopListener;

    #[async_trait]
    impl MessageListener for NoopListener {
        async fn consume(&self, _messages: &[ReceivedMessage]) -> ConsumeOutcome {
            ConsumeOutcome::Success
        }
    }

    fn queues(n: u32) -> Vec<QueueId> {
        (0..n).map(|i| QueueId::new("orders", "broker-a", i)).collect()
    }

    struct Harness {
        rebalancer: Arc<Rebalancer>,
        assignment: Arc<DashMap<QueueId, Arc<ProcessQueue>>>,
        offsets: Arc<InMemoryOffsetStore>,
        pulled: Arc<Mutex<Vec<(QueueId, u64)>>>,
        stop: broadcast::Sender<()>,
    }

    fn harness(mut client: MockBrokerClient, config: ConsumerConfig) -> Harness {
        let pulled = Arc::new(Mutex::new(Vec::new()));
        let recorder = pulled.clone();
        client.expect_pull().returning(move |query| {
            recorder.lock().unwrap().push((query.queue.clone(), query.offset));
            Ok(PullResponse {
                status: PullStatus::NoNewMessages,
                messages: Vec::new(),
                next_offset: query.offset,
                min_offset: 0,
                max_offset: query.offset,
            })
        });

        let config = Arc::new(config);
        let client: Arc<dyn BrokerClient> = Arc::new(client);
        let offsets = Arc::new(InMemoryOffsetStore::new());
        let assignment = Arc::new(DashMap::new());
        let subscriptions = Arc::new(DashMap::new());
        subscriptions.insert("orders".to_string(), None);
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            client.clone(),
            offsets.clone(),
            Arc::new(NoopListener),
        ));
        let scheduler = Arc::new(PullScheduler::new(
            config.clone(),
            client.clone(),
            offsets.clone(),
            dispatcher,
            subscriptions.clone(),
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
        ));
        let (stop, _) = broadcast::channel(1);
        tokio::spawn(scheduler.clone().run(stop.subscribe()));
        let rebalancer = Arc::new(Rebalancer::new(
            config,
            client,
            offsets.clone(),
            assignment.clone(),
            subscriptions,
            scheduler,
            Arc::new(Notify::new()),
        ));
        Harness {
            rebalancer,
            assignment,
            offsets,
            pulled,
            stop,
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder()
            .group("billing".to_string())
            .member_id("member-a".to_string())
            .mode(ConsumeMode::Concurrent)
            .idle_pull_delay(Duration::from_secs(3600))
            .revoke_grace(Duration::from_millis(20))
            .build()
    }

    #[tokio::test]
    async fn assigns_fair_share_and_seeds_offsets() {
        let mut client = MockBrokerClient::new();
        client
            .expect_fetch_queues()
            .returning(|_| Ok(queues(4)));
        client.expect_fetch_group_members().returning(|_| {
            Ok(vec![
                "member-a".to_string(),
                "member-b".to_string(),
                "member-c".to_string(),
            ])
        });
        // Queue #1 has no committed offset: seeded from the latest position.
        client
            .expect_queue_offset_range()
            .withf(|q| q.index == 1)
            .returning(|_| Ok((10, 42)));
        let h = harness(client, config());
        // Queue #0 resumes from its committed offset.
        h.offsets.update(&queues(4)[0], 7, false).await.unwrap();

        h.rebalancer.rebalance_all().await;
        sleep(Duration::from_millis(100)).await;

        // 3 members, 4 queues: this member owns the first two queues.
        let mut assigned: Vec<QueueId> = h.assignment.iter().map(|e| e.key().clone()).collect();
        assigned.sort();
        assert_eq!(assigned, vec![queues(4)[0].clone(), queues(4)[1].clone()]);

        let mut pulled = h.pulled.lock().unwrap().clone();
        pulled.sort();
        assert_eq!(
            pulled,
            vec![(queues(4)[0].clone(), 7), (queues(4)[1].clone(), 42)]
        );
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn fetch_errors_keep_previous_assignment() {
        let mut client = MockBrokerClient::new();
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let toggle = healthy.clone();
        client.expect_fetch_queues().returning(move |_| {
            if toggle.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(queues(2))
            } else {
                Err(PropelError::Transport("naming service down".into()))
            }
        });
        client
            .expect_fetch_group_members()
            .returning(|_| Ok(vec!["member-a".to_string()]));
        client.expect_queue_offset_range().returning(|_| Ok((0, 0)));
        let h = harness(client, config());

        h.rebalancer.rebalance_all().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.assignment.len(), 2);

        healthy.store(false, std::sync::atomic::Ordering::SeqCst);
        h.rebalancer.rebalance_all().await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(h.assignment.len(), 2);
        assert!(h.assignment.iter().all(|e| !e.value().is_dropped()));
        let _ = h.stop.send(());
    }

    #[tokio::test]
    async fn shrinking_target_revokes_and_discards_queues() {
        let mut client = MockBrokerClient::new();
        let queue_count = Arc::new(std::sync::atomic::AtomicUsize::new(2));
        let counter = queue_count.clone();
        client
            .expect_fetch_queues()
            .returning(move |_| Ok(queues(counter.load(std::sync::atomic::Ordering::SeqCst) as u32)));
        client
            .expect_fetch_group_members()
            .returning(|_| Ok(vec!["member-a".to_string()]));
        client.expect_queue_offset_range().returning(|_| Ok((0, 0)));
        let h = harness(client, config());

        h.rebalancer.rebalance_all().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.assignment.len(), 2);
        let revoked = h.assignment.get(&queues(2)[1]).unwrap().value().clone();

        queue_count.store(1, std::sync::atomic::Ordering::SeqCst);
        h.rebalancer.rebalance_all().await;

        // Dropped immediately, removed after the grace period.
        assert!(revoked.is_dropped());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.assignment.len(), 1);
        assert!(h.assignment.contains_key(&queues(1)[0]));
        let _ = h.stop.send(());
    }
}
