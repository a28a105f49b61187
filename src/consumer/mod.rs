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

pub mod allocation;
pub mod config;
mod dispatch;
mod process_queue;
mod pull;
mod rebalance;

pub use config::{ConsumeMode, ConsumerConfig, StartPosition};

use crate::broker::BrokerClient;
use crate::error::PropelError;
use crate::listener::MessageListener;
use crate::message::ReceivedMessage;
use crate::offset::{BrokerOffsetStore, OffsetStore};
use crate::queue::QueueId;
use dispatch::Dispatcher;
use dashmap::DashMap;
use process_queue::ProcessQueue;
use pull::PullScheduler;
use rebalance::Rebalancer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// A push-semantics consumer over a pull-based broker transport.
///
/// The consumer joins a group, receives its fair share of the subscribed
/// topics' queues through periodic rebalancing, long-polls each assigned
/// queue and pushes batches into the registered [`MessageListener`], tracking
/// committed offsets along the way.
///
/// # Examples
///
/// ```no_run
/// use propel::consumer::{ConsumerConfig, PushConsumer};
/// use propel::listener::{ConsumeOutcome, MessageListener};
/// use propel::message::ReceivedMessage;
/// use std::sync::Arc;
///
/// struct Print;
///
/// #[async_trait::async_trait]
/// impl MessageListener for Print {
///     async fn consume(&self, messages: &[ReceivedMessage]) -> ConsumeOutcome {
///         for message in messages {
///             println!("{}: {:?}", message.offset, message.message.body);
///         }
///         ConsumeOutcome::Success
///     }
/// }
///
/// # async fn run(client: Arc<dyn propel::broker::BrokerClient>) -> Result<(), propel::error::PropelError> {
/// let config = ConsumerConfig::builder().group("billing".to_string()).build();
/// let consumer = PushConsumer::builder(config, client)
///     .listener(Arc::new(Print))
///     .subscribe("orders", None)
///     .build()?;
/// consumer.start()?;
/// # Ok(())
/// # }
/// ```
pub struct PushConsumer {
    config: Arc<ConsumerConfig>,
    client: Arc<dyn BrokerClient>,
    offsets: Arc<dyn OffsetStore>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<PullScheduler>,
    rebalancer: Arc<Rebalancer>,
    subscriptions: Arc<DashMap<String, Option<String>>>,
    assignment: Arc<DashMap<QueueId, Arc<ProcessQueue>>>,
    paused: Arc<AtomicBool>,
    wake: Arc<Notify>,
    stop: broadcast::Sender<()>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PushConsumer {
    pub fn builder(config: ConsumerConfig, client: Arc<dyn BrokerClient>) -> PushConsumerBuilder {
        PushConsumerBuilder {
            config,
            client,
            listener: None,
            offset_store: None,
            subscriptions: Vec::new(),
        }
    }

    /// Spawns the rebalance, pull-scheduling and offset-persistence loops.
    pub fn start(&self) -> Result<(), PropelError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PropelError::AlreadyStarted);
        }
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(tokio::spawn(self.scheduler.clone().run(self.stop.subscribe())));
        tasks.push(tokio::spawn(self.rebalancer.clone().run(self.stop.subscribe())));

        let offsets = self.offsets.clone();
        let interval = self.config.offset_persist_interval;
        let mut stop = self.stop.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = offsets.persist_all().await {
                            warn!(error = %e, "periodic offset persistence failed");
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        }));

        info!(
            group = %self.config.group,
            member_id = %self.config.member_id,
            mode = %self.config.mode,
            "consumer started"
        );
        Ok(())
    }

    /// Subscribes to a topic, optionally with a filter expression carried on
    /// every pull request. Triggers an immediate rebalance.
    pub fn subscribe(&self, topic: impl Into<String>, filter_expression: Option<&str>) {
        self.subscriptions
            .insert(topic.into(), filter_expression.map(str::to_string));
        self.wake.notify_one();
    }

    /// Unsubscribes from a topic; its queues are revoked on the rebalance
    /// this triggers.
    pub fn unsubscribe(&self, topic: &str) {
        self.subscriptions.remove(topic);
        self.wake.notify_one();
    }

    /// Suspends pulling without giving up queue ownership.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        info!(group = %self.config.group, "consumer paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        info!(group = %self.config.group, "consumer resumed");
    }

    /// Queues currently assigned to this member.
    pub fn assigned_queues(&self) -> Vec<QueueId> {
        self.assignment.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Sends a message back to the broker for delayed redelivery to the
    /// group, the manual counterpart of the dispatcher's retry forwarding.
    pub async fn send_message_back(
        &self,
        message: &ReceivedMessage,
        delay_level: i32,
    ) -> Result<(), PropelError> {
        self.client
            .send_retry_message(&self.config.group, message, delay_level)
            .await
    }

    /// Stops the background loops, drains in-flight dispatch work within the
    /// configured timeout and persists all offsets.
    pub async fn shutdown(&self) -> Result<(), PropelError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Err(PropelError::NotStarted);
        }
        let _ = self.stop.send(());
        self.dispatcher.close();

        let mut handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        let deadline = Instant::now() + self.config.shutdown_timeout;
        for handle in &mut handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut *handle).await.is_err() {
                warn!("background loop did not stop in time, aborting");
            }
        }
        for handle in handles {
            handle.abort();
        }
        while self.dispatcher.in_flight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        if self.dispatcher.in_flight() > 0 {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                "shutdown timeout elapsed with dispatch work still running"
            );
        }

        if let Err(e) = self.offsets.persist_all().await {
            warn!(error = %e, "failed to persist offsets at shutdown");
        }
        info!(group = %self.config.group, "consumer stopped");
        Ok(())
    }
}

/// Builder wiring a [`PushConsumer`] out of its collaborators.
pub struct PushConsumerBuilder {
    config: ConsumerConfig,
    client: Arc<dyn BrokerClient>,
    listener: Option<Arc<dyn MessageListener>>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    subscriptions: Vec<(String, Option<String>)>,
}

impl PushConsumerBuilder {
    /// Registers the application's message listener. Required.
    pub fn listener(self, listener: Arc<dyn MessageListener>) -> Self {
        Self {
            listener: Some(listener),
            ..self
        }
    }

    /// Replaces the default broker-backed offset store.
    pub fn offset_store(self, offset_store: Arc<dyn OffsetStore>) -> Self {
        Self {
            offset_store: Some(offset_store),
            ..self
        }
    }

    /// Pre-registers a subscription; more can be added after start.
    pub fn subscribe(mut self, topic: impl Into<String>, filter_expression: Option<&str>) -> Self {
        self.subscriptions
            .push((topic.into(), filter_expression.map(str::to_string)));
        self
    }

    pub fn build(self) -> Result<PushConsumer, PropelError> {
        if self.config.group.is_empty() {
            return Err(PropelError::InvalidConfiguration(
                "consumer group id must not be empty".to_string(),
            ));
        }
        let Some(listener) = self.listener else {
            return Err(PropelError::MissingMessageListener);
        };
        let config = Arc::new(self.config);
        let client = self.client;
        let offsets = self
            .offset_store
            .unwrap_or_else(|| Arc::new(BrokerOffsetStore::new(config.group.clone(), client.clone())));
        let subscriptions: Arc<DashMap<String, Option<String>>> = Arc::new(DashMap::new());
        for (topic, filter) in self.subscriptions {
            subscriptions.insert(topic, filter);
        }
        let assignment = Arc::new(DashMap::new());
        let paused = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let (stop, _) = broadcast::channel(1);

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            client.clone(),
            offsets.clone(),
            listener,
        ));
        let scheduler = Arc::new(PullScheduler::new(
            config.clone(),
            client.clone(),
            offsets.clone(),
            dispatcher.clone(),
            subscriptions.clone(),
            paused.clone(),
        ));
        let rebalancer = Arc::new(Rebalancer::new(
            config.clone(),
            client.clone(),
            offsets.clone(),
            assignment.clone(),
            subscriptions.clone(),
            scheduler.clone(),
            wake.clone(),
        ));

        Ok(PushConsumer {
            config,
            client,
            offsets,
            dispatcher,
            scheduler,
            rebalancer,
            subscriptions,
            assignment,
            paused,
            wake,
            stop,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerClient, PullResponse, PullStatus};
    use crate::listener::{ConsumeOutcome, MessageListener};
    use crate::offset::InMemoryOffsetStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    struct CountingListener {
        consumed: AtomicUsize,
    }

    #[async_trait]
    impl MessageListener for CountingListener {
        async fn consume(&self, messages: &[crate::message::ReceivedMessage]) -> ConsumeOutcome {
            self.consumed.fetch_add(messages.len(), Ordering::SeqCst);
            ConsumeOutcome::Success
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder()
            .group("billing".to_string())
            .member_id("member-a".to_string())
            .rebalance_interval(Duration::from_millis(100))
            .idle_pull_delay(Duration::from_secs(3600))
            .shutdown_timeout(Duration::from_secs(1))
            .build()
    }

    #[test]
    fn build_without_listener_fails_fast() {
        let client: Arc<dyn BrokerClient> = Arc::new(MockBrokerClient::new());
        let result = PushConsumer::builder(config(), client).build();
        assert!(matches!(result, Err(PropelError::MissingMessageListener)));
    }

    #[tokio::test]
    async fn consumes_end_to_end_and_shuts_down() {
        let mut client = MockBrokerClient::new();
        client
            .expect_fetch_queues()
            .returning(|_| Ok(vec![QueueId::new("orders", "broker-a", 0)]));
        client
            .expect_fetch_group_members()
            .returning(|_| Ok(vec!["member-a".to_string()]));
        let served = Arc::new(AtomicBool::new(false));
        let gate = served.clone();
        client.expect_pull().returning(move |query| {
            if gate.swap(true, Ordering::SeqCst) {
                return Ok(PullResponse {
                    status: PullStatus::NoNewMessages,
                    messages: Vec::new(),
                    next_offset: query.offset,
                    min_offset: 0,
                    max_offset: query.offset,
                });
            }
            let messages = (query.offset..query.offset + 3)
                .map(|offset| {
                    crate::message::ReceivedMessage::new(
                        crate::message::Message::new("orders", "payload"),
                        query.queue.clone(),
                        offset,
                        format!("msg-{offset}"),
                    )
                })
                .collect();
            Ok(PullResponse {
                status: PullStatus::Found,
                messages,
                next_offset: query.offset + 3,
                min_offset: 0,
                max_offset: query.offset + 3,
            })
        });

        let listener = Arc::new(CountingListener {
            consumed: AtomicUsize::new(0),
        });
        let offsets = Arc::new(InMemoryOffsetStore::new());
        offsets
            .update(&QueueId::new("orders", "broker-a", 0), 5, false)
            .await
            .unwrap();

        let consumer = PushConsumer::builder(config(), Arc::new(client))
            .listener(listener.clone())
            .offset_store(offsets.clone())
            .subscribe("orders", Some("tag-a || tag-b"))
            .build()
            .unwrap();
        consumer.start().unwrap();
        sleep(Duration::from_millis(300)).await;

        assert_eq!(consumer.assigned_queues(), vec![QueueId::new("orders", "broker-a", 0)]);
        assert_eq!(listener.consumed.load(Ordering::SeqCst), 3);
        assert_eq!(
            offsets
                .load(&QueueId::new("orders", "broker-a", 0))
                .await
                .unwrap(),
            Some(8)
        );

        consumer.shutdown().await.unwrap();
        assert!(matches!(
            consumer.shutdown().await,
            Err(PropelError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut client = MockBrokerClient::new();
        client.expect_fetch_queues().returning(|_| Ok(Vec::new()));
        client
            .expect_fetch_group_members()
            .returning(|_| Ok(vec!["member-a".to_string()]));
        let consumer = PushConsumer::builder(config(), Arc::new(client))
            .listener(Arc::new(CountingListener {
                consumed: AtomicUsize::new(0),
            }))
            .offset_store(Arc::new(InMemoryOffsetStore::new()))
            .build()
            .unwrap();

        consumer.start().unwrap();
        assert!(matches!(consumer.start(), Err(PropelError::AlreadyStarted)));
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn paused_consumer_does_not_pull() {
        let mut client = MockBrokerClient::new();
        client
            .expect_fetch_queues()
            .returning(|_| Ok(vec![QueueId::new("orders", "broker-a", 0)]));
        client
            .expect_fetch_group_members()
            .returning(|_| Ok(vec!["member-a".to_string()]));
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        client.expect_pull().returning(move |query| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(PullResponse {
                status: PullStatus::NoNewMessages,
                messages: Vec::new(),
                next_offset: query.offset,
                min_offset: 0,
                max_offset: query.offset,
            })
        });

        let offsets = Arc::new(InMemoryOffsetStore::new());
        offsets
            .update(&QueueId::new("orders", "broker-a", 0), 0, false)
            .await
            .unwrap();
        let consumer = PushConsumer::builder(config(), Arc::new(client))
            .listener(Arc::new(CountingListener {
                consumed: AtomicUsize::new(0),
            }))
            .offset_store(offsets)
            .subscribe("orders", None)
            .build()
            .unwrap();
        consumer.pause();
        consumer.start().unwrap();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        // The paused task retries after its one-second pause delay.
        consumer.resume();
        sleep(Duration::from_millis(1300)).await;
        assert!(pulls.load(Ordering::SeqCst) >= 1);

        consumer.shutdown().await.unwrap();
    }
}
