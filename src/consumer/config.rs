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

use crate::consumer::allocation::{AllocationStrategy, AverageAllocation};
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;

/// How batches of one queue may be dispatched to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumeMode {
    /// Multiple batches of the same queue may run in parallel; offsets advance
    /// along the lowest-unconsumed watermark.
    Concurrent,
    /// Strict per-queue serialization preserving message order.
    Orderly,
}

/// Where to start consuming a queue that has no committed offset yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Start from the oldest retained message.
    Earliest,
    /// Start from the next message to arrive.
    Latest,
    /// Start from the first message stored at or after this timestamp
    /// (milliseconds since the epoch).
    FromTimestamp(u64),
}

/// Configuration of a [`PushConsumer`](crate::consumer::PushConsumer).
///
/// # Examples
///
/// ```
/// use propel::consumer::{ConsumerConfig, ConsumeMode};
///
/// let config = ConsumerConfig::builder()
///     .group("billing".to_string())
///     .build();
///
/// // Orderly consumption with a larger batch
/// let config = ConsumerConfig::builder()
///     .group("billing".to_string())
///     .mode(ConsumeMode::Orderly)
///     .consume_batch_size(16)
///     .build();
/// ```
#[derive(Debug, Builder)]
pub struct ConsumerConfig {
    /// Consumer group id. Members sharing a group id split the subscribed
    /// topics' queues among themselves.
    pub group: String,
    /// This member's id within the group. Must match the id under which the
    /// broker collaborator registers this client.
    #[builder(default = default_member_id())]
    pub member_id: String,
    /// Dispatch mode, concurrent by default.
    #[builder(default = ConsumeMode::Concurrent)]
    pub mode: ConsumeMode,
    /// Start position for queues without a committed offset.
    #[builder(default = StartPosition::Latest)]
    pub start_position: StartPosition,
    /// Strategy splitting each topic's queues among the group members.
    #[builder(default = Arc::new(AverageAllocation))]
    pub allocation: Arc<dyn AllocationStrategy>,
    /// Floor of the consumption worker pool.
    #[builder(default = 10)]
    pub consume_thread_min: usize,
    /// Ceiling of the consumption worker pool; the async pool admits up to
    /// this many concurrent listener invocations.
    #[builder(default = num_cpus::get().clamp(10, 20))]
    pub consume_thread_max: usize,
    /// Number of messages handed to the listener per invocation.
    #[builder(default = 1)]
    pub consume_batch_size: usize,
    /// Maximum number of messages per pull request.
    #[builder(default = 32)]
    pub pull_batch_size: u32,
    /// Delay between a completed pull and the next one for the same queue.
    /// Zero pulls again immediately.
    #[builder(default = Duration::ZERO)]
    pub pull_interval: Duration,
    /// Delay before re-pulling a queue that reported no new messages, on top
    /// of the long-poll ceiling already bounding idle latency.
    #[builder(default = Duration::from_millis(50))]
    pub idle_pull_delay: Duration,
    /// Long-poll ceiling carried on every pull request.
    #[builder(default = Duration::from_secs(15))]
    pub long_poll_wait: Duration,
    /// Flow control: maximum offset span (highest minus lowest buffered
    /// offset) of one queue in concurrent mode.
    #[builder(default = 2000)]
    pub max_span: u64,
    /// Flow control: maximum buffered message count per queue.
    #[builder(default = 1000)]
    pub queue_buffer_limit: usize,
    /// Flow control: maximum buffered payload bytes per queue.
    #[builder(default = 100 * 1024 * 1024)]
    pub queue_buffer_bytes_limit: u64,
    /// How long to suspend pulling a queue that breached a flow-control
    /// ceiling.
    #[builder(default = Duration::from_millis(50))]
    pub flow_control_delay: Duration,
    /// First retry delay after a transport error on pull; doubles per
    /// consecutive failure.
    #[builder(default = Duration::from_millis(500))]
    pub pull_backoff_base: Duration,
    /// Ceiling of the pull retry backoff.
    #[builder(default = Duration::from_secs(10))]
    pub pull_backoff_max: Duration,
    /// Concurrent mode: in-process redeliveries of a failed batch before it
    /// is forwarded to the broker as a delayed retry message.
    #[builder(default = 2)]
    pub local_retry_limit: u32,
    /// Delay before an in-process redelivery.
    #[builder(default = Duration::from_secs(1))]
    pub local_retry_delay: Duration,
    /// Delay level attached to broker-forwarded retry messages; zero lets the
    /// broker pick the next level.
    #[builder(default = 0)]
    pub retry_delay_level: i32,
    /// Orderly mode: deliveries of one batch before it is dead-lettered to
    /// the broker and the queue moves on.
    #[builder(default = 16)]
    pub max_deliveries: u32,
    /// Orderly mode: pause before redelivering a failed batch.
    #[builder(default = Duration::from_secs(1))]
    pub suspend_queue_delay: Duration,
    /// Interval of the periodic rebalance.
    #[builder(default = Duration::from_secs(20))]
    pub rebalance_interval: Duration,
    /// Grace period granted to in-flight consumption of a revoked queue
    /// before its buffer is discarded.
    #[builder(default = Duration::from_secs(1))]
    pub revoke_grace: Duration,
    /// Interval of the periodic durable offset persistence.
    #[builder(default = Duration::from_secs(5))]
    pub offset_persist_interval: Duration,
    /// Bound on draining in-flight work at shutdown.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_timeout: Duration,
}

fn default_member_id() -> String {
    format!("{}-{}", env!("CARGO_PKG_NAME"), std::process::id())
}
