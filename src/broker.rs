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

use crate::error::PropelError;
use crate::message::{Message, ReceivedMessage};
use crate::queue::QueueId;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// A single pull request against one broker queue.
#[derive(Debug, Clone)]
pub struct PullQuery {
    /// Queue to pull from.
    pub queue: QueueId,
    /// Offset to start pulling at.
    pub offset: u64,
    /// Maximum number of messages to return.
    pub max_count: u32,
    /// Long-poll ceiling: the broker may hold the request open until new data
    /// arrives or this much time elapses.
    pub long_poll_wait: Duration,
    /// Optional subscription filter expression.
    pub filter: Option<String>,
}

/// Status of a pull response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PullStatus {
    /// New messages were returned.
    Found,
    /// The queue has no new data past the requested offset.
    NoNewMessages,
    /// The requested offset is outside the broker's retained range.
    OffsetIllegal,
    /// The addressed replica cannot serve the pull; retry against the
    /// broker-suggested offset.
    SlaveNotAvailable,
}

/// Response to a [`PullQuery`].
#[derive(Debug, Clone)]
pub struct PullResponse {
    pub status: PullStatus,
    /// Messages in offset order; empty unless status is [`PullStatus::Found`].
    pub messages: Vec<ReceivedMessage>,
    /// Broker-suggested offset for the next pull.
    pub next_offset: u64,
    /// Lowest offset currently retained by the queue.
    pub min_offset: u64,
    /// One past the newest stored offset (the queue's next write position).
    pub max_offset: u64,
}

/// Broker acknowledgment of a stored half message.
#[derive(Debug, Clone)]
pub struct HalfMessageAck {
    /// Broker-assigned id of the half message.
    pub message_id: String,
    /// Offset of the half message in the broker's transaction store, echoed
    /// back when the transaction is ended or checked.
    pub transaction_offset: u64,
}

/// Final decision for a transactional message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransactionDecision {
    /// Make the half message visible to consumers.
    Commit,
    /// Discard the half message.
    Rollback,
    /// Not yet decided; the broker will check back later.
    Unknown,
}

/// A broker-initiated query asking this producer to resolve a transaction
/// whose outcome the broker has not yet seen.
#[derive(Debug, Clone)]
pub struct CheckQuery {
    pub transaction_id: String,
    /// The half message as stored by the broker.
    pub message: Message,
    /// Offset of the half message in the broker's transaction store.
    pub transaction_offset: u64,
}

/// Narrow interface to the broker RPC layer.
///
/// Implementations own connection management, wire framing and broker
/// discovery; the runtime only sees these calls. Every method may suspend on
/// the network and returns [`PropelError::Transport`] when the broker is
/// unreachable.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Issues one (long-poll) pull request.
    async fn pull(&self, query: PullQuery) -> Result<PullResponse, PropelError>;

    /// Fetches the current queue list of a topic.
    async fn fetch_queues(&self, topic: &str) -> Result<Vec<QueueId>, PropelError>;

    /// Fetches the ids of all live members of a consumer group.
    async fn fetch_group_members(&self, group: &str) -> Result<Vec<String>, PropelError>;

    /// Reads the group's committed offset for a queue, if any.
    async fn load_offset(&self, group: &str, queue: &QueueId) -> Result<Option<u64>, PropelError>;

    /// Commits the group's consume offset for a queue.
    async fn commit_offset(&self, group: &str, queue: &QueueId, offset: u64) -> Result<(), PropelError>;

    /// Returns the queue's `(min, max)` offsets: the lowest retained offset
    /// and one past the newest stored offset.
    async fn queue_offset_range(&self, queue: &QueueId) -> Result<(u64, u64), PropelError>;

    /// Finds the first offset stored at or after the given timestamp.
    async fn search_offset(&self, queue: &QueueId, timestamp_ms: u64) -> Result<u64, PropelError>;

    /// Sends a consumed-but-failed message back to the broker for delayed
    /// redelivery to the group.
    async fn send_retry_message(
        &self,
        group: &str,
        message: &ReceivedMessage,
        delay_level: i32,
    ) -> Result<(), PropelError>;

    /// Sends a half message: stored by the broker but withheld from consumers
    /// until the transaction is committed.
    async fn send_half_message(
        &self,
        message: &Message,
        transaction_id: &str,
    ) -> Result<HalfMessageAck, PropelError>;

    /// Forwards the transaction decision to the broker. `from_check` marks
    /// responses to broker-initiated check-back queries.
    async fn end_transaction(
        &self,
        transaction_id: &str,
        transaction_offset: u64,
        decision: TransactionDecision,
        from_check: bool,
    ) -> Result<(), PropelError>;
}
