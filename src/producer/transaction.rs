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

use crate::broker::{CheckQuery, TransactionDecision};
use crate::message::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// State of one transactional message as tracked by this producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransactionState {
    /// The half message is on its way to the broker.
    SendingHalf,
    /// The broker acknowledged the half message; the local branch has not
    /// decided yet.
    HalfSent,
    /// The local branch committed.
    Committed,
    /// The local branch rolled back.
    RolledBack,
    /// The local branch could not decide; the broker will check back.
    Unknown,
}

/// One entry of the local transaction log.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub message: Message,
    pub state: TransactionState,
    /// Offset of the half message in the broker's transaction store.
    pub transaction_offset: u64,
    /// Check-back queries answered `Unknown` for this record so far.
    pub check_count: u32,
    pub created_at: Instant,
}

impl TransactionRecord {
    pub fn new(transaction_id: impl Into<String>, message: Message) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            message,
            state: TransactionState::SendingHalf,
            transaction_offset: 0,
            check_count: 0,
            created_at: Instant::now(),
        }
    }
}

/// Executes the local transaction branch coupled to one transactional send.
#[async_trait]
pub trait LocalTransactionExecutor: Send + Sync {
    async fn execute(&self, message: &Message, transaction_id: &str) -> TransactionDecision;
}

/// Resolves the outcome of a transaction the broker is asking about, from
/// application state. Returning [`TransactionDecision::Unknown`] defers to a
/// later check-back, bounded by the broker's maximum check count.
#[async_trait]
pub trait TransactionChecker: Send + Sync + 'static {
    async fn check(&self, transaction_id: &str, message: &Message) -> TransactionDecision;
}

/// The local transaction log: one record per transaction id, safe for
/// concurrent per-id access. In-memory by default; durable implementations
/// can survive restarts, and a missing record is always answerable with
/// `Unknown`.
#[async_trait]
pub trait TransactionLog: Send + Sync + 'static {
    async fn insert(&self, record: TransactionRecord);

    async fn get(&self, transaction_id: &str) -> Option<TransactionRecord>;

    /// Moves a record to a new state; no-op for unknown ids.
    async fn transition(&self, transaction_id: &str, state: TransactionState);

    async fn set_offset(&self, transaction_id: &str, transaction_offset: u64);

    /// Bumps a record's check counter, returning the new count.
    async fn record_check(&self, transaction_id: &str) -> Option<u32>;

    async fn remove(&self, transaction_id: &str);

    async fn len(&self) -> usize;

    /// Drops expired records, then the oldest records past the hold ceiling.
    /// Returns the number of evicted records.
    async fn evict(&self, retention: Duration, hold_max: usize) -> usize;
}

/// [`TransactionLog`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    records: DashMap<String, TransactionRecord>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn insert(&self, record: TransactionRecord) {
        self.records.insert(record.transaction_id.clone(), record);
    }

    async fn get(&self, transaction_id: &str) -> Option<TransactionRecord> {
        self.records.get(transaction_id).map(|entry| entry.value().clone())
    }

    async fn transition(&self, transaction_id: &str, state: TransactionState) {
        if let Some(mut entry) = self.records.get_mut(transaction_id) {
            entry.state = state;
        }
    }

    async fn set_offset(&self, transaction_id: &str, transaction_offset: u64) {
        if let Some(mut entry) = self.records.get_mut(transaction_id) {
            entry.transaction_offset = transaction_offset;
        }
    }

    async fn record_check(&self, transaction_id: &str) -> Option<u32> {
        self.records.get_mut(transaction_id).map(|mut entry| {
            entry.check_count += 1;
            entry.check_count
        })
    }

    async fn remove(&self, transaction_id: &str) {
        self.records.remove(transaction_id);
    }

    async fn len(&self) -> usize {
        self.records.len()
    }

    async fn evict(&self, retention: Duration, hold_max: usize) -> usize {
        let mut removed = 0;
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.created_at.elapsed() > retention)
            .map(|entry| entry.key().clone())
            .collect();
        for transaction_id in expired {
            self.records.remove(&transaction_id);
            removed += 1;
        }
        let over = self.records.len().saturating_sub(hold_max);
        if over > 0 {
            let mut entries: Vec<(String, Instant)> = self
                .records
                .iter()
                .map(|entry| (entry.key().clone(), entry.created_at))
                .collect();
            entries.sort_by_key(|(_, created_at)| *created_at);
            for (transaction_id, _) in entries.into_iter().take(over) {
                self.records.remove(&transaction_id);
                removed += 1;
            }
        }
        removed
    }
}

/// Answers one check-back query from the log, falling back to the
/// application's checker, and records the result back into the log.
pub(crate) async fn resolve(
    log: &Arc<dyn TransactionLog>,
    checker: &Arc<dyn TransactionChecker>,
    query: &CheckQuery,
) -> TransactionDecision {
    let record = log.get(&query.transaction_id).await;
    let decision = match &record {
        Some(record) => match record.state {
            TransactionState::Committed => TransactionDecision::Commit,
            TransactionState::RolledBack => TransactionDecision::Rollback,
            _ => check(checker, &query.transaction_id, &record.message).await,
        },
        None => check(checker, &query.transaction_id, &query.message).await,
    };
    match decision {
        TransactionDecision::Commit => {
            log.transition(&query.transaction_id, TransactionState::Committed).await;
        }
        TransactionDecision::Rollback => {
            log.transition(&query.transaction_id, TransactionState::RolledBack).await;
        }
        TransactionDecision::Unknown => {
            if record.is_some() {
                log.record_check(&query.transaction_id).await;
            }
        }
    }
    decision
}

async fn check(
    checker: &Arc<dyn TransactionChecker>,
    transaction_id: &str,
    message: &Message,
) -> TransactionDecision {
    match std::panic::AssertUnwindSafe(checker.check(transaction_id, message))
        .catch_unwind()
        .await
    {
        Ok(decision) => decision,
        Err(panic) => {
            error!(transaction_id, "transaction checker panicked: {panic:?}");
            TransactionDecision::Unknown
        }
    }
}
