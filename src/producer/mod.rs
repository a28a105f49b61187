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

mod checkback;
pub mod config;
pub mod transaction;

pub use config::ProducerConfig;
pub use transaction::{
    InMemoryTransactionLog, LocalTransactionExecutor, TransactionChecker, TransactionLog,
    TransactionRecord, TransactionState,
};

use crate::broker::{BrokerClient, CheckQuery, TransactionDecision};
use crate::error::PropelError;
use crate::message::Message;
use checkback::CheckbackService;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a transactional send.
#[derive(Debug, Clone)]
pub struct TransactionSendResult {
    pub transaction_id: String,
    /// Broker-assigned id of the half message.
    pub message_id: String,
    /// Offset of the half message in the broker's transaction store.
    pub transaction_offset: u64,
    /// Decision reached by the local branch; `Unknown` resolves later via
    /// check-back.
    pub outcome: TransactionDecision,
}

/// A producer whose sends are coupled to the outcome of a local transaction.
///
/// Each send stores a half message (invisible to consumers), runs the
/// supplied local branch, and forwards the resulting commit or rollback to
/// the broker. Branches that cannot decide leave the message `Unknown`; the
/// broker then periodically checks back and the registered
/// [`TransactionChecker`] settles the outcome from application state.
///
/// Construction fails fast without a checker, since unanswerable check-backs
/// would leave half messages in limbo until the broker discards them.
pub struct TransactionProducer {
    config: Arc<ProducerConfig>,
    client: Arc<dyn BrokerClient>,
    log: Arc<dyn TransactionLog>,
    check_tx: flume::Sender<CheckQuery>,
    checker: Arc<dyn TransactionChecker>,
    stop: broadcast::Sender<()>,
    closed: AtomicBool,
    service: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionProducer {
    pub fn builder(config: ProducerConfig, client: Arc<dyn BrokerClient>) -> TransactionProducerBuilder {
        TransactionProducerBuilder {
            config,
            client,
            checker: None,
            log: None,
        }
    }

    /// The channel the broker collaborator feeds incoming check-back queries
    /// into.
    pub fn check_query_sender(&self) -> flume::Sender<CheckQuery> {
        self.check_tx.clone()
    }

    /// Sends `message` transactionally: half send, local branch, decision.
    pub async fn send_in_transaction(
        &self,
        message: Message,
        executor: &dyn LocalTransactionExecutor,
    ) -> Result<TransactionSendResult, PropelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PropelError::ProducerClosed);
        }
        let transaction_id = Uuid::now_v7().to_string();
        self.log
            .insert(TransactionRecord::new(transaction_id.clone(), message.clone()))
            .await;

        let ack = match self.send_half(&message, &transaction_id).await {
            Ok(ack) => ack,
            Err(e) => {
                self.log.remove(&transaction_id).await;
                return Err(e);
            }
        };
        self.log.set_offset(&transaction_id, ack.transaction_offset).await;
        self.log.transition(&transaction_id, TransactionState::HalfSent).await;
        debug!(transaction_id = %transaction_id, message_id = %ack.message_id, "half message stored");

        let outcome = match std::panic::AssertUnwindSafe(executor.execute(&message, &transaction_id))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(transaction_id = %transaction_id, "local transaction branch panicked: {panic:?}");
                TransactionDecision::Unknown
            }
        };

        match outcome {
            TransactionDecision::Commit => {
                self.settle(&transaction_id, ack.transaction_offset, TransactionState::Committed, outcome)
                    .await;
            }
            TransactionDecision::Rollback => {
                self.settle(&transaction_id, ack.transaction_offset, TransactionState::RolledBack, outcome)
                    .await;
            }
            TransactionDecision::Unknown => {
                self.log.transition(&transaction_id, TransactionState::Unknown).await;
                debug!(transaction_id = %transaction_id, "local branch undecided, broker will check back");
            }
        }

        Ok(TransactionSendResult {
            transaction_id,
            message_id: ack.message_id,
            transaction_offset: ack.transaction_offset,
            outcome,
        })
    }

    /// Resolves one check-back query without responding to the broker, for
    /// collaborators that carry the answer on their own response channel.
    pub async fn resolve_check(&self, query: &CheckQuery) -> TransactionDecision {
        transaction::resolve(&self.log, &self.checker, query).await
    }

    /// Stops the check-back responder.
    pub async fn shutdown(&self) -> Result<(), PropelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PropelError::ProducerClosed);
        }
        let _ = self.stop.send(());
        let handle = self.service.lock().expect("service handle lock poisoned").take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("check-back responder did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(group = %self.config.group, "producer stopped");
        Ok(())
    }

    async fn send_half(
        &self,
        message: &Message,
        transaction_id: &str,
    ) -> Result<crate::broker::HalfMessageAck, PropelError> {
        let mut attempt = 0;
        loop {
            match self.client.send_half_message(message, transaction_id).await {
                Ok(ack) => return Ok(ack),
                Err(e) if attempt < self.config.send_retries => {
                    attempt += 1;
                    warn!(
                        transaction_id,
                        attempt,
                        error = %e,
                        "half message send failed, retrying"
                    );
                    tokio::time::sleep(self.config.send_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Records the branch decision and forwards it to the broker. A failed
    /// forward keeps the resolved record so a later check-back settles it.
    async fn settle(
        &self,
        transaction_id: &str,
        transaction_offset: u64,
        state: TransactionState,
        decision: TransactionDecision,
    ) {
        self.log.transition(transaction_id, state).await;
        match self
            .client
            .end_transaction(transaction_id, transaction_offset, decision, false)
            .await
        {
            Ok(()) => self.log.remove(transaction_id).await,
            Err(e) => warn!(
                transaction_id,
                decision = %decision,
                error = %e,
                "failed to end transaction, check-back will settle it"
            ),
        }
    }
}

/// Builder wiring a [`TransactionProducer`] out of its collaborators.
pub struct TransactionProducerBuilder {
    config: ProducerConfig,
    client: Arc<dyn BrokerClient>,
    checker: Option<Arc<dyn TransactionChecker>>,
    log: Option<Arc<dyn TransactionLog>>,
}

impl TransactionProducerBuilder {
    /// Registers the check-back responder. Required.
    pub fn checker(self, checker: Arc<dyn TransactionChecker>) -> Self {
        Self {
            checker: Some(checker),
            ..self
        }
    }

    /// Replaces the default in-memory transaction log.
    pub fn transaction_log(self, log: Arc<dyn TransactionLog>) -> Self {
        Self {
            log: Some(log),
            ..self
        }
    }

    pub fn build(self) -> Result<TransactionProducer, PropelError> {
        if self.config.group.is_empty() {
            return Err(PropelError::InvalidConfiguration(
                "producer group id must not be empty".to_string(),
            ));
        }
        let Some(checker) = self.checker else {
            return Err(PropelError::MissingTransactionChecker);
        };
        let config = Arc::new(self.config);
        let log = self.log.unwrap_or_else(|| Arc::new(InMemoryTransactionLog::new()));
        let (check_tx, check_rx) = flume::unbounded();
        let (stop, _) = broadcast::channel(1);

        let service = Arc::new(CheckbackService::new(
            config.clone(),
            self.client.clone(),
            log.clone(),
            checker.clone(),
            check_rx,
        ));
        let handle = tokio::spawn(service.run(stop.subscribe()));
        info!(group = %config.group, "producer started");

        Ok(TransactionProducer {
            config,
            client: self.client,
            log,
            check_tx,
            checker,
            stop,
            closed: AtomicBool::new(false),
            service: Mutex::new(Some(handle)),
        })
    }
}
