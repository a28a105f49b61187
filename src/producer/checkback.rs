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

use crate::broker::{BrokerClient, CheckQuery, TransactionDecision};
use crate::producer::config::ProducerConfig;
use crate::producer::transaction::{resolve, TransactionChecker, TransactionLog};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Answers broker-initiated transaction check-back queries.
///
/// Queries arrive through a channel fed by the broker collaborator and are
/// handled by a bounded responder pool, concurrently with new transactional
/// sends. Definite decisions are forwarded to the broker; `Unknown` sends
/// nothing and leaves the next move to the broker's check schedule. The
/// service also runs the periodic transaction-log eviction sweep.
pub(crate) struct CheckbackService {
    config: Arc<ProducerConfig>,
    client: Arc<dyn BrokerClient>,
    log: Arc<dyn TransactionLog>,
    checker: Arc<dyn TransactionChecker>,
    rx: flume::Receiver<CheckQuery>,
    permits: Arc<Semaphore>,
}

impl CheckbackService {
    pub fn new(
        config: Arc<ProducerConfig>,
        client: Arc<dyn BrokerClient>,
        log: Arc<dyn TransactionLog>,
        checker: Arc<dyn TransactionChecker>,
        rx: flume::Receiver<CheckQuery>,
    ) -> Self {
        let workers = config.check_thread_max.max(config.check_thread_min).max(1);
        Self {
            config,
            client,
            log,
            checker,
            rx,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub async fn run(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let mut sweep = tokio::time::interval(self.config.evict_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;
        loop {
            tokio::select! {
                query = self.rx.recv_async() => {
                    match query {
                        Ok(query) => {
                            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                                break;
                            };
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle(query).await;
                                drop(permit);
                            });
                        }
                        Err(_) => break,
                    }
                }
                _ = sweep.tick() => {
                    let removed = self
                        .log
                        .evict(self.config.transaction_retention, self.config.transaction_hold_max)
                        .await;
                    if removed > 0 {
                        debug!(removed, "evicted transaction log records");
                    }
                }
                _ = stop.recv() => break,
            }
        }
        debug!("check-back responder stopped");
    }

    async fn handle(&self, query: CheckQuery) {
        let decision = resolve(&self.log, &self.checker, &query).await;
        debug!(
            transaction_id = %query.transaction_id,
            decision = %decision,
            "resolved check-back query"
        );
        if decision == TransactionDecision::Unknown {
            // Nothing is sent; the broker re-checks until its count ceiling.
            return;
        }
        match self
            .client
            .end_transaction(&query.transaction_id, query.transaction_offset, decision, true)
            .await
        {
            Ok(()) => self.log.remove(&query.transaction_id).await,
            Err(e) => warn!(
                transaction_id = %query.transaction_id,
                error = %e,
                "failed to answer check-back, broker will ask again"
            ),
        }
    }
}
