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

use bon::Builder;
use std::time::Duration;

/// Configuration of a [`TransactionProducer`](crate::producer::TransactionProducer).
///
/// # Examples
///
/// ```
/// use propel::producer::ProducerConfig;
///
/// let config = ProducerConfig::builder()
///     .group("payments".to_string())
///     .build();
/// ```
#[derive(Debug, Builder)]
pub struct ProducerConfig {
    /// Producer group id; the broker addresses check-back queries to it.
    pub group: String,
    /// Floor of the check-back responder pool.
    #[builder(default = 1)]
    pub check_thread_min: usize,
    /// Ceiling of the check-back responder pool.
    #[builder(default = 1)]
    pub check_thread_max: usize,
    /// Hold ceiling of the local transaction log; the oldest records are
    /// evicted past it.
    #[builder(default = 2000)]
    pub transaction_hold_max: usize,
    /// Retention ceiling of the local transaction log.
    #[builder(default = Duration::from_secs(3600))]
    pub transaction_retention: Duration,
    /// Interval of the transaction log eviction sweep.
    #[builder(default = Duration::from_secs(60))]
    pub evict_sweep_interval: Duration,
    /// Additional attempts for a failed half-message send.
    #[builder(default = 2)]
    pub send_retries: u32,
    /// Delay between half-message send attempts.
    #[builder(default = Duration::from_secs(1))]
    pub send_retry_delay: Duration,
    /// Bound on stopping the responder service at shutdown.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_timeout: Duration,
}
