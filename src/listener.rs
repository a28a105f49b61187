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

use crate::message::ReceivedMessage;
use async_trait::async_trait;

/// Outcome reported by a [`MessageListener`] for one delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumeOutcome {
    /// The batch was consumed; its offsets may be committed.
    Success,
    /// The batch failed; redeliver it according to the retry policy.
    RetryLater,
    /// Orderly mode only: pause the queue briefly and redeliver the same batch,
    /// preserving order. Treated as [`ConsumeOutcome::RetryLater`] in concurrent
    /// mode.
    SuspendCurrentQueue,
}

/// Application-supplied callback invoked with each batch of pulled messages.
///
/// The listener is invoked from the consumption worker pool. In orderly mode
/// the batch is an in-order contiguous slice of one queue and no second batch
/// of that queue is delivered before this call returns. Panics are caught and
/// treated as [`ConsumeOutcome::RetryLater`].
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn consume(&self, messages: &[ReceivedMessage]) -> ConsumeOutcome;
}
