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

//! The commonly used types, re-exported in one place.

pub use crate::broker::{
    BrokerClient, CheckQuery, HalfMessageAck, PullQuery, PullResponse, PullStatus,
    TransactionDecision,
};
pub use crate::consumer::allocation::{AllocationStrategy, AverageAllocation, CircularAllocation};
pub use crate::consumer::{ConsumeMode, ConsumerConfig, PushConsumer, StartPosition};
pub use crate::error::PropelError;
pub use crate::listener::{ConsumeOutcome, MessageListener};
pub use crate::message::{Message, ReceivedMessage};
pub use crate::offset::{
    BrokerOffsetStore, InMemoryOffsetStore, LocalFileOffsetStore, OffsetStore,
};
pub use crate::producer::{
    InMemoryTransactionLog, LocalTransactionExecutor, ProducerConfig, TransactionChecker,
    TransactionLog, TransactionProducer, TransactionRecord, TransactionSendResult,
    TransactionState,
};
pub use crate::queue::QueueId;
