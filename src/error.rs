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

use thiserror::Error;
use tokio::io;

/// The error type for the client runtime.
#[derive(Debug, Error)]
pub enum PropelError {
    /// Configuration is invalid and the component cannot be built or started.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// No message listener was registered before starting the consumer.
    #[error("Missing message listener")]
    MissingMessageListener,
    /// No transaction checker was registered on a transactional producer.
    #[error("Missing transaction checker")]
    MissingTransactionChecker,
    /// The component was already started.
    #[error("Already started")]
    AlreadyStarted,
    /// The component was not started.
    #[error("Not started")]
    NotStarted,
    /// The producer was closed.
    #[error("Producer closed")]
    ProducerClosed,
    /// The broker or the network in front of it is unreachable.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The broker rejected the request.
    #[error("Broker error: {0}")]
    Broker(String),
    /// The broker did not acknowledge a half message.
    #[error("Half message rejected: {0}")]
    HalfMessageRejected(String),
    /// IO error.
    #[error("IO error")]
    IoError(#[from] io::Error),
    /// Serialization error.
    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),
}
