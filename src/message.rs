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

use crate::queue::QueueId;
use bytes::Bytes;

/// A message as handed to the client by the application.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Destination topic.
    pub topic: String,
    /// Optional tag used by subscription filter expressions.
    pub tag: Option<String>,
    /// Optional business key.
    pub key: Option<String>,
    /// Message payload.
    pub body: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            tag: None,
            key: None,
            body: body.into(),
        }
    }

    /// Sets the tag used by subscription filter expressions.
    pub fn with_tag(self, tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..self
        }
    }

    /// Sets the business key.
    pub fn with_key(self, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..self
        }
    }
}

/// A message pulled from a broker queue, together with its delivery metadata.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The message content.
    pub message: Message,
    /// Queue the message was pulled from.
    pub queue: QueueId,
    /// Logical offset of the message within its queue.
    pub offset: u64,
    /// Broker-assigned message id.
    pub id: String,
    /// Broker store timestamp, in milliseconds since the epoch.
    pub stored_at: u64,
    /// Number of redeliveries this client has performed for the message.
    pub delivery_count: u32,
}

impl ReceivedMessage {
    pub fn new(message: Message, queue: QueueId, offset: u64, id: impl Into<String>) -> Self {
        Self {
            message,
            queue,
            offset,
            id: id.into(),
            stored_at: 0,
            delivery_count: 0,
        }
    }
}
