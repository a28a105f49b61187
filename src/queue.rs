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

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identity of a single broker queue: `{topic, broker, index}`.
///
/// Immutable and globally comparable. The derived ordering (topic, then broker,
/// then index) is the deterministic ordering used by allocation strategies, so
/// all group members sorting the same queue list agree on queue positions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueId {
    /// Topic the queue belongs to.
    pub topic: String,
    /// Identity of the broker hosting the queue.
    pub broker: String,
    /// Queue index within the topic on that broker.
    pub index: u32,
}

impl QueueId {
    pub fn new(topic: impl Into<String>, broker: impl Into<String>, index: u32) -> Self {
        Self {
            topic: topic.into(),
            broker: broker.into(),
            index,
        }
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.topic, self.broker, self.index)
    }
}
