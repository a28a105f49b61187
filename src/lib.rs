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

//! Propel is the client-side runtime of a distributed publish/pull message
//! broker: push-semantics consumption over a pull-based transport, plus
//! transactional sends.
//!
//! The consumption side joins a consumer group, splits the subscribed
//! topics' queues among the live members ([`consumer::allocation`]),
//! long-polls each assigned queue, buffers pulled messages per queue and
//! dispatches them to the application's [`listener::MessageListener`] with
//! flow control, retry handling and offset tracking ([`offset`]).
//!
//! The producer side couples message visibility to a local transaction: a
//! half message is stored first, the local branch runs, and the outcome is
//! forwarded to the broker or settled later through broker-initiated
//! check-back queries ([`producer`]).
//!
//! Transport, broker discovery and wire framing are not part of this crate;
//! they are supplied through the [`broker::BrokerClient`] trait.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod listener;
pub mod message;
pub mod offset;
pub mod prelude;
pub mod producer;
pub mod queue;
