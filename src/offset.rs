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

use crate::broker::BrokerClient;
use crate::error::PropelError;
use crate::queue::QueueId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Persists and retrieves the last-consumed offset per queue.
///
/// `update` with `persist_now == false` must be cheap and local: the
/// dispatcher calls it while holding a queue's ordering lock. Durable writes
/// happen on `persist_now == true`, on [`OffsetStore::persist`] and on
/// [`OffsetStore::persist_all`]. Committed offsets never move backwards; an
/// update below the recorded value is ignored.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    /// Reads the committed offset for a queue. `None` on first run.
    async fn load(&self, queue: &QueueId) -> Result<Option<u64>, PropelError>;

    /// Advances the committed offset for a queue.
    async fn update(&self, queue: &QueueId, offset: u64, persist_now: bool) -> Result<(), PropelError>;

    /// Durably persists the tracked offset of one queue.
    async fn persist(&self, queue: &QueueId) -> Result<(), PropelError>;

    /// Durably persists every tracked offset.
    async fn persist_all(&self) -> Result<(), PropelError>;

    /// Forgets a queue, after it has been revoked from this client.
    async fn remove(&self, queue: &QueueId) -> Result<(), PropelError>;
}

fn advance(table: &DashMap<QueueId, u64>, queue: &QueueId, offset: u64) -> bool {
    let mut entry = table.entry(queue.clone()).or_insert(offset);
    if *entry > offset {
        debug!(queue = %queue, current = *entry, offset, "ignoring offset regression");
        return false;
    }
    *entry = offset;
    true
}

/// Offset store kept entirely in memory. Offsets are lost on restart, which
/// makes it suitable for tests and for replay-tolerant consumers only.
#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    table: DashMap<QueueId, u64>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self, queue: &QueueId) -> Result<Option<u64>, PropelError> {
        Ok(self.table.get(queue).map(|entry| *entry))
    }

    async fn update(&self, queue: &QueueId, offset: u64, _persist_now: bool) -> Result<(), PropelError> {
        advance(&self.table, queue, offset);
        Ok(())
    }

    async fn persist(&self, _queue: &QueueId) -> Result<(), PropelError> {
        Ok(())
    }

    async fn persist_all(&self) -> Result<(), PropelError> {
        Ok(())
    }

    async fn remove(&self, queue: &QueueId) -> Result<(), PropelError> {
        self.table.remove(queue);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetEntry {
    queue: QueueId,
    offset: u64,
}

/// Offset store persisted as a JSON file on local disk.
#[derive(Debug)]
pub struct LocalFileOffsetStore {
    path: PathBuf,
    table: DashMap<QueueId, u64>,
}

impl LocalFileOffsetStore {
    /// Opens the store, hydrating it from `path` when the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PropelError> {
        let path = path.into();
        let table = DashMap::new();
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                let entries: Vec<OffsetEntry> = serde_json::from_slice(&raw)?;
                for entry in entries {
                    table.insert(entry.queue, entry.offset);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no offset file yet, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path, table })
    }

    async fn flush(&self) -> Result<(), PropelError> {
        let entries: Vec<OffsetEntry> = self
            .table
            .iter()
            .map(|entry| OffsetEntry {
                queue: entry.key().clone(),
                offset: *entry.value(),
            })
            .collect();
        let raw = serde_json::to_vec_pretty(&entries)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl OffsetStore for LocalFileOffsetStore {
    async fn load(&self, queue: &QueueId) -> Result<Option<u64>, PropelError> {
        Ok(self.table.get(queue).map(|entry| *entry))
    }

    async fn update(&self, queue: &QueueId, offset: u64, persist_now: bool) -> Result<(), PropelError> {
        if advance(&self.table, queue, offset) && persist_now {
            self.flush().await?;
        }
        Ok(())
    }

    async fn persist(&self, _queue: &QueueId) -> Result<(), PropelError> {
        self.flush().await
    }

    async fn persist_all(&self) -> Result<(), PropelError> {
        self.flush().await
    }

    async fn remove(&self, queue: &QueueId) -> Result<(), PropelError> {
        self.table.remove(queue);
        self.flush().await
    }
}

/// Offset store backed by the broker, with a local write-through cache.
///
/// Reads prefer the cache and fall back to the broker; `persist` and
/// `persist_all` commit cached offsets remotely. This is the default store
/// for group (clustering) consumption.
pub struct BrokerOffsetStore {
    group: String,
    client: Arc<dyn BrokerClient>,
    table: DashMap<QueueId, u64>,
}

impl BrokerOffsetStore {
    pub fn new(group: impl Into<String>, client: Arc<dyn BrokerClient>) -> Self {
        Self {
            group: group.into(),
            client,
            table: DashMap::new(),
        }
    }
}

#[async_trait]
impl OffsetStore for BrokerOffsetStore {
    async fn load(&self, queue: &QueueId) -> Result<Option<u64>, PropelError> {
        if let Some(offset) = self.table.get(queue).map(|entry| *entry) {
            return Ok(Some(offset));
        }
        let remote = self.client.load_offset(&self.group, queue).await?;
        if let Some(offset) = remote {
            advance(&self.table, queue, offset);
        }
        Ok(remote)
    }

    async fn update(&self, queue: &QueueId, offset: u64, persist_now: bool) -> Result<(), PropelError> {
        if advance(&self.table, queue, offset) && persist_now {
            self.client.commit_offset(&self.group, queue, offset).await?;
        }
        Ok(())
    }

    async fn persist(&self, queue: &QueueId) -> Result<(), PropelError> {
        let Some(offset) = self.table.get(queue).map(|entry| *entry) else {
            return Ok(());
        };
        self.client.commit_offset(&self.group, queue, offset).await
    }

    async fn persist_all(&self) -> Result<(), PropelError> {
        let snapshot: Vec<(QueueId, u64)> = self
            .table
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (queue, offset) in snapshot {
            if let Err(e) = self.client.commit_offset(&self.group, &queue, offset).await {
                warn!(queue = %queue, offset, error = %e, "failed to commit offset, will retry next cycle");
            }
        }
        Ok(())
    }

    async fn remove(&self, queue: &QueueId) -> Result<(), PropelError> {
        self.table.remove(queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerClient;

    fn queue() -> QueueId {
        QueueId::new("orders", "broker-a", 0)
    }

    #[tokio::test]
    async fn in_memory_store_is_monotonic() {
        let store = InMemoryOffsetStore::new();
        store.update(&queue(), 10, false).await.unwrap();
        store.update(&queue(), 7, false).await.unwrap();
        assert_eq!(store.load(&queue()).await.unwrap(), Some(10));
        store.update(&queue(), 11, false).await.unwrap();
        assert_eq!(store.load(&queue()).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn local_file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "propel-offsets-{}.json",
            uuid::Uuid::now_v7().simple()
        ));
        {
            let store = LocalFileOffsetStore::open(&path).await.unwrap();
            store.update(&queue(), 42, false).await.unwrap();
            store.persist_all().await.unwrap();
        }
        let reopened = LocalFileOffsetStore::open(&path).await.unwrap();
        assert_eq!(reopened.load(&queue()).await.unwrap(), Some(42));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn broker_store_falls_back_to_remote_load() {
        let mut client = MockBrokerClient::new();
        client
            .expect_load_offset()
            .withf(|group, q| group == "billing" && *q == queue())
            .times(1)
            .returning(|_, _| Ok(Some(5)));
        let store = BrokerOffsetStore::new("billing", Arc::new(client));

        assert_eq!(store.load(&queue()).await.unwrap(), Some(5));
        // Second load is served from the cache; the mock allows one call only.
        assert_eq!(store.load(&queue()).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn broker_store_commits_on_persist_all() {
        let mut client = MockBrokerClient::new();
        client.expect_load_offset().returning(|_, _| Ok(None));
        client
            .expect_commit_offset()
            .withf(|group, q, offset| group == "billing" && *q == queue() && *offset == 9)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let store = BrokerOffsetStore::new("billing", Arc::new(client));

        store.update(&queue(), 9, false).await.unwrap();
        store.persist_all().await.unwrap();
    }
}
