// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use hive_common::model::{AssignmentMap, PodAddress, ShardId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum AssignmentStoreError {
    #[error("assignment store failure: {0}")]
    Store(String),
}

impl From<sqlx::Error> for AssignmentStoreError {
    fn from(err: sqlx::Error) -> Self {
        AssignmentStoreError::Store(err.to_string())
    }
}

/// Durable storage for the computed shard assignments, written before
/// assignment changes are published to the cluster.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn read(&self) -> Result<AssignmentMap, AssignmentStoreError>;

    /// Replaces the stored map atomically.
    async fn write(&self, assignments: &AssignmentMap) -> Result<(), AssignmentStoreError>;
}

pub struct InMemoryAssignmentStore {
    assignments: RwLock<AssignmentMap>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self {
            assignments: RwLock::new(AssignmentMap::new()),
        }
    }
}

impl Default for InMemoryAssignmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn read(&self) -> Result<AssignmentMap, AssignmentStoreError> {
        Ok(self.assignments.read().await.clone())
    }

    async fn write(&self, assignments: &AssignmentMap) -> Result<(), AssignmentStoreError> {
        *self.assignments.write().await = assignments.clone();
        Ok(())
    }
}

pub struct SqliteAssignmentStore {
    pool: SqlitePool,
}

impl SqliteAssignmentStore {
    pub async fn new(database_file: &Path) -> Result<Self, AssignmentStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(database_file)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS shard_assignments (shard_id INTEGER PRIMARY KEY, pod TEXT)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl AssignmentStore for SqliteAssignmentStore {
    async fn read(&self) -> Result<AssignmentMap, AssignmentStoreError> {
        let rows = sqlx::query("SELECT shard_id, pod FROM shard_assignments ORDER BY shard_id")
            .fetch_all(&self.pool)
            .await?;

        let mut assignments = AssignmentMap::new();
        for row in rows {
            let shard_id: i64 = row.get(0);
            let pod: Option<String> = row.get(1);
            let pod = pod
                .map(|s| {
                    s.parse::<PodAddress>()
                        .map_err(AssignmentStoreError::Store)
                })
                .transpose()?;
            assignments.insert(ShardId(shard_id as u32), pod);
        }
        Ok(assignments)
    }

    async fn write(&self, assignments: &AssignmentMap) -> Result<(), AssignmentStoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM shard_assignments")
            .execute(&mut *tx)
            .await?;
        for (shard, pod) in assignments {
            sqlx::query("INSERT INTO shard_assignments (shard_id, pod) VALUES (?, ?)")
                .bind(shard.0 as i64)
                .bind(pod.as_ref().map(|p| p.to_string()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn sample_assignments() -> AssignmentMap {
        let mut assignments = AssignmentMap::new();
        assignments.insert(ShardId(0), Some(PodAddress::new("pod-a", 9000)));
        assignments.insert(ShardId(1), None);
        assignments.insert(ShardId(2), Some(PodAddress::new("pod-b", 9001)));
        assignments
    }

    #[test]
    async fn in_memory_store_roundtrips() {
        let store = InMemoryAssignmentStore::new();
        assert!(store.read().await.unwrap().is_empty());

        let assignments = sample_assignments();
        store.write(&assignments).await.unwrap();
        assert_eq!(store.read().await.unwrap(), assignments);
    }

    #[test]
    async fn sqlite_store_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAssignmentStore::new(&dir.path().join("assignments.db"))
            .await
            .unwrap();

        let assignments = sample_assignments();
        store.write(&assignments).await.unwrap();
        assert_eq!(store.read().await.unwrap(), assignments);

        // A second write replaces the previous map.
        let mut updated = assignments.clone();
        updated.insert(ShardId(1), Some(PodAddress::new("pod-c", 9002)));
        store.write(&updated).await.unwrap();
        assert_eq!(store.read().await.unwrap(), updated);
    }
}
