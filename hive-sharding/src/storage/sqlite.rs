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

use crate::storage::{MailboxStorage, MailboxStorageError, MessageEntry};
use async_trait::async_trait;
use hive_common::envelope::{MessageExit, MessageState};
use hive_common::model::EntityAddress;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Durable mailbox storage on sqlite. `ask` waiters poll for the terminal
/// state; deployments needing push-style delivery plug in their own store.
pub struct SqliteMailboxStorage {
    pool: SqlitePool,
}

impl SqliteMailboxStorage {
    pub async fn new(database_file: &Path) -> Result<Self, MailboxStorageError> {
        let options = SqliteConnectOptions::new()
            .filename(database_file)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(to_storage_error)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mailbox_messages (
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                shard_id INTEGER NOT NULL,
                sequence_number INTEGER NOT NULL,
                primary_key TEXT NOT NULL,
                message TEXT NOT NULL,
                state TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id, sequence_number)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(to_storage_error)?;
        Ok(Self { pool })
    }
}

fn to_storage_error(err: sqlx::Error) -> MailboxStorageError {
    MailboxStorageError::Persistence(err.to_string())
}

fn encode_state(state: &MessageState) -> Result<String, MailboxStorageError> {
    serde_json::to_string(state).map_err(|err| MailboxStorageError::Persistence(err.to_string()))
}

fn decode_state(raw: &str) -> Result<MessageState, MailboxStorageError> {
    serde_json::from_str(raw).map_err(|err| MailboxStorageError::Persistence(err.to_string()))
}

#[async_trait]
impl MailboxStorage for SqliteMailboxStorage {
    async fn save_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        message: &serde_json::Value,
    ) -> Result<MessageEntry, MailboxStorageError> {
        // The nested select makes sequence assignment atomic per statement.
        let row = sqlx::query(
            r#"
            INSERT INTO mailbox_messages
                (entity_type, entity_id, shard_id, sequence_number, primary_key, message, state)
            VALUES (?, ?, ?,
                (SELECT COALESCE(MAX(sequence_number), 0) + 1
                   FROM mailbox_messages WHERE entity_type = ? AND entity_id = ?),
                ?, ?, ?)
            RETURNING sequence_number
            "#,
        )
        .bind(address.entity_type.as_str())
        .bind(&address.entity_id)
        .bind(address.shard_id.0 as i64)
        .bind(address.entity_type.as_str())
        .bind(&address.entity_id)
        .bind(primary_key)
        .bind(message.to_string())
        .bind(encode_state(&MessageState::Pending)?)
        .fetch_one(&self.pool)
        .await
        .map_err(to_storage_error)?;

        let sequence_number: i64 = row.get(0);
        Ok(MessageEntry {
            address: address.clone(),
            message: message.clone(),
            primary_key: primary_key.to_string(),
            sequence_number: sequence_number as u64,
        })
    }

    async fn update_message(
        &self,
        address: &EntityAddress,
        _primary_key: &str,
        sequence_number: u64,
        state: &MessageState,
    ) -> Result<(), MailboxStorageError> {
        // Only pending messages are updated: the first terminal state wins.
        let updated = sqlx::query(
            r#"
            UPDATE mailbox_messages SET state = ?
             WHERE entity_type = ? AND entity_id = ? AND sequence_number = ? AND state = ?
            "#,
        )
        .bind(encode_state(state)?)
        .bind(address.entity_type.as_str())
        .bind(&address.entity_id)
        .bind(sequence_number as i64)
        .bind(encode_state(&MessageState::Pending)?)
        .execute(&self.pool)
        .await
        .map_err(to_storage_error)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query(
            r#"
            SELECT 1 FROM mailbox_messages
             WHERE entity_type = ? AND entity_id = ? AND sequence_number = ?
            "#,
        )
        .bind(address.entity_type.as_str())
        .bind(&address.entity_id)
        .bind(sequence_number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_storage_error)?;

        if exists.is_some() {
            Ok(())
        } else {
            Err(MailboxStorageError::NotFound(format!(
                "{address} message #{sequence_number}"
            )))
        }
    }

    async fn await_processed(
        &self,
        address: &EntityAddress,
        primary_key: &str,
    ) -> Result<MessageExit, MailboxStorageError> {
        loop {
            let row = sqlx::query(
                r#"
                SELECT state FROM mailbox_messages
                 WHERE entity_type = ? AND entity_id = ? AND primary_key = ?
                 ORDER BY sequence_number DESC LIMIT 1
                "#,
            )
            .bind(address.entity_type.as_str())
            .bind(&address.entity_id)
            .bind(primary_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_storage_error)?;

            if let Some(row) = row {
                let raw: String = row.get(0);
                if let MessageState::Processed { exit } = decode_state(&raw)? {
                    return Ok(exit);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use hive_common::hashing::shard_id_for;
    use hive_common::model::EntityType;
    use std::sync::Arc;

    fn address(entity_id: &str) -> EntityAddress {
        EntityAddress::new(
            shard_id_for(entity_id, 16),
            EntityType::new("counter").unwrap(),
            entity_id,
        )
    }

    async fn storage(dir: &tempfile::TempDir) -> SqliteMailboxStorage {
        SqliteMailboxStorage::new(&dir.path().join("mailbox.db"))
            .await
            .unwrap()
    }

    #[test]
    async fn sequence_numbers_are_dense_and_per_entity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let a = address("a");
        let b = address("b");

        for expected in 1..=3u64 {
            let entry = storage
                .save_message(&a, &format!("k{expected}"), &serde_json::json!({"n": expected}))
                .await
                .unwrap();
            assert_eq!(entry.sequence_number, expected);
        }
        let entry = storage
            .save_message(&b, "k1", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(entry.sequence_number, 1);
    }

    #[test]
    async fn await_processed_polls_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(storage(&dir).await);
        let a = address("a");
        let entry = storage
            .save_message(&a, "k1", &serde_json::json!({}))
            .await
            .unwrap();

        let waiter = {
            let storage = storage.clone();
            let a = a.clone();
            tokio::spawn(async move { storage.await_processed(&a, "k1").await })
        };

        let exit = MessageExit::success(&3i64).unwrap();
        storage
            .update_message(
                &a,
                "k1",
                entry.sequence_number,
                &MessageState::Processed { exit: exit.clone() },
            )
            .await
            .unwrap();

        let resolved = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resolved, exit);
    }

    #[test]
    async fn repeated_updates_keep_the_first_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let a = address("a");
        let entry = storage
            .save_message(&a, "k1", &serde_json::json!({}))
            .await
            .unwrap();

        let first = MessageExit::success(&1i64).unwrap();
        storage
            .update_message(
                &a,
                "k1",
                entry.sequence_number,
                &MessageState::Processed { exit: first.clone() },
            )
            .await
            .unwrap();
        storage
            .update_message(
                &a,
                "k1",
                entry.sequence_number,
                &MessageState::Processed {
                    exit: MessageExit::success(&2i64).unwrap(),
                },
            )
            .await
            .unwrap();

        assert_eq!(storage.await_processed(&a, "k1").await.unwrap(), first);
    }

    #[test]
    async fn updating_an_unknown_message_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let result = storage
            .update_message(&address("a"), "k1", 42, &MessageState::Pending)
            .await;
        assert!(matches!(result, Err(MailboxStorageError::NotFound(_))));
    }
}
