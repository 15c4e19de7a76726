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
use hive_common::model::{EntityAddress, EntityType};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

struct StoredMessage {
    entry: MessageEntry,
    state: MessageState,
}

#[derive(Default)]
struct EntityLog {
    next_sequence: u64,
    messages: Vec<StoredMessage>,
}

type LogKey = (EntityType, String);
type ResultKey = (EntityType, String, String);

#[derive(Default)]
struct Inner {
    logs: HashMap<LogKey, EntityLog>,
    watchers: HashMap<ResultKey, watch::Sender<Option<MessageExit>>>,
}

/// Reference mailbox storage keeping everything in process memory. Terminal
/// states are pushed to `ask` waiters through watch channels.
pub struct InMemoryMailboxStorage {
    inner: Mutex<Inner>,
}

impl InMemoryMailboxStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryMailboxStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn log_key(address: &EntityAddress) -> LogKey {
    (address.entity_type.clone(), address.entity_id.clone())
}

fn result_key(address: &EntityAddress, primary_key: &str) -> ResultKey {
    (
        address.entity_type.clone(),
        address.entity_id.clone(),
        primary_key.to_string(),
    )
}

#[async_trait]
impl MailboxStorage for InMemoryMailboxStorage {
    async fn save_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        message: &serde_json::Value,
    ) -> Result<MessageEntry, MailboxStorageError> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.logs.entry(log_key(address)).or_default();
        log.next_sequence += 1;
        let entry = MessageEntry {
            address: address.clone(),
            message: message.clone(),
            primary_key: primary_key.to_string(),
            sequence_number: log.next_sequence,
        };
        log.messages.push(StoredMessage {
            entry: entry.clone(),
            state: MessageState::Pending,
        });
        Ok(entry)
    }

    async fn update_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        sequence_number: u64,
        state: &MessageState,
    ) -> Result<(), MailboxStorageError> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner
            .logs
            .get_mut(&log_key(address))
            .ok_or_else(|| MailboxStorageError::NotFound(address.to_string()))?;
        let stored = log
            .messages
            .iter_mut()
            .find(|stored| stored.entry.sequence_number == sequence_number)
            .ok_or_else(|| {
                MailboxStorageError::NotFound(format!(
                    "{address} message #{sequence_number}"
                ))
            })?;

        // The first terminal state wins; repeated updates are no-ops.
        if matches!(stored.state, MessageState::Pending) {
            stored.state = state.clone();
        }
        let settled = match &stored.state {
            MessageState::Processed { exit } => Some(exit.clone()),
            MessageState::Pending => None,
        };

        if let Some(exit) = settled {
            if let Some(tx) = inner.watchers.remove(&result_key(address, primary_key)) {
                tx.send_replace(Some(exit));
            }
        }
        Ok(())
    }

    async fn await_processed(
        &self,
        address: &EntityAddress,
        primary_key: &str,
    ) -> Result<MessageExit, MailboxStorageError> {
        let mut rx = {
            let mut inner = self.inner.lock().unwrap();
            let existing = inner.logs.get(&log_key(address)).and_then(|log| {
                log.messages
                    .iter()
                    .rev()
                    .find(|stored| stored.entry.primary_key == primary_key)
                    .and_then(|stored| match &stored.state {
                        MessageState::Processed { exit } => Some(exit.clone()),
                        MessageState::Pending => None,
                    })
            });
            if let Some(exit) = existing {
                return Ok(exit);
            }
            inner
                .watchers
                .entry(result_key(address, primary_key))
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return Ok(exit);
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.ok_or_else(|| {
                    MailboxStorageError::Persistence(
                        "result watcher closed before the message was processed".to_string(),
                    )
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use hive_common::hashing::shard_id_for;
    use std::sync::Arc;
    use std::time::Duration;

    fn address(entity_id: &str) -> EntityAddress {
        EntityAddress::new(
            shard_id_for(entity_id, 16),
            EntityType::new("counter").unwrap(),
            entity_id,
        )
    }

    #[test]
    async fn sequence_numbers_are_dense_and_per_entity() {
        let storage = InMemoryMailboxStorage::new();
        let a = address("a");
        let b = address("b");

        for expected in 1..=3u64 {
            let entry = storage
                .save_message(&a, &format!("k{expected}"), &serde_json::json!({}))
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
    async fn await_processed_resolves_on_update() {
        let storage = Arc::new(InMemoryMailboxStorage::new());
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
        tokio::time::sleep(Duration::from_millis(10)).await;

        let exit = MessageExit::success(&5i64).unwrap();
        storage
            .update_message(
                &a,
                "k1",
                entry.sequence_number,
                &MessageState::Processed { exit: exit.clone() },
            )
            .await
            .unwrap();

        let resolved = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(resolved, exit);
    }

    #[test]
    async fn await_processed_sees_already_terminal_states() {
        let storage = InMemoryMailboxStorage::new();
        let a = address("a");
        let entry = storage
            .save_message(&a, "k1", &serde_json::json!({}))
            .await
            .unwrap();
        let exit = MessageExit::failure(&"boom").unwrap();
        storage
            .update_message(
                &a,
                "k1",
                entry.sequence_number,
                &MessageState::Processed { exit: exit.clone() },
            )
            .await
            .unwrap();

        assert_eq!(storage.await_processed(&a, "k1").await.unwrap(), exit);
    }

    #[test]
    async fn the_first_terminal_state_wins() {
        let storage = InMemoryMailboxStorage::new();
        let a = address("a");
        let entry = storage
            .save_message(&a, "k1", &serde_json::json!({}))
            .await
            .unwrap();

        let first = MessageExit::success(&1i64).unwrap();
        let second = MessageExit::success(&2i64).unwrap();
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
                &MessageState::Processed { exit: second },
            )
            .await
            .unwrap();

        assert_eq!(storage.await_processed(&a, "k1").await.unwrap(), first);
    }

    #[test]
    async fn updating_an_unknown_message_is_not_found() {
        let storage = InMemoryMailboxStorage::new();
        let a = address("a");
        let result = storage
            .update_message(&a, "k1", 42, &MessageState::Pending)
            .await;
        assert!(matches!(result, Err(MailboxStorageError::NotFound(_))));
    }
}
