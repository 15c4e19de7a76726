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

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use hive_common::envelope::{MessageExit, MessageState};
use hive_common::model::EntityAddress;

#[derive(Debug, thiserror::Error)]
pub enum MailboxStorageError {
    #[error("message persistence failure: {0}")]
    Persistence(String),
    /// The addressed record is unknown to the store. Callers treat this as
    /// absence, not as a fault.
    #[error("no such element: {0}")]
    NotFound(String),
}

/// A message as recorded in the durable mailbox.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEntry {
    pub address: EntityAddress,
    pub message: serde_json::Value,
    pub primary_key: String,
    /// Dense, strictly increasing per `(entity_type, entity_id)`, assigned
    /// by the store at save time.
    pub sequence_number: u64,
}

/// Durable log of messages per entity, plus the per-message result states
/// that `ask` callers wait on.
///
/// `save_message` must be atomic and must complete before the in-memory
/// enqueue of the same message, so that a crashed pod can replay unprocessed
/// entries.
#[async_trait]
pub trait MailboxStorage: Send + Sync {
    async fn save_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        message: &serde_json::Value,
    ) -> Result<MessageEntry, MailboxStorageError>;

    /// Marks a message processed with its terminal exit. Idempotent under
    /// repeated application of the same terminal state; the first terminal
    /// state wins.
    async fn update_message(
        &self,
        address: &EntityAddress,
        primary_key: &str,
        sequence_number: u64,
        state: &MessageState,
    ) -> Result<(), MailboxStorageError>;

    /// Resolves once the message identified by `primary_key` reaches a
    /// terminal state. The caller bounds the wait with its own timeout.
    async fn await_processed(
        &self,
        address: &EntityAddress,
        primary_key: &str,
    ) -> Result<MessageExit, MailboxStorageError>;
}
