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

use hive_common::clients::pods::PodUnavailable;
use hive_common::clients::shard_manager::ShardManagerClientError;
use hive_common::model::{EntityAddress, EntityType};

#[derive(Debug, thiserror::Error)]
pub enum ShardingError {
    /// The addressed entity's shard is not owned by this pod (or the pod is
    /// shutting down). Callers may refresh their assignments and retry.
    #[error("entity is not managed by this pod: {address}")]
    EntityNotManagedByPod { address: EntityAddress },
    /// The message could not be decoded with the entity protocol. Never
    /// retried.
    #[error("malformed message for entity type {entity_type}: {cause}")]
    MalformedMessage {
        entity_type: EntityType,
        cause: String,
    },
    #[error(transparent)]
    PodUnavailable(#[from] PodUnavailable),
    #[error(transparent)]
    ShardManager(#[from] ShardManagerClientError),
    #[error("failed to persist message: {0}")]
    MessagePersistence(String),
}

/// Failure of a `Messenger::ask` call: either the runtime could not route or
/// persist the message, or the entity itself replied with its declared
/// failure type.
#[derive(Debug, thiserror::Error)]
pub enum AskError<E> {
    #[error(transparent)]
    Sharding(#[from] ShardingError),
    #[error("entity failed to process the message")]
    Entity(E),
    #[error("failed to decode the reply: {0}")]
    Decode(String),
}
