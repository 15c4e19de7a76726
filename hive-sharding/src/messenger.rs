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

use crate::error::{AskError, ShardingError};
use crate::sharding::Sharding;
use crate::storage::MailboxStorage;
use hive_common::envelope::{EntityDef, EntityMessage, Envelope, MessageExit};
use hive_common::model::{EntityAddress, PodAddress};
use std::sync::Arc;

/// User-facing `ask`/`tell` facade for one entity type.
///
/// Routing resolves the owning pod from the local assignment cache; a shard
/// without a known owner surfaces as `EntityNotManagedByPod`, which the
/// caller may retry after the cache refreshes.
pub struct Messenger<M: EntityMessage> {
    sharding: Arc<Sharding>,
    def: EntityDef<M>,
}

impl<M: EntityMessage> Messenger<M> {
    pub fn new(sharding: Arc<Sharding>, def: EntityDef<M>) -> Self {
        Self { sharding, def }
    }

    /// Fire-and-forget delivery: the message is durably enqueued on the
    /// owning pod, no reply is awaited.
    pub async fn tell(&self, entity_id: &str, message: M) -> Result<(), ShardingError> {
        let (pod, envelope) = self.route(entity_id, &message).await?;
        self.sharding.send_envelope(&pod, &envelope).await
    }

    /// Request-response delivery: routes like `tell`, then waits for the
    /// terminal state of the message to appear in mailbox storage. There is
    /// no built-in timeout; callers bound the wait themselves.
    pub async fn ask(
        &self,
        entity_id: &str,
        message: M,
    ) -> Result<M::Success, AskError<M::Failure>> {
        let primary_key = message.primary_key();
        let (pod, envelope) = self.route(entity_id, &message).await?;
        let address = envelope.address.clone();
        self.sharding.send_envelope(&pod, &envelope).await?;

        let exit = self
            .sharding
            .storage()
            .await_processed(&address, &primary_key)
            .await
            .map_err(|err| ShardingError::MessagePersistence(err.to_string()))?;
        match exit {
            MessageExit::Success { value } => serde_json::from_value(value)
                .map_err(|err| AskError::Decode(err.to_string())),
            MessageExit::Failure { cause } => {
                match serde_json::from_value::<M::Failure>(cause) {
                    Ok(failure) => Err(AskError::Entity(failure)),
                    Err(err) => Err(AskError::Decode(err.to_string())),
                }
            }
        }
    }

    async fn route(
        &self,
        entity_id: &str,
        message: &M,
    ) -> Result<(PodAddress, Envelope), ShardingError> {
        let shard_id = self.sharding.shard_id_for(entity_id);
        let address = EntityAddress::new(shard_id, self.def.entity_type().clone(), entity_id);
        let envelope = Envelope::encode(address.clone(), message).map_err(|err| {
            ShardingError::MalformedMessage {
                entity_type: self.def.entity_type().clone(),
                cause: err.to_string(),
            }
        })?;
        let pod = self
            .sharding
            .pod_for_shard(&shard_id)
            .await
            .ok_or(ShardingError::EntityNotManagedByPod { address })?;
        Ok((pod, envelope))
    }
}
