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
use hive_common::envelope::{EntityDef, EntityMessage};
use hive_common::model::EntityType;
use hive_sharding::entity_manager::{EntityBehavior, EntityRequest};
use hive_sharding::mailbox::MailboxReceiver;
use serde::{Deserialize, Serialize};

/// The protocol of the test counter entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CounterMessage {
    Get { key: String },
    Inc { key: String },
    Dec { key: String },
}

impl EntityMessage for CounterMessage {
    type Success = i64;
    type Failure = String;

    fn primary_key(&self) -> String {
        match self {
            CounterMessage::Get { key }
            | CounterMessage::Inc { key }
            | CounterMessage::Dec { key } => key.clone(),
        }
    }
}

/// An in-memory counter per entity id; state does not survive entity
/// termination.
pub struct CounterBehavior;

#[async_trait]
impl EntityBehavior<CounterMessage> for CounterBehavior {
    async fn run(
        &self,
        _entity_id: String,
        mut mailbox: MailboxReceiver<EntityRequest<CounterMessage>>,
    ) {
        let mut count: i64 = 0;
        while let Some(request) = mailbox.take().await {
            match &request.message {
                CounterMessage::Inc { .. } => count += 1,
                CounterMessage::Dec { .. } => count -= 1,
                CounterMessage::Get { .. } => {}
            }
            request.replier.succeed(count).await;
        }
    }
}

pub fn counter_entity() -> EntityDef<CounterMessage> {
    EntityDef::new(EntityType::new("counter").unwrap())
}
