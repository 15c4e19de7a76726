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

use crate::model::{EntityAddress, EntityType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::marker::PhantomData;

/// Protocol contract of one entity type.
///
/// A message declares how it serializes, what a successful reply looks like,
/// what a failed reply looks like, and a primary key that identifies it while
/// its result is pending in durable storage.
pub trait EntityMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Success: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Failure: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn primary_key(&self) -> String;
}

/// Binds an entity type name to its message protocol at the type level.
pub struct EntityDef<M> {
    entity_type: EntityType,
    _protocol: PhantomData<M>,
}

// Derived Clone would require M: Clone
impl<M> Clone for EntityDef<M> {
    fn clone(&self) -> Self {
        Self {
            entity_type: self.entity_type.clone(),
            _protocol: PhantomData,
        }
    }
}

impl<M: EntityMessage> EntityDef<M> {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            _protocol: PhantomData,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }
}

/// Serializable container routed between pods: an entity address plus the
/// encoded message. The message encoding is owned by the entity protocol; the
/// runtime only moves it around.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub address: EntityAddress,
    pub message: serde_json::Value,
}

impl Envelope {
    pub fn encode<M: EntityMessage>(
        address: EntityAddress,
        message: &M,
    ) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope {
            address,
            message: serde_json::to_value(message)?,
        })
    }

    pub fn decode_message<M: EntityMessage>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_value(self.message.clone())
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "envelope for {}", self.address)
    }
}

/// Durable state of one persisted message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum MessageState {
    Pending,
    Processed { exit: MessageExit },
}

/// Terminal result of processing one message, as written by the entity
/// behavior through its `Replier`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum MessageExit {
    Success { value: serde_json::Value },
    Failure { cause: serde_json::Value },
}

impl MessageExit {
    pub fn success<T: Serialize>(value: &T) -> Result<MessageExit, serde_json::Error> {
        Ok(MessageExit::Success {
            value: serde_json::to_value(value)?,
        })
    }

    pub fn failure<E: Serialize>(cause: &E) -> Result<MessageExit, serde_json::Error> {
        Ok(MessageExit::Failure {
            cause: serde_json::to_value(cause)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::hashing::shard_id_for;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum CounterMessage {
        Get { key: String },
        Inc { key: String },
    }

    impl EntityMessage for CounterMessage {
        type Success = i64;
        type Failure = String;

        fn primary_key(&self) -> String {
            match self {
                CounterMessage::Get { key } => key.clone(),
                CounterMessage::Inc { key } => key.clone(),
            }
        }
    }

    fn address(entity_id: &str) -> EntityAddress {
        EntityAddress::new(
            shard_id_for(entity_id, 16),
            EntityType::new("counter").unwrap(),
            entity_id,
        )
    }

    #[test]
    fn envelope_roundtrips() {
        let message = CounterMessage::Inc {
            key: "k1".to_string(),
        };
        let envelope = Envelope::encode(address("x"), &message).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.decode_message::<CounterMessage>().unwrap(), message);
    }

    #[test]
    fn envelope_wire_format_nests_address_and_message() {
        let message = CounterMessage::Get {
            key: "k1".to_string(),
        };
        let envelope = Envelope::encode(address("x"), &message).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("address").is_some());
        assert!(json.get("message").is_some());
        assert_eq!(json["address"]["entityId"], "x");
    }

    #[test]
    fn message_state_uses_tagged_wire_format() {
        let pending = serde_json::to_value(&MessageState::Pending).unwrap();
        assert_eq!(pending, serde_json::json!({ "tag": "Pending" }));

        let processed = MessageState::Processed {
            exit: MessageExit::success(&42i64).unwrap(),
        };
        let json = serde_json::to_value(&processed).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tag": "Processed",
                "exit": { "tag": "Success", "value": 42 }
            })
        );
    }

    #[test]
    fn decoding_the_wrong_protocol_fails() {
        let envelope = Envelope {
            address: address("x"),
            message: serde_json::json!({ "Unknown": { "key": 12 } }),
        };
        assert!(envelope.decode_message::<CounterMessage>().is_err());
    }
}
