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

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// A bucket of entity ids owned by at most one pod at a time.
///
/// Shard ids are in `[0, number_of_shards)` and every pod of a cluster must
/// agree on `number_of_shards`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShardId(pub u32);

impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-global, stable name of a class of entities and their message
/// protocol. Never empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Result<EntityType, InvalidEntityType> {
        let name = name.into();
        if name.is_empty() {
            Err(InvalidEntityType)
        } else {
            Ok(EntityType(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityType {
    type Error = InvalidEntityType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EntityType::new(value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("entity type must be a nonempty string")]
pub struct InvalidEntityType;

/// Address of a single server process participating in the cluster.
///
/// Equality is structural; the `Ord` instance (host, then port) is used
/// wherever the cluster needs a deterministic pod order.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PodAddress {
    pub host: String,
    pub port: u16,
}

impl PodAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for PodAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PodAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid pod address: {s}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|err| format!("invalid pod address port in {s}: {err}"))?;
        Ok(PodAddress::new(host, port))
    }
}

/// Fully qualified address of a single entity instance.
///
/// Invariant: `shard_id` equals the canonical hash of `entity_id` modulo the
/// cluster-wide shard count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityAddress {
    pub shard_id: ShardId,
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityAddress {
    pub fn new(shard_id: ShardId, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            shard_id,
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl Display for EntityAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (shard {})",
            self.entity_type, self.entity_id, self.shard_id
        )
    }
}

/// Cluster-wide shard ownership map. `None` marks a shard in transit between
/// two pods during rebalancing.
pub type AssignmentMap = BTreeMap<ShardId, Option<PodAddress>>;

/// Events published by the control plane and mirrored on the per-pod local
/// event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum ShardingEvent {
    ShardsAssigned {
        pod: PodAddress,
        shards: BTreeSet<ShardId>,
    },
    ShardsUnassigned {
        pod: PodAddress,
        shards: BTreeSet<ShardId>,
    },
    PodRegistered {
        pod: PodAddress,
    },
    PodUnregistered {
        pod: PodAddress,
    },
    PodHealthChecked {
        pod: PodAddress,
    },
}

impl Display for ShardingEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ShardingEvent::ShardsAssigned { pod, shards } => {
                write!(f, "{} shard(s) assigned to {pod}", shards.len())
            }
            ShardingEvent::ShardsUnassigned { pod, shards } => {
                write!(f, "{} shard(s) unassigned from {pod}", shards.len())
            }
            ShardingEvent::PodRegistered { pod } => write!(f, "pod {pod} registered"),
            ShardingEvent::PodUnregistered { pod } => write!(f, "pod {pod} unregistered"),
            ShardingEvent::PodHealthChecked { pod } => write!(f, "pod {pod} health checked"),
        }
    }
}

/// Shared retry policy for transient failures (storage writes, client calls).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}
