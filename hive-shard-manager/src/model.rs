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

use chrono::{DateTime, Utc};
use hive_common::model::{AssignmentMap, PodAddress, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A pod registered with the shard manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub address: PodAddress,
    pub registered_at: DateTime<Utc>,
}

impl Pod {
    pub fn new(address: PodAddress) -> Self {
        Self {
            address,
            registered_at: Utc::now(),
        }
    }
}

/// Inverts an assignment map into the set of shards owned per pod. Shards
/// without an owner are not represented.
pub fn shards_per_pod(assignments: &AssignmentMap) -> BTreeMap<PodAddress, BTreeSet<ShardId>> {
    let mut result: BTreeMap<PodAddress, BTreeSet<ShardId>> = BTreeMap::new();
    for (shard, owner) in assignments {
        if let Some(pod) = owner {
            result.entry(pod.clone()).or_default().insert(*shard);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn shards_per_pod_skips_unassigned() {
        let pod_a = PodAddress::new("a", 1);
        let mut assignments = AssignmentMap::new();
        assignments.insert(ShardId(0), Some(pod_a.clone()));
        assignments.insert(ShardId(1), None);
        assignments.insert(ShardId(2), Some(pod_a.clone()));

        let per_pod = shards_per_pod(&assignments);
        assert_eq!(per_pod.len(), 1);
        assert_eq!(
            per_pod[&pod_a],
            BTreeSet::from([ShardId(0), ShardId(2)])
        );
    }
}
