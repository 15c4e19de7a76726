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

use hive_common::model::{AssignmentMap, PodAddress, ShardId};
use std::collections::{BTreeMap, BTreeSet};

/// A single shard ownership change. `from` is `None` for shards that are
/// currently unassigned (or whose owner has left the cluster).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMove {
    pub shard: ShardId,
    pub from: Option<PodAddress>,
    pub to: PodAddress,
}

/// Target shard count per pod: `floor(number_of_shards / pods)` with the
/// remainder distributed to the first pods in address order.
pub fn target_counts(
    number_of_shards: u32,
    pods: &BTreeSet<PodAddress>,
) -> BTreeMap<PodAddress, usize> {
    let pod_count = pods.len();
    let base = number_of_shards as usize / pod_count.max(1);
    let remainder = number_of_shards as usize % pod_count.max(1);
    pods.iter()
        .enumerate()
        .map(|(index, pod)| {
            let target = if index < remainder { base + 1 } else { base };
            (pod.clone(), target)
        })
        .collect()
}

/// Computes the movement plan balancing shard counts across `pods` while
/// minimizing movement.
///
/// Orphaned shards (unassigned, or owned by a pod outside `pods`) are placed
/// first; after that, overloaded pods give their smallest excess shards to
/// the least-loaded pod, tie-broken by pod address. The plan is bounded to
/// `ceil(rebalance_rate * number_of_shards)` moves; leftover imbalance is
/// picked up by the next pass.
pub fn plan_rebalance(
    assignments: &AssignmentMap,
    pods: &BTreeSet<PodAddress>,
    rebalance_rate: f64,
) -> Vec<ShardMove> {
    if pods.is_empty() {
        return Vec::new();
    }

    let number_of_shards = assignments.len() as u32;
    let max_moves = ((rebalance_rate * number_of_shards as f64).ceil() as usize).max(1);
    let targets = target_counts(number_of_shards, pods);

    let mut owned: BTreeMap<PodAddress, BTreeSet<ShardId>> =
        pods.iter().map(|pod| (pod.clone(), BTreeSet::new())).collect();
    let mut orphans: BTreeSet<ShardId> = BTreeSet::new();
    for (shard, owner) in assignments {
        match owner {
            Some(pod) if pods.contains(pod) => {
                owned.entry(pod.clone()).or_default().insert(*shard);
            }
            _ => {
                orphans.insert(*shard);
            }
        }
    }

    let mut moves = Vec::new();

    for shard in orphans {
        if moves.len() >= max_moves {
            return moves;
        }
        let to = least_loaded(&owned);
        owned.entry(to.clone()).or_default().insert(shard);
        moves.push(ShardMove {
            shard,
            from: None,
            to,
        });
    }

    for pod in pods {
        let target = targets[pod];
        while owned[pod].len() > target {
            if moves.len() >= max_moves {
                return moves;
            }
            let Some(to) = least_loaded_below_target(&owned, &targets, pod) else {
                break;
            };
            let shard = *owned[pod].iter().next().unwrap();
            owned.get_mut(pod).unwrap().remove(&shard);
            owned.get_mut(&to).unwrap().insert(shard);
            moves.push(ShardMove {
                shard,
                from: Some(pod.clone()),
                to,
            });
        }
    }

    moves
}

fn least_loaded(owned: &BTreeMap<PodAddress, BTreeSet<ShardId>>) -> PodAddress {
    owned
        .iter()
        .min_by_key(|(pod, shards)| (shards.len(), (*pod).clone()))
        .map(|(pod, _)| pod.clone())
        .unwrap()
}

fn least_loaded_below_target(
    owned: &BTreeMap<PodAddress, BTreeSet<ShardId>>,
    targets: &BTreeMap<PodAddress, usize>,
    excluding: &PodAddress,
) -> Option<PodAddress> {
    owned
        .iter()
        .filter(|(pod, shards)| *pod != excluding && shards.len() < targets[*pod])
        .min_by_key(|(pod, shards)| (shards.len(), (*pod).clone()))
        .map(|(pod, _)| pod.clone())
}
