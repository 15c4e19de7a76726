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

use crate::model::ShardId;

/// Maps an entity id to the shard owning it.
///
/// Every pod of a cluster must compute identical results for the same id, so
/// the function is fixed: a djb2 variant folded over the UTF-16 code units of
/// the id from last to first, followed by a high-bit smoothing step. Changing
/// it requires a cluster-wide version bump.
pub fn shard_id_for(entity_id: &str, number_of_shards: u32) -> ShardId {
    ShardId(hash_code(entity_id).unsigned_abs() % number_of_shards)
}

fn hash_code(s: &str) -> i32 {
    let code_units: Vec<u16> = s.encode_utf16().collect();
    let mut h: i32 = 5381;
    for code in code_units.iter().rev() {
        h = h.wrapping_mul(33) ^ (*code as i32);
    }
    hash_optimize(h)
}

// Folds bit 31 into bit 30 so that the sign bit does not dominate the
// distribution of small inputs.
fn hash_optimize(n: i32) -> i32 {
    let n = n as u32;
    ((n & 0xBFFF_FFFF) | ((n >> 1) & 0x4000_0000)) as i32
}
