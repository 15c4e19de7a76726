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

use crate::model::{AssignmentMap, PodAddress, ShardId};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ShardManagerClientError {
    #[error("shard manager is unavailable: {0}")]
    Unavailable(String),
}

/// Per-pod view of the control plane.
#[async_trait]
pub trait ShardManagerClient: Send + Sync {
    async fn register(&self, pod: &PodAddress) -> Result<(), ShardManagerClientError>;

    async fn unregister(&self, pod: &PodAddress) -> Result<(), ShardManagerClientError>;

    async fn notify_unhealthy_pod(
        &self,
        pod: &PodAddress,
    ) -> Result<(), ShardManagerClientError>;

    async fn get_assignments(&self) -> Result<AssignmentMap, ShardManagerClientError>;
}

/// Degenerate client for single-pod deployments: every shard is owned by the
/// sole local pod and registration is a no-op.
pub struct LocalShardManagerClient {
    pod: PodAddress,
    number_of_shards: u32,
}

impl LocalShardManagerClient {
    pub fn new(pod: PodAddress, number_of_shards: u32) -> Self {
        Self {
            pod,
            number_of_shards,
        }
    }
}

#[async_trait]
impl ShardManagerClient for LocalShardManagerClient {
    async fn register(&self, _pod: &PodAddress) -> Result<(), ShardManagerClientError> {
        Ok(())
    }

    async fn unregister(&self, _pod: &PodAddress) -> Result<(), ShardManagerClientError> {
        Ok(())
    }

    async fn notify_unhealthy_pod(
        &self,
        _pod: &PodAddress,
    ) -> Result<(), ShardManagerClientError> {
        Ok(())
    }

    async fn get_assignments(&self) -> Result<AssignmentMap, ShardManagerClientError> {
        Ok((0..self.number_of_shards)
            .map(|shard| (ShardId(shard), Some(self.pod.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn local_client_owns_every_shard() {
        let pod = PodAddress::new("localhost", 9000);
        let client = LocalShardManagerClient::new(pod.clone(), 8);
        let assignments = client.get_assignments().await.unwrap();
        assert_eq!(assignments.len(), 8);
        assert!(assignments.values().all(|owner| owner.as_ref() == Some(&pod)));
    }
}
