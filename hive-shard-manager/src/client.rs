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

use crate::shard_manager::ShardManager;
use async_trait::async_trait;
use hive_common::clients::shard_manager::{ShardManagerClient, ShardManagerClientError};
use hive_common::model::{AssignmentMap, PodAddress};
use std::sync::Arc;

/// Client for pods running in the same process as the shard manager. The
/// remote transport is deployment-specific; every deployment adapts this
/// seam to its own RPC layer.
pub struct InProcessShardManagerClient {
    shard_manager: Arc<ShardManager>,
}

impl InProcessShardManagerClient {
    pub fn new(shard_manager: Arc<ShardManager>) -> Self {
        Self { shard_manager }
    }
}

#[async_trait]
impl ShardManagerClient for InProcessShardManagerClient {
    async fn register(&self, pod: &PodAddress) -> Result<(), ShardManagerClientError> {
        self.shard_manager
            .register(pod.clone())
            .await
            .map_err(|err| ShardManagerClientError::Unavailable(err.to_string()))
    }

    async fn unregister(&self, pod: &PodAddress) -> Result<(), ShardManagerClientError> {
        self.shard_manager
            .unregister(pod.clone())
            .await
            .map_err(|err| ShardManagerClientError::Unavailable(err.to_string()))
    }

    async fn notify_unhealthy_pod(
        &self,
        pod: &PodAddress,
    ) -> Result<(), ShardManagerClientError> {
        self.shard_manager
            .notify_unhealthy_pod(pod.clone())
            .await
            .map_err(|err| ShardManagerClientError::Unavailable(err.to_string()))
    }

    async fn get_assignments(&self) -> Result<AssignmentMap, ShardManagerClientError> {
        Ok(self.shard_manager.get_assignments().await)
    }
}
