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
use hive_common::clients::pods::{Pods, PodsHealth};
use hive_common::model::PodAddress;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Probes pod liveness by pinging it over the pod transport, bounded by the
/// configured ping timeout.
pub struct PingPodsHealth {
    pods: Arc<dyn Pods>,
    ping_timeout: Duration,
}

impl PingPodsHealth {
    pub fn new(pods: Arc<dyn Pods>, ping_timeout: Duration) -> Self {
        Self { pods, ping_timeout }
    }
}

#[async_trait]
impl PodsHealth for PingPodsHealth {
    async fn is_alive(&self, pod: &PodAddress) -> bool {
        match tokio::time::timeout(self.ping_timeout, self.pods.ping(pod)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                debug!("Ping of {pod} failed: {err}");
                false
            }
            Err(_) => {
                debug!("Ping of {pod} timed out after {:?}", self.ping_timeout);
                false
            }
        }
    }
}
