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

use crate::envelope::Envelope;
use crate::model::{PodAddress, ShardingEvent};
use async_trait::async_trait;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("pod {address} is unavailable")]
pub struct PodUnavailable {
    pub address: PodAddress,
}

/// Pod-to-pod transport client.
///
/// Implementations may batch, but must preserve the per-destination ordering
/// of `send_envelope` calls issued from a single task.
#[async_trait]
pub trait Pods: Send + Sync {
    async fn send_envelope(
        &self,
        pod: &PodAddress,
        envelope: &Envelope,
    ) -> Result<(), PodUnavailable>;

    async fn ping(&self, pod: &PodAddress) -> Result<(), PodUnavailable>;

    async fn notify(
        &self,
        pod: &PodAddress,
        event: &ShardingEvent,
    ) -> Result<(), PodUnavailable>;
}

/// Liveness probe used by the control plane to validate unhealthy-pod
/// reports before evicting a pod.
#[async_trait]
pub trait PodsHealth: Send + Sync {
    async fn is_alive(&self, pod: &PodAddress) -> bool;
}
