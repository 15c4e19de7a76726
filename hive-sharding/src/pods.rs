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

use crate::sharding::Sharding;
use async_trait::async_trait;
use hive_common::clients::pods::{Pods, PodUnavailable};
use hive_common::envelope::Envelope;
use hive_common::model::{PodAddress, ShardingEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Pod transport for pods living in the same process: a registry of live
/// `Sharding` runtimes keyed by pod address. Deployments with real networks
/// adapt this seam to their RPC layer; the tests drive whole clusters
/// through it.
pub struct InProcessPods {
    pods: RwLock<HashMap<PodAddress, Arc<Sharding>>>,
}

impl InProcessPods {
    pub fn new() -> Arc<InProcessPods> {
        Arc::new(InProcessPods {
            pods: RwLock::new(HashMap::new()),
        })
    }

    /// Makes a pod reachable under its address.
    pub async fn connect(&self, sharding: Arc<Sharding>) {
        self.pods
            .write()
            .await
            .insert(sharding.pod_address().clone(), sharding);
    }

    /// Severs a pod, simulating a crash: the address stops responding
    /// without any graceful shutdown.
    pub async fn disconnect(&self, pod: &PodAddress) {
        self.pods.write().await.remove(pod);
    }

    async fn resolve(&self, pod: &PodAddress) -> Result<Arc<Sharding>, PodUnavailable> {
        let target = self.pods.read().await.get(pod).cloned();
        match target {
            Some(sharding) if !sharding.is_shutdown() => Ok(sharding),
            _ => Err(PodUnavailable {
                address: pod.clone(),
            }),
        }
    }
}

#[async_trait]
impl Pods for InProcessPods {
    async fn send_envelope(
        &self,
        pod: &PodAddress,
        envelope: &Envelope,
    ) -> Result<(), PodUnavailable> {
        let target = self.resolve(pod).await?;
        // Errors raised on the receiving pod stay there, like a transport
        // would keep them out of the sender's failure channel.
        if let Err(err) = target.send_to_local_entity_manager(envelope).await {
            warn!("Pod {pod} rejected {envelope}: {err}");
        }
        Ok(())
    }

    async fn ping(&self, pod: &PodAddress) -> Result<(), PodUnavailable> {
        self.resolve(pod).await.map(|_| ())
    }

    async fn notify(
        &self,
        pod: &PodAddress,
        event: &ShardingEvent,
    ) -> Result<(), PodUnavailable> {
        let target = self.resolve(pod).await?;
        target.handle_event(event.clone()).await;
        Ok(())
    }
}
