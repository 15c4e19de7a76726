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

use crate::config::ShardingConfig;
use crate::entity_manager::{EntityBehavior, EntityManager, EntityManagerHandle};
use crate::error::ShardingError;
use crate::messenger::Messenger;
use crate::storage::MailboxStorage;
use hive_common::clients::pods::Pods;
use hive_common::clients::shard_manager::ShardManagerClient;
use hive_common::envelope::{EntityDef, EntityMessage, Envelope};
use hive_common::hashing;
use hive_common::model::{EntityType, PodAddress, ShardId, ShardingEvent};
use hive_common::retries::with_retries;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Local registration events, observable per pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationEvent {
    EntityRegistered { entity_type: EntityType },
}

/// Per-pod sharding runtime: owns the entity managers of this pod, caches
/// the assignment map, and routes envelopes locally or to peer pods.
pub struct Sharding {
    config: ShardingConfig,
    pod_address: PodAddress,
    storage: Arc<dyn MailboxStorage>,
    pods: Arc<dyn Pods>,
    shard_manager: Arc<dyn ShardManagerClient>,
    is_shutdown: Arc<AtomicBool>,
    shard_assignments: RwLock<HashMap<ShardId, PodAddress>>,
    entity_managers: RwLock<HashMap<EntityType, Arc<dyn EntityManagerHandle>>>,
    registration_events: broadcast::Sender<RegistrationEvent>,
    scope: CancellationToken,
}

impl Sharding {
    /// Registers the pod with the shard manager, pulls the initial
    /// assignment map, and starts the background refresh task. A failure
    /// here fails pod startup.
    pub async fn start(
        config: ShardingConfig,
        storage: Arc<dyn MailboxStorage>,
        pods: Arc<dyn Pods>,
        shard_manager: Arc<dyn ShardManagerClient>,
    ) -> Result<Arc<Sharding>, ShardingError> {
        let pod_address = config.pod_address();
        let (registration_events, _) = broadcast::channel(128);
        let sharding = Arc::new(Sharding {
            config,
            pod_address: pod_address.clone(),
            storage,
            pods,
            shard_manager,
            is_shutdown: Arc::new(AtomicBool::new(false)),
            shard_assignments: RwLock::new(HashMap::new()),
            entity_managers: RwLock::new(HashMap::new()),
            registration_events,
            scope: CancellationToken::new(),
        });

        with_retries("sharding", "register", &sharding.config.retry, || {
            sharding.shard_manager.register(&pod_address)
        })
        .await?;
        sharding.refresh_assignments().await?;
        sharding.spawn_refresh_task();

        info!("Pod {pod_address} registered");
        Ok(sharding)
    }

    /// Graceful shutdown: stop accepting new entities, drain the existing
    /// ones bounded by the termination timeout, then unregister. Failures of
    /// the shard manager call are logged and swallowed so that the pod can
    /// still exit.
    pub async fn stop(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down pod {}", self.pod_address);

        // Drain before cancelling the scope: the entity scopes are children
        // of it, and cancelling first would cut the drain short.
        let managers: Vec<Arc<dyn EntityManagerHandle>> =
            self.entity_managers.read().await.values().cloned().collect();
        for manager in managers {
            manager.terminate_all().await;
        }
        self.scope.cancel();

        if let Err(err) = self.shard_manager.unregister(&self.pod_address).await {
            error!(
                "Failed to unregister pod {} from the shard manager: {err}",
                self.pod_address
            );
        }
        info!("Pod {} stopped", self.pod_address);
    }

    pub fn pod_address(&self) -> &PodAddress {
        &self.pod_address
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    pub fn storage(&self) -> Arc<dyn MailboxStorage> {
        self.storage.clone()
    }

    pub fn shard_id_for(&self, entity_id: &str) -> ShardId {
        hashing::shard_id_for(entity_id, self.config.number_of_shards)
    }

    /// Builds an entity manager for the given entity type and records it in
    /// the local registry.
    pub async fn register_entity<M, B>(
        &self,
        def: &EntityDef<M>,
        behavior: B,
    ) -> Result<(), ShardingError>
    where
        M: EntityMessage,
        B: EntityBehavior<M>,
    {
        let entity_type = def.entity_type().clone();
        let manager: Arc<dyn EntityManagerHandle> = Arc::new(EntityManager::new(
            entity_type.clone(),
            Arc::new(behavior),
            self.storage.clone(),
            self.config.entity_max_idle_time,
            self.config.entity_termination_timeout,
            self.is_shutdown.clone(),
            self.scope.child_token(),
        ));
        self.entity_managers
            .write()
            .await
            .insert(entity_type.clone(), manager);
        info!("Registered entity type {entity_type} on pod {}", self.pod_address);
        let _ = self
            .registration_events
            .send(RegistrationEvent::EntityRegistered { entity_type });
        Ok(())
    }

    pub fn subscribe_registrations(&self) -> broadcast::Receiver<RegistrationEvent> {
        self.registration_events.subscribe()
    }

    /// Dispatches an envelope to the given pod, locally when the pod is this
    /// one. A peer that turns out to be unreachable is reported to the shard
    /// manager as unhealthy.
    pub async fn send_envelope(
        &self,
        pod: &PodAddress,
        envelope: &Envelope,
    ) -> Result<(), ShardingError> {
        if *pod == self.pod_address {
            self.send_to_local_entity_manager(envelope).await
        } else {
            match self.pods.send_envelope(pod, envelope).await {
                Ok(()) => Ok(()),
                Err(unavailable) => {
                    warn!("Pod {pod} is unavailable, reporting it to the shard manager");
                    if let Err(err) = self.shard_manager.notify_unhealthy_pod(pod).await {
                        warn!("Failed to report unhealthy pod {pod}: {err}");
                    }
                    Err(ShardingError::PodUnavailable(unavailable))
                }
            }
        }
    }

    /// Delivers an envelope to the local manager of its entity type, after
    /// verifying that this pod currently owns the addressed shard.
    pub async fn send_to_local_entity_manager(
        &self,
        envelope: &Envelope,
    ) -> Result<(), ShardingError> {
        if !self.is_entity_on_local_shards(&envelope.address.shard_id).await {
            return Err(ShardingError::EntityNotManagedByPod {
                address: envelope.address.clone(),
            });
        }
        let manager = self
            .entity_managers
            .read()
            .await
            .get(&envelope.address.entity_type)
            .cloned()
            .ok_or_else(|| ShardingError::EntityNotManagedByPod {
                address: envelope.address.clone(),
            })?;
        manager.send(envelope).await
    }

    pub async fn is_entity_on_local_shards(&self, shard_id: &ShardId) -> bool {
        self.shard_assignments.read().await.get(shard_id) == Some(&self.pod_address)
    }

    pub async fn pod_for_shard(&self, shard_id: &ShardId) -> Option<PodAddress> {
        self.shard_assignments.read().await.get(shard_id).cloned()
    }

    /// Applies a sharding event delivered by the control plane through the
    /// pod transport. Shards released here have their entities terminated
    /// before the shard can come up on another pod.
    pub async fn handle_event(&self, event: ShardingEvent) {
        match event {
            ShardingEvent::ShardsUnassigned { pod, shards } if pod == self.pod_address => {
                debug!("Releasing {} shard(s)", shards.len());
                {
                    let mut assignments = self.shard_assignments.write().await;
                    for shard in &shards {
                        if assignments.get(shard) == Some(&self.pod_address) {
                            assignments.remove(shard);
                        }
                    }
                }
                let managers: Vec<Arc<dyn EntityManagerHandle>> =
                    self.entity_managers.read().await.values().cloned().collect();
                for manager in managers {
                    manager.terminate_entities_on_shards(&shards).await;
                }
            }
            ShardingEvent::ShardsAssigned { pod, shards } if pod == self.pod_address => {
                debug!("Acquiring {} shard(s)", shards.len());
                let mut assignments = self.shard_assignments.write().await;
                for shard in shards {
                    assignments.insert(shard, self.pod_address.clone());
                }
            }
            _ => {}
        }
    }

    pub async fn refresh_assignments(&self) -> Result<(), ShardingError> {
        let assignments = self.shard_manager.get_assignments().await?;
        let assignments: HashMap<ShardId, PodAddress> = assignments
            .into_iter()
            .filter_map(|(shard, pod)| pod.map(|pod| (shard, pod)))
            .collect();
        debug!(
            "Refreshed assignments: {} shard(s) known, {} local",
            assignments.len(),
            assignments
                .values()
                .filter(|pod| **pod == self.pod_address)
                .count()
        );
        *self.shard_assignments.write().await = assignments;
        Ok(())
    }

    /// Typed facade for one entity type over this runtime.
    pub fn messenger<M: EntityMessage>(self: &Arc<Self>, def: EntityDef<M>) -> Messenger<M> {
        Messenger::new(self.clone(), def)
    }

    pub async fn entity_manager(
        &self,
        entity_type: &EntityType,
    ) -> Option<Arc<dyn EntityManagerHandle>> {
        self.entity_managers.read().await.get(entity_type).cloned()
    }

    fn spawn_refresh_task(self: &Arc<Self>) {
        let sharding = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sharding.scope.cancelled() => break,
                    _ = tokio::time::sleep(sharding.config.refresh_assignments_interval) => {
                        if let Err(err) = sharding.refresh_assignments().await {
                            warn!("Failed to refresh shard assignments: {err}");
                        }
                    }
                }
            }
        });
    }
}
