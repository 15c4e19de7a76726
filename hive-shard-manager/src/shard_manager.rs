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

use crate::config::ShardManagerConfig;
use crate::error::ShardManagerError;
use crate::model::{shards_per_pod, Pod};
use crate::rebalancing::{plan_rebalance, ShardMove};
use hive_common::clients::pods::{Pods, PodsHealth};
use hive_common::metrics;
use hive_common::model::{AssignmentMap, PodAddress, RetryConfig, ShardId, ShardingEvent};
use hive_common::retries::with_retries;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persistence::AssignmentStore;

struct ShardManagerState {
    pods: BTreeMap<PodAddress, Pod>,
    assignments: AssignmentMap,
}

/// Authoritative owner of the cluster-wide shard assignment map.
///
/// Pods register and unregister themselves here; the manager keeps shard
/// counts balanced across the registered pods, persists every assignment
/// change before publishing it, and evicts pods that stop responding to
/// pings.
pub struct ShardManager {
    config: ShardManagerConfig,
    store: Arc<dyn AssignmentStore>,
    pods: Arc<dyn Pods>,
    health: Arc<dyn PodsHealth>,
    state: RwLock<ShardManagerState>,
    events: broadcast::Sender<ShardingEvent>,
    rebalance_lock: Mutex<()>,
    pending_releases: Mutex<BTreeMap<PodAddress, BTreeSet<ShardId>>>,
    cancellation: CancellationToken,
}

impl ShardManager {
    /// Recovers persisted assignments, spawns the periodic rebalance, health
    /// sweep and release-retry tasks, and returns the running manager.
    pub async fn start(
        config: ShardManagerConfig,
        store: Arc<dyn AssignmentStore>,
        pods: Arc<dyn Pods>,
        health: Arc<dyn PodsHealth>,
    ) -> Result<Arc<ShardManager>, ShardManagerError> {
        config
            .validate()
            .map_err(ShardManagerError::InvalidConfig)?;

        // Saved owners are kept until the first health sweep: pods that come
        // back keep their shards, pods that do not are evicted there.
        let saved = store.read().await?;
        let assignments: AssignmentMap = (0..config.number_of_shards)
            .map(|shard| {
                let shard = ShardId(shard);
                (shard, saved.get(&shard).cloned().flatten())
            })
            .collect();
        let recovered_pods: BTreeMap<PodAddress, Pod> = shards_per_pod(&assignments)
            .into_keys()
            .map(|address| (address.clone(), Pod::new(address)))
            .collect();

        let (events, _) = broadcast::channel(1024);
        let manager = Arc::new(ShardManager {
            config,
            store,
            pods,
            health,
            state: RwLock::new(ShardManagerState {
                pods: recovered_pods,
                assignments,
            }),
            events,
            rebalance_lock: Mutex::new(()),
            pending_releases: Mutex::new(BTreeMap::new()),
            cancellation: CancellationToken::new(),
        });
        manager.spawn_background_tasks();

        info!(
            "Shard manager started with {} shards",
            manager.config.number_of_shards
        );
        Ok(manager)
    }

    /// Stops the background tasks. In-flight operations finish normally.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardingEvent> {
        self.events.subscribe()
    }

    /// Infinite stream of sharding events, starting at subscription time.
    pub fn get_sharding_events(&self) -> BroadcastStream<ShardingEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub async fn get_assignments(&self) -> AssignmentMap {
        self.state.read().await.assignments.clone()
    }

    pub async fn register(&self, pod: PodAddress) -> Result<(), ShardManagerError> {
        info!("Registering pod {pod}");
        let pod_count = {
            let mut state = self.state.write().await;
            state.pods.insert(pod.clone(), Pod::new(pod.clone()));
            state.pods.len()
        };
        metrics::record_pod_count(pod_count);
        self.publish(ShardingEvent::PodRegistered { pod });
        if let Err(err) = self.rebalance(false).await {
            warn!("Rebalance after registration failed: {err}");
        }
        Ok(())
    }

    pub async fn unregister(&self, pod: PodAddress) -> Result<(), ShardManagerError> {
        let (known, released, pod_count) = {
            let mut state = self.state.write().await;
            let known = state.pods.remove(&pod).is_some();
            let mut released = BTreeSet::new();
            if known {
                for (shard, owner) in state.assignments.iter_mut() {
                    if owner.as_ref() == Some(&pod) {
                        *owner = None;
                        released.insert(*shard);
                    }
                }
            }
            (known, released, state.pods.len())
        };
        if !known {
            debug!("Pod {pod} is not registered, ignoring unregister");
            return Ok(());
        }

        info!("Unregistering pod {pod}, releasing {} shard(s)", released.len());
        metrics::record_pod_count(pod_count);
        self.persist().await?;
        self.publish(ShardingEvent::PodUnregistered { pod: pod.clone() });
        if !released.is_empty() {
            metrics::record_shards_unassigned(released.len());
            self.publish(ShardingEvent::ShardsUnassigned {
                pod,
                shards: released,
            });
        }
        if let Err(err) = self.rebalance(true).await {
            warn!("Rebalance after unregistration failed: {err}");
        }
        Ok(())
    }

    /// Validates an unhealthy-pod report with a direct liveness probe and
    /// unregisters the pod when it is indeed gone.
    pub async fn notify_unhealthy_pod(&self, pod: PodAddress) -> Result<(), ShardManagerError> {
        if !self.state.read().await.pods.contains_key(&pod) {
            return Ok(());
        }
        self.publish(ShardingEvent::PodHealthChecked { pod: pod.clone() });
        if self.health.is_alive(&pod).await {
            debug!("Pod {pod} was reported unhealthy but responds to pings");
            Ok(())
        } else {
            warn!("Pod {pod} is not responding, removing it from the cluster");
            self.unregister(pod).await
        }
    }

    /// Probes every registered pod, evicting the ones that fail.
    pub async fn check_pod_health(&self) {
        let pods: Vec<PodAddress> = self.state.read().await.pods.keys().cloned().collect();
        let checks = pods.into_iter().map(|pod| async move {
            if let Err(err) = self.notify_unhealthy_pod(pod.clone()).await {
                warn!("Health check of {pod} failed: {err}");
            }
        });
        futures::future::join_all(checks).await;
    }

    /// Recomputes assignments and applies the movement plan. Non-immediate
    /// passes yield to one already in flight; immediate passes (pod loss)
    /// wait for their turn.
    pub async fn rebalance(&self, immediate: bool) -> Result<(), ShardManagerError> {
        let _guard = if immediate {
            self.rebalance_lock.lock().await
        } else {
            match self.rebalance_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(()),
            }
        };

        let moves = {
            let state = self.state.read().await;
            let pods: BTreeSet<PodAddress> = state.pods.keys().cloned().collect();
            plan_rebalance(&state.assignments, &pods, self.config.rebalance_rate)
        };
        if moves.is_empty() {
            return Ok(());
        }
        info!("Rebalancing {} shard(s)", moves.len());

        self.apply_unassignments(&moves).await?;
        self.apply_assignments(&moves).await?;
        Ok(())
    }

    async fn apply_unassignments(&self, moves: &[ShardMove]) -> Result<(), ShardManagerError> {
        let by_source: BTreeMap<PodAddress, BTreeSet<ShardId>> = moves
            .iter()
            .filter_map(|m| m.from.clone().map(|from| (from, m.shard)))
            .into_group_map()
            .into_iter()
            .map(|(pod, shards)| (pod, shards.into_iter().collect()))
            .collect();
        if by_source.is_empty() {
            return Ok(());
        }

        {
            let mut state = self.state.write().await;
            for shards in by_source.values() {
                for shard in shards {
                    state.assignments.insert(*shard, None);
                }
            }
        }
        self.persist().await?;

        for (pod, shards) in by_source {
            metrics::record_shards_unassigned(shards.len());
            let event = ShardingEvent::ShardsUnassigned {
                pod: pod.clone(),
                shards: shards.clone(),
            };
            self.publish(event.clone());
            if let Err(err) = self.pods.notify(&pod, &event).await {
                warn!(
                    "Failed to instruct {pod} to release {} shard(s): {err}; scheduling a retry",
                    shards.len()
                );
                self.pending_releases
                    .lock()
                    .await
                    .entry(pod)
                    .or_default()
                    .extend(shards);
            }
        }
        Ok(())
    }

    async fn apply_assignments(&self, moves: &[ShardMove]) -> Result<(), ShardManagerError> {
        let by_target: BTreeMap<PodAddress, BTreeSet<ShardId>> = moves
            .iter()
            .map(|m| (m.to.clone(), m.shard))
            .into_group_map()
            .into_iter()
            .map(|(pod, shards)| (pod, shards.into_iter().collect()))
            .collect();

        {
            let mut state = self.state.write().await;
            for (pod, shards) in &by_target {
                for shard in shards {
                    state.assignments.insert(*shard, Some(pod.clone()));
                }
            }
        }
        self.persist().await?;

        for (pod, shards) in by_target {
            metrics::record_shards_assigned(shards.len());
            let event = ShardingEvent::ShardsAssigned {
                pod: pod.clone(),
                shards,
            };
            self.publish(event.clone());
            if let Err(err) = self.pods.notify(&pod, &event).await {
                warn!("Failed to notify {pod} of newly assigned shards: {err}");
            }
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), ShardManagerError> {
        let snapshot = self.state.read().await.assignments.clone();
        let retry = RetryConfig {
            max_attempts: self.config.persist_retry_count.max(1),
            min_delay: self.config.persist_retry_interval,
            max_delay: self.config.persist_retry_interval,
            multiplier: 1.0,
        };
        with_retries("shard-manager", "persist-assignments", &retry, || {
            let snapshot = snapshot.clone();
            async move { self.store.write(&snapshot).await }
        })
        .await?;
        Ok(())
    }

    /// Re-sends release instructions that previously failed. A shard handed
    /// back to the same pod in the meantime is no longer released.
    async fn retry_pending_releases(&self) {
        let pending = std::mem::take(&mut *self.pending_releases.lock().await);
        if pending.is_empty() {
            return;
        }
        let state = self.state.read().await;
        for (pod, shards) in pending {
            if !state.pods.contains_key(&pod) {
                continue;
            }
            let shards: BTreeSet<ShardId> = shards
                .into_iter()
                .filter(|shard| {
                    state.assignments.get(shard).cloned().flatten().as_ref() != Some(&pod)
                })
                .collect();
            if shards.is_empty() {
                continue;
            }
            let event = ShardingEvent::ShardsUnassigned {
                pod: pod.clone(),
                shards: shards.clone(),
            };
            if let Err(err) = self.pods.notify(&pod, &event).await {
                warn!(
                    "Retried release of {} shard(s) on {pod} failed: {err}",
                    shards.len()
                );
                self.pending_releases
                    .lock()
                    .await
                    .entry(pod)
                    .or_default()
                    .extend(shards);
            }
        }
    }

    fn publish(&self, event: ShardingEvent) {
        debug!("Publishing sharding event: {event}");
        let _ = self.events.send(event);
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancellation.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.rebalance_interval) => {
                        if let Err(err) = manager.rebalance(false).await {
                            warn!("Periodic rebalance failed: {err}");
                        }
                    }
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancellation.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.pod_health_check_interval) => {
                        manager.check_pod_health().await;
                    }
                }
            }
        });

        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancellation.cancelled() => break,
                    _ = tokio::time::sleep(manager.config.rebalance_retry_interval) => {
                        manager.retry_pending_releases().await;
                    }
                }
            }
        });
    }
}
