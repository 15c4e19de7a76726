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

use hive_common::clients::shard_manager::ShardManagerClient;
use hive_common::hashing::shard_id_for;
use hive_common::model::PodAddress;
use hive_common::tracing::TracingConfig;
use hive_shard_manager::client::InProcessShardManagerClient;
use hive_shard_manager::config::ShardManagerConfig;
use hive_shard_manager::healthcheck::PingPodsHealth;
use hive_shard_manager::persistence::InMemoryAssignmentStore;
use hive_shard_manager::shard_manager::ShardManager;
use hive_sharding::config::ShardingConfig;
use hive_sharding::pods::InProcessPods;
use hive_sharding::sharding::Sharding;
use hive_sharding::storage::memory::InMemoryMailboxStorage;
use std::sync::Arc;
use std::time::Duration;

/// A whole cluster in one process: a shard manager, an in-process pod
/// transport, and a mailbox store shared by every pod the way a database
/// would be.
pub struct TestCluster {
    pub pods: Arc<InProcessPods>,
    pub shard_manager: Arc<ShardManager>,
    pub client: Arc<dyn ShardManagerClient>,
    pub storage: Arc<InMemoryMailboxStorage>,
    number_of_shards: u32,
}

impl TestCluster {
    pub async fn start(number_of_shards: u32) -> TestCluster {
        let pods = InProcessPods::new();
        let config = ShardManagerConfig {
            tracing: TracingConfig::test("shard-manager"),
            number_of_shards,
            // periodic work stays quiet; the tests drive rebalancing through
            // registration, unregistration and unhealthy-pod reports
            rebalance_interval: Duration::from_secs(3600),
            rebalance_retry_interval: Duration::from_secs(3600),
            pod_health_check_interval: Duration::from_secs(3600),
            pod_ping_timeout: Duration::from_millis(200),
            persist_retry_count: 1,
            persist_retry_interval: Duration::from_millis(10),
            ..ShardManagerConfig::default()
        };
        let health = Arc::new(PingPodsHealth::new(pods.clone(), Duration::from_millis(200)));
        let shard_manager = ShardManager::start(
            config,
            Arc::new(InMemoryAssignmentStore::new()),
            pods.clone(),
            health,
        )
        .await
        .expect("failed to start the shard manager");
        let client: Arc<dyn ShardManagerClient> =
            Arc::new(InProcessShardManagerClient::new(shard_manager.clone()));

        TestCluster {
            pods,
            shard_manager,
            client,
            storage: Arc::new(InMemoryMailboxStorage::new()),
            number_of_shards,
        }
    }

    pub async fn start_pod(&self, port: u16) -> Arc<Sharding> {
        self.start_pod_with_idle_time(port, Duration::from_secs(60))
            .await
    }

    pub async fn start_pod_with_idle_time(
        &self,
        port: u16,
        entity_max_idle_time: Duration,
    ) -> Arc<Sharding> {
        let config = ShardingConfig {
            tracing: TracingConfig::test("sharding"),
            host: "localhost".to_string(),
            port,
            number_of_shards: self.number_of_shards,
            entity_max_idle_time,
            entity_termination_timeout: Duration::from_secs(3),
            refresh_assignments_interval: Duration::from_millis(200),
            ..ShardingConfig::default()
        };
        let sharding = Sharding::start(
            config,
            self.storage.clone(),
            self.pods.clone(),
            self.client.clone(),
        )
        .await
        .expect("failed to start pod");
        self.pods.connect(sharding.clone()).await;
        sharding
    }

    /// Simulates a crash: the pod stops answering without shutting down.
    pub async fn crash_pod(&self, pod: &PodAddress) {
        self.pods.disconnect(pod).await;
    }

    pub async fn refresh_all(&self, pods: &[&Arc<Sharding>]) {
        for pod in pods {
            pod.refresh_assignments()
                .await
                .expect("failed to refresh assignments");
        }
    }

    /// Finds an entity id whose shard is currently owned by the given pod.
    pub async fn entity_id_on(&self, pod: &PodAddress, prefix: &str) -> String {
        let assignments = self.shard_manager.get_assignments().await;
        for n in 0..10_000 {
            let id = format!("{prefix}-{n}");
            let shard = shard_id_for(&id, self.number_of_shards);
            if assignments.get(&shard).cloned().flatten().as_ref() == Some(pod) {
                return id;
            }
        }
        panic!("no entity id found on pod {pod}");
    }

    pub fn stop(&self) {
        self.shard_manager.stop();
    }
}
