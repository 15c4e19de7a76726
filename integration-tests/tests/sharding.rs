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

test_r::enable!();

#[test_r::sequential]
mod tests {
    use test_r::{test, test_dep, timeout};

    use assert2::check;
    use hive_common::envelope::{Envelope, MessageExit};
    use hive_common::model::{EntityAddress, ShardingEvent};
    use hive_common::tracing::{init_tracing_with_default_env_filter, TracingConfig};
    use hive_shard_manager::model::shards_per_pod;
    use hive_sharding::error::ShardingError;
    use hive_sharding::storage::MailboxStorage;
    use integration_tests::cluster::TestCluster;
    use integration_tests::counter::{counter_entity, CounterBehavior, CounterMessage};
    use std::time::Duration;
    use tracing::info;

    pub struct Tracing;

    impl Tracing {
        pub fn init() -> Self {
            init_tracing_with_default_env_filter(&TracingConfig::test("sharding-tests"));
            Self
        }
    }

    #[test_dep]
    pub fn tracing() -> Tracing {
        Tracing::init()
    }

    fn inc(key: &str) -> CounterMessage {
        CounterMessage::Inc {
            key: key.to_string(),
        }
    }

    fn get(key: &str) -> CounterMessage {
        CounterMessage::Get {
            key: key.to_string(),
        }
    }

    #[test]
    #[timeout(30000)]
    async fn single_pod_counter(_tracing: &Tracing) {
        let cluster = TestCluster::start(16).await;
        let pod = cluster.start_pod(9001).await;
        pod.register_entity(&counter_entity(), CounterBehavior)
            .await
            .unwrap();

        let messenger = pod.messenger(counter_entity());
        messenger.tell("x", inc("k1")).await.unwrap();
        messenger.tell("x", inc("k2")).await.unwrap();
        let value = messenger.ask("x", get("k3")).await.unwrap();
        check!(value == 2);

        let manager = pod
            .entity_manager(counter_entity().entity_type())
            .await
            .unwrap();
        check!(manager.active_entities().await.len() == 1);

        pod.stop().await;
        cluster.stop();
    }

    #[test]
    #[timeout(30000)]
    async fn idle_entities_expire_and_come_back_empty(_tracing: &Tracing) {
        let cluster = TestCluster::start(16).await;
        let pod = cluster
            .start_pod_with_idle_time(9001, Duration::from_millis(50))
            .await;
        pod.register_entity(&counter_entity(), CounterBehavior)
            .await
            .unwrap();

        let messenger = pod.messenger(counter_entity());
        messenger.tell("x", inc("k1")).await.unwrap();
        let value = messenger.ask("x", get("k2")).await.unwrap();
        check!(value == 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let manager = pod
            .entity_manager(counter_entity().entity_type())
            .await
            .unwrap();
        check!(manager.active_entities().await.is_empty());

        // The recreated entity starts from scratch; durable state reloads
        // are an entity-behavior concern.
        let value = messenger.ask("x", get("k3")).await.unwrap();
        check!(value == 0);

        pod.stop().await;
        cluster.stop();
    }

    #[test]
    #[timeout(30000)]
    async fn messages_transit_between_pods(_tracing: &Tracing) {
        let cluster = TestCluster::start(16).await;
        let pod_a = cluster.start_pod(9001).await;
        let pod_b = cluster.start_pod(9002).await;
        for pod in [&pod_a, &pod_b] {
            pod.register_entity(&counter_entity(), CounterBehavior)
                .await
                .unwrap();
        }
        cluster.refresh_all(&[&pod_a, &pod_b]).await;

        let entity_id = cluster.entity_id_on(pod_b.pod_address(), "user").await;
        info!("Entity {entity_id} lives on {}", pod_b.pod_address());

        let messenger = pod_a.messenger(counter_entity());
        messenger.tell(&entity_id, inc("k1")).await.unwrap();

        let manager_b = pod_b
            .entity_manager(counter_entity().entity_type())
            .await
            .unwrap();
        check!(manager_b.active_entities().await.len() == 1);
        let manager_a = pod_a
            .entity_manager(counter_entity().entity_type())
            .await
            .unwrap();
        check!(manager_a.active_entities().await.is_empty());

        let value = messenger.ask(&entity_id, get("k2")).await.unwrap();
        check!(value == 1);

        pod_a.stop().await;
        pod_b.stop().await;
        cluster.stop();
    }

    #[test]
    #[timeout(30000)]
    async fn a_crashed_pod_is_evicted_and_its_shards_move(_tracing: &Tracing) {
        let cluster = TestCluster::start(12).await;
        let pod_a = cluster.start_pod(9001).await;
        let pod_b = cluster.start_pod(9002).await;
        let pod_c = cluster.start_pod(9003).await;
        for pod in [&pod_a, &pod_b, &pod_c] {
            pod.register_entity(&counter_entity(), CounterBehavior)
                .await
                .unwrap();
        }
        cluster.refresh_all(&[&pod_a, &pod_b, &pod_c]).await;

        let per_pod = shards_per_pod(&cluster.shard_manager.get_assignments().await);
        check!(per_pod[pod_a.pod_address()].len() == 4);
        check!(per_pod[pod_b.pod_address()].len() == 4);
        check!(per_pod[pod_c.pod_address()].len() == 4);

        let entity_id = cluster.entity_id_on(pod_c.pod_address(), "user").await;
        let mut events = cluster.shard_manager.subscribe();

        cluster.crash_pod(pod_c.pod_address()).await;

        // The failed delivery reports the pod, which fails its liveness
        // probe and gets evicted.
        let messenger = pod_a.messenger(counter_entity());
        let result = messenger.tell(&entity_id, inc("k1")).await;
        check!(matches!(result, Err(ShardingError::PodUnavailable(_))));

        let per_pod = shards_per_pod(&cluster.shard_manager.get_assignments().await);
        check!(!per_pod.contains_key(pod_c.pod_address()));
        check!(per_pod[pod_a.pod_address()].len() == 6);
        check!(per_pod[pod_b.pod_address()].len() == 6);

        let mut saw_unregistered = false;
        let mut saw_assigned = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ShardingEvent::PodUnregistered { pod } if pod == *pod_c.pod_address() => {
                    saw_unregistered = true;
                }
                ShardingEvent::ShardsAssigned { .. } => {
                    saw_assigned = true;
                }
                _ => {}
            }
        }
        check!(saw_unregistered);
        check!(saw_assigned);

        // After a cache refresh the entity is reachable on a survivor. The
        // failed delivery was never persisted, so the fresh entity counts
        // from zero.
        cluster.refresh_all(&[&pod_a, &pod_b]).await;
        messenger.tell(&entity_id, inc("k2")).await.unwrap();
        let value = messenger.ask(&entity_id, get("k3")).await.unwrap();
        check!(value == 1);

        pod_a.stop().await;
        pod_b.stop().await;
        cluster.stop();
    }

    #[test]
    #[timeout(30000)]
    async fn malformed_messages_are_rejected(_tracing: &Tracing) {
        let cluster = TestCluster::start(16).await;
        let pod = cluster.start_pod(9001).await;
        pod.register_entity(&counter_entity(), CounterBehavior)
            .await
            .unwrap();

        let address = EntityAddress::new(
            pod.shard_id_for("x"),
            counter_entity().entity_type().clone(),
            "x",
        );
        let envelope = Envelope {
            address,
            message: serde_json::json!({ "Unknown": { "key": 1 } }),
        };
        let result = pod.send_to_local_entity_manager(&envelope).await;
        check!(matches!(
            result,
            Err(ShardingError::MalformedMessage { .. })
        ));

        let manager = pod
            .entity_manager(counter_entity().entity_type())
            .await
            .unwrap();
        check!(manager.active_entities().await.is_empty());

        pod.stop().await;
        cluster.stop();
    }

    #[test]
    #[timeout(30000)]
    async fn shutdown_drains_entities_and_refuses_new_ones(_tracing: &Tracing) {
        let cluster = TestCluster::start(16).await;
        let pod = cluster.start_pod(9001).await;
        pod.register_entity(&counter_entity(), CounterBehavior)
            .await
            .unwrap();

        let messenger = pod.messenger(counter_entity());
        for n in 1..=5 {
            messenger.tell("x", inc(&format!("k{n}"))).await.unwrap();
        }
        pod.stop().await;

        // Everything enqueued before the shutdown was drained and replied.
        let address = EntityAddress::new(
            pod.shard_id_for("x"),
            counter_entity().entity_type().clone(),
            "x",
        );
        let exit = cluster.storage.await_processed(&address, "k5").await.unwrap();
        check!(exit == MessageExit::success(&5i64).unwrap());

        // The pod no longer owns anything.
        let per_pod = shards_per_pod(&cluster.shard_manager.get_assignments().await);
        check!(!per_pod.contains_key(pod.pod_address()));

        // New sends are refused by the shut-down pod.
        let result = messenger.tell("y", inc("k6")).await;
        check!(matches!(
            result,
            Err(ShardingError::EntityNotManagedByPod { .. })
        ));

        cluster.stop();
    }
}
