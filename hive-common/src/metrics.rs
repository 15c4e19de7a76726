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

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, IntCounterVec,
    IntGauge, IntGaugeVec, Registry,
};

lazy_static! {
    static ref ACTIVE_ENTITIES: IntGaugeVec = register_int_gauge_vec!(
        "hive_active_entities",
        "Number of live entities per entity type",
        &["entity_type"]
    )
    .unwrap();
    static ref MESSAGES_PERSISTED: IntCounterVec = register_int_counter_vec!(
        "hive_messages_persisted_total",
        "Number of messages durably saved per entity type",
        &["entity_type"]
    )
    .unwrap();
    static ref MESSAGES_PROCESSED: IntCounterVec = register_int_counter_vec!(
        "hive_messages_processed_total",
        "Number of messages replied to per entity type",
        &["entity_type"]
    )
    .unwrap();
    static ref REGISTERED_PODS: IntGauge = register_int_gauge!(
        "hive_registered_pods",
        "Number of pods currently registered with the shard manager"
    )
    .unwrap();
    static ref SHARD_MOVES: IntCounterVec = register_int_counter_vec!(
        "hive_shard_moves_total",
        "Number of shard ownership changes applied by the shard manager",
        &["kind"]
    )
    .unwrap();
}

pub fn register_all() -> &'static Registry {
    prometheus::default_registry()
}

pub fn record_entity_created(entity_type: &str) {
    ACTIVE_ENTITIES.with_label_values(&[entity_type]).inc();
}

pub fn record_entity_terminated(entity_type: &str) {
    ACTIVE_ENTITIES.with_label_values(&[entity_type]).dec();
}

pub fn record_message_persisted(entity_type: &str) {
    MESSAGES_PERSISTED.with_label_values(&[entity_type]).inc();
}

pub fn record_message_processed(entity_type: &str) {
    MESSAGES_PROCESSED.with_label_values(&[entity_type]).inc();
}

pub fn record_pod_count(count: usize) {
    REGISTERED_PODS.set(count as i64);
}

pub fn record_shards_assigned(count: usize) {
    SHARD_MOVES
        .with_label_values(&["assigned"])
        .inc_by(count as u64);
}

pub fn record_shards_unassigned(count: usize) {
    SHARD_MOVES
        .with_label_values(&["unassigned"])
        .inc_by(count as u64);
}
