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

use hive_common::config::ConfigLoader;
use hive_common::model::{PodAddress, RetryConfig};
use hive_common::tracing::TracingConfig;
use hive_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub tracing: TracingConfig,
    pub host: String,
    pub port: u16,
    /// Cluster-wide shard count; every pod must use the same value.
    pub number_of_shards: u32,
    /// How long an entity may stay idle before its scope is closed.
    #[serde(with = "humantime_serde")]
    pub entity_max_idle_time: Duration,
    /// Upper bound on draining an entity's mailbox during shutdown or
    /// rebalancing; afterwards the entity scope is closed forcefully.
    #[serde(with = "humantime_serde")]
    pub entity_termination_timeout: Duration,
    /// Interval of the background pull refreshing the local assignment
    /// cache from the shard manager.
    #[serde(with = "humantime_serde")]
    pub refresh_assignments_interval: Duration,
    pub retry: RetryConfig,
}

impl ShardingConfig {
    pub fn pod_address(&self) -> PodAddress {
        PodAddress::new(self.host.clone(), self.port)
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("sharding"),
            host: "localhost".to_string(),
            port: 9000,
            number_of_shards: 300,
            entity_max_idle_time: Duration::from_secs(60),
            entity_termination_timeout: Duration::from_secs(10),
            refresh_assignments_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for ShardingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing: {}", self.tracing.to_safe_string());
        let _ = writeln!(&mut result, "pod address: {}", self.pod_address());
        let _ = writeln!(&mut result, "number of shards: {}", self.number_of_shards);
        let _ = writeln!(
            &mut result,
            "entity max idle time: {:?}",
            self.entity_max_idle_time
        );
        let _ = writeln!(
            &mut result,
            "entity termination timeout: {:?}",
            self.entity_termination_timeout
        );
        let _ = writeln!(
            &mut result,
            "refresh assignments interval: {:?}",
            self.refresh_assignments_interval
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ShardingConfig> {
    ConfigLoader::new(Path::new("config/sharding.toml"))
}
