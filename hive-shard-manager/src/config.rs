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
use hive_common::tracing::TracingConfig;
use hive_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardManagerConfig {
    pub tracing: TracingConfig,
    pub number_of_shards: u32,
    #[serde(with = "humantime_serde")]
    pub rebalance_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub rebalance_retry_interval: Duration,
    pub rebalance_rate: f64,
    #[serde(with = "humantime_serde")]
    pub persist_retry_interval: Duration,
    pub persist_retry_count: u32,
    #[serde(with = "humantime_serde")]
    pub pod_health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub pod_ping_timeout: Duration,
}

impl ShardManagerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.number_of_shards == 0 {
            return Err("number_of_shards must be positive".to_string());
        }
        if !(self.rebalance_rate > 0.0 && self.rebalance_rate <= 1.0) {
            return Err(format!(
                "rebalance_rate must be in (0, 1], got {}",
                self.rebalance_rate
            ));
        }
        Ok(())
    }
}

impl Default for ShardManagerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("shard-manager"),
            number_of_shards: 300,
            rebalance_interval: Duration::from_secs(20),
            rebalance_retry_interval: Duration::from_secs(10),
            rebalance_rate: 1.0,
            persist_retry_interval: Duration::from_secs(3),
            persist_retry_count: 100,
            pod_health_check_interval: Duration::from_secs(60),
            pod_ping_timeout: Duration::from_secs(3),
        }
    }
}

impl SafeDisplay for ShardManagerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing: {}", self.tracing.to_safe_string());
        let _ = writeln!(&mut result, "number of shards: {}", self.number_of_shards);
        let _ = writeln!(
            &mut result,
            "rebalance interval: {:?}",
            self.rebalance_interval
        );
        let _ = writeln!(
            &mut result,
            "rebalance retry interval: {:?}",
            self.rebalance_retry_interval
        );
        let _ = writeln!(&mut result, "rebalance rate: {}", self.rebalance_rate);
        let _ = writeln!(
            &mut result,
            "persist retry interval: {:?}",
            self.persist_retry_interval
        );
        let _ = writeln!(
            &mut result,
            "persist retry count: {}",
            self.persist_retry_count
        );
        let _ = writeln!(
            &mut result,
            "pod health check interval: {:?}",
            self.pod_health_check_interval
        );
        let _ = writeln!(&mut result, "pod ping timeout: {:?}", self.pod_ping_timeout);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ShardManagerConfig> {
    ConfigLoader::new(Path::new("config/shard-manager.toml"))
}
