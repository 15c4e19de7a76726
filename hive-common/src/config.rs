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

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::error;

/// Layered configuration loader: defaults, then an optional TOML file, then
/// `HIVE__` prefixed environment variables (`__` separates nesting levels).
pub struct ConfigLoader<T> {
    config_file_name: PathBuf,
    _config: PhantomData<T>,
}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            _config: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(self.config_file_name.clone()))
            .merge(Env::prefixed("HIVE__").split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    /// Loads the configuration, or prints the effective defaults and returns
    /// `None` when invoked with `--dump-config`. Load failures are logged and
    /// also return `None` so the caller can exit.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            match serde_json::to_string_pretty(&T::default()) {
                Ok(dump) => println!("{dump}"),
                Err(err) => error!("Failed to dump default config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    error!("Failed to load config: {err}");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        port: u16,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                name: "default".to_string(),
                port: 9000,
            }
        }
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        let loader: ConfigLoader<TestConfig> = ConfigLoader::new(Path::new("does-not-exist.toml"));
        let config = loader.load().unwrap();
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("HIVE__PORT", "9100");
            let loader: ConfigLoader<TestConfig> =
                ConfigLoader::new(Path::new("does-not-exist.toml"));
            let config = loader.load()?;
            assert_eq!(config.port, 9100);
            assert_eq!(config.name, "default");
            Ok(())
        });
    }
}
