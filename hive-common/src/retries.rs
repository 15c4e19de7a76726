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

use crate::model::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use tracing::{error, warn};

/// Runs `action` until it succeeds or the attempt budget of `config` is
/// exhausted, sleeping with exponential backoff between attempts. Each
/// failed attempt is logged with the given target and operation labels.
pub async fn with_retries<T, E, F, Fut>(
    target: &str,
    op: &str,
    config: &RetryConfig,
    action: F,
) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts: u32 = 0;
    let mut delay = config.min_delay;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if attempts >= config.max_attempts.max(1) {
                    error!("{target} - {op} failed after {attempts} attempt(s): {err}");
                    return Err(err);
                }
                warn!(
                    "{target} - {op} failed (attempt {attempts}): {err}; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(config.multiplier).min(config.max_delay);
            }
        }
    }
}
