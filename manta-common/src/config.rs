// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

/// Loads a service config from an optional TOML file merged with
/// `MANTA__`-prefixed environment variables, on top of the struct's own
/// defaults.
pub struct ConfigLoader<T: DeserializeOwned + Serialize + Default> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoader<T> {
    pub fn new(config_file_name: &str) -> Self {
        ConfigLoader {
            config_file_name: PathBuf::from(config_file_name),
            phantom: PhantomData,
        }
    }

    pub fn load(&self) -> figment::Result<T> {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("MANTA__").split("__"))
            .extract()
    }
}

/// Shared retry policy for GCS operations, pull retries and task forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Delay before the given (1-based) attempt, exponentially grown and
    /// capped; `None` when the attempt budget is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        let delay = self.min_delay.saturating_mul(factor);
        Some(delay.min(self.max_delay))
    }
}

/// Node-manager side knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeManagerConfig {
    pub protocol_version: u64,
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    pub num_heartbeats_timeout: u64,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reconstruction_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_reconstruction_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub forward_task_retry_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_worker_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_task_lease_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub spillback_backoff_min: Duration,
    pub max_lineage_size: u64,
    pub actor_creation_num_spillbacks_warning: u32,
    pub num_initial_workers: usize,
    pub num_workers_per_process: usize,
    pub retries: RetryConfig,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            heartbeat_timeout: Duration::from_millis(100),
            num_heartbeats_timeout: 300,
            fetch_timeout: Duration::from_millis(1000),
            reconstruction_timeout: Duration::from_millis(1000),
            initial_reconstruction_timeout: Duration::from_millis(10000),
            forward_task_retry_timeout: Duration::from_millis(1000),
            kill_worker_timeout: Duration::from_millis(100),
            max_task_lease_timeout: Duration::from_millis(60000),
            spillback_backoff_min: Duration::from_millis(100),
            max_lineage_size: 100,
            actor_creation_num_spillbacks_warning: 100,
            num_initial_workers: 0,
            num_workers_per_process: 1,
            retries: RetryConfig::default(),
        }
    }
}

/// Object store knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub capacity_bytes: u64,
    /// Number of releases deferred before the oldest is applied.
    pub release_delay: usize,
    pub evict_if_full_default: bool,
    /// Fraction of capacity above which deferred releases flush eagerly.
    pub release_watermark: f64,
    /// Objects at or below this size stay in the caller's in-memory store.
    pub inline_object_max_bytes: usize,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024,
            release_delay: 64,
            evict_if_full_default: true,
            release_watermark: 0.8,
            inline_object_max_bytes: 100 * 1024,
        }
    }
}

/// Peer object transfer knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectManagerConfig {
    #[serde(with = "humantime_serde")]
    pub pull_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub push_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub repeated_push_delay: Duration,
    pub default_chunk_size: usize,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_millis(10000),
            push_timeout: Duration::from_millis(10000),
            repeated_push_delay: Duration::from_millis(60000),
            default_chunk_size: 1024 * 1024,
        }
    }
}

/// Per-worker knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreWorkerConfig {
    #[serde(with = "humantime_serde")]
    pub get_timeout: Duration,
    /// Cap on concurrent method calls of an async actor.
    pub max_concurrency: usize,
    pub retries: RetryConfig,
}

impl Default for CoreWorkerConfig {
    fn default() -> Self {
        Self {
            get_timeout: Duration::from_millis(1000),
            max_concurrency: 1,
            retries: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn defaults_carry_documented_values() {
        let config = NodeManagerConfig::default();
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(100));
        assert_eq!(config.num_heartbeats_timeout, 300);
        assert_eq!(config.kill_worker_timeout, Duration::from_millis(100));
        assert_eq!(ObjectStoreConfig::default().release_delay, 64);
        assert_eq!(
            ObjectManagerConfig::default().default_chunk_size,
            1024 * 1024
        );
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retries = RetryConfig::default();
        assert_eq!(
            retries.delay_for_attempt(1),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            retries.delay_for_attempt(2),
            Some(Duration::from_millis(200))
        );
        assert_eq!(retries.delay_for_attempt(4), Some(Duration::from_millis(800)));
        assert_eq!(retries.delay_for_attempt(5), None);
    }

    #[test]
    fn config_loader_falls_back_to_defaults() {
        let loaded: NodeManagerConfig = ConfigLoader::new("does-not-exist.toml")
            .load()
            .expect("defaults should load");
        assert_eq!(loaded, NodeManagerConfig::default());
    }
}
