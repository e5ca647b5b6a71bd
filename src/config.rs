// Copyright 2024 RisingWave Labs
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

use std::time::Duration;

use serde::Deserialize;

/// Configuration surface recognized by the coordinator core.
///
/// Every field has the documented default so a caller can `Config::default()`
/// and override only what it cares about, deserializing the rest from
/// whatever configuration file format the hosting binary chooses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub balancer: BalancerConfig,
    pub scheduler: SchedulerConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    #[serde(with = "humantime_secs")]
    pub check_interval: Duration,
    pub rebalance_threshold: f64,
    pub policy: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            rebalance_threshold: 0.2,
            policy: "vchannel_fair".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_secs")]
    pub interval: Duration,
    #[serde(with = "humantime_secs")]
    pub slow_threshold: Duration,
    pub poll_concurrency: usize,
    pub finished_lru_capacity: usize,
    #[serde(with = "humantime_secs")]
    pub finished_lru_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            slow_threshold: Duration::from_secs(30),
            poll_concurrency: 100,
            finished_lru_capacity: 512,
            finished_lru_ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    #[serde(with = "humantime_secs")]
    pub check_interval: Duration,
    #[serde(with = "humantime_secs")]
    pub scan_interval: Duration,
    #[serde(with = "humantime_secs")]
    pub missing_tolerance: Duration,
    #[serde(with = "humantime_secs")]
    pub drop_tolerance: Duration,
    pub remove_concurrency: usize,
    pub log_prefix: String,
    pub index_prefix: String,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60 * 60),
            scan_interval: Duration::from_secs(24 * 60 * 60),
            missing_tolerance: Duration::from_secs(60 * 60),
            drop_tolerance: Duration::from_secs(3 * 60 * 60),
            remove_concurrency: 32,
            log_prefix: "logs/".to_string(),
            index_prefix: "index/".to_string(),
        }
    }
}

/// Serializes a `Duration` as whole seconds; config files in this ecosystem
/// write intervals as bare integers rather than `humantime` strings.
mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
