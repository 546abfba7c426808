//! Engine configuration.
//!
//! TTLs and thresholds here are tuned empirically in deployments; everything
//! is a tunable parameter rather than a hard-coded constant.

use crate::cache::RegionConfig;
use crate::cleanup::CleanupConfig;
use crate::pool::PoolConfig;
use crate::throttle::ThrottleConfig;
use crate::warm::WarmConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

// Default cache regions
const DEFAULT_SETTINGS_TTL_SECONDS: u64 = 300; // 5 minutes
const DEFAULT_HISTORY_TTL_SECONDS: u64 = 60; // 1 minute
const DEFAULT_REGION_MAX_ENTRIES: usize = 10_000;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub regions: Vec<RegionConfig>,
    pub warm: WarmConfig,
    pub throttle: ThrottleConfig,
    pub cleanup: CleanupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            regions: vec![
                RegionConfig::new(
                    crate::SETTINGS_REGION,
                    Duration::from_secs(DEFAULT_SETTINGS_TTL_SECONDS),
                    DEFAULT_REGION_MAX_ENTRIES,
                ),
                RegionConfig::new(
                    crate::HISTORY_REGION,
                    Duration::from_secs(DEFAULT_HISTORY_TTL_SECONDS),
                    DEFAULT_REGION_MAX_ENTRIES,
                ),
            ],
            warm: WarmConfig::default(),
            throttle: ThrottleConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(anyhow::anyhow!("Pool max size must be at least 1"));
        }

        if self.pool.min_size > self.pool.max_size {
            return Err(anyhow::anyhow!(
                "Pool min size ({}) must not exceed max size ({})",
                self.pool.min_size,
                self.pool.max_size
            ));
        }

        if self.pool.acquire_timeout.is_zero() {
            return Err(anyhow::anyhow!("Pool acquire timeout must be non-zero"));
        }

        let mut names = HashSet::new();
        for region in &self.regions {
            if !names.insert(region.name.as_str()) {
                return Err(anyhow::anyhow!("Duplicate cache region: {}", region.name));
            }
            if region.ttl.is_zero() {
                return Err(anyhow::anyhow!(
                    "Cache region {} must have a non-zero TTL",
                    region.name
                ));
            }
            if region.max_entries == 0 {
                return Err(anyhow::anyhow!(
                    "Cache region {} must allow at least 1 entry",
                    region.name
                ));
            }
        }

        if self.throttle.flush_threshold == 0 {
            return Err(anyhow::anyhow!("Flush threshold must be at least 1"));
        }

        if self.throttle.retry.growth_factor < 1.0 {
            return Err(anyhow::anyhow!("Retry growth factor must be at least 1.0"));
        }

        if !(0.0..1.0).contains(&self.throttle.retry.jitter) {
            return Err(anyhow::anyhow!("Retry jitter must be in [0, 1)"));
        }

        if self.throttle.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("Retry max attempts must be at least 1"));
        }

        if self.cleanup.interval.is_zero() {
            return Err(anyhow::anyhow!("Cleanup interval must be non-zero"));
        }

        Ok(())
    }
}
