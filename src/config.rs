// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Operator configuration: TOML file merged with environment overrides.
// Missing file means defaults; every default matches the documented one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Public base URL handed to UI/CLI clients at bootstrap.
    pub operator_url: String,
    pub server_port: u16,
    /// Liveness sweep period, seconds.
    pub health_check_interval: u64,
    /// Per-node HTTP probe timeout, seconds.
    pub health_check_timeout: u64,
    /// Advisory poll period echoed to workers, seconds.
    pub poll_interval: u64,
    /// Upper bound on any client-visible wait in the relay, seconds.
    pub max_job_timeout: u64,
    /// Relay drain tick, milliseconds.
    pub stream_check_interval_ms: u64,
    pub pricing: PricingConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub price_per_token: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_url: "http://localhost:8000".to_string(),
            server_port: 8000,
            health_check_interval: 30,
            health_check_timeout: 5,
            poll_interval: 2,
            max_job_timeout: 300,
            stream_check_interval_ms: 100,
            pricing: PricingConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price_per_token: 0.0001,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/operator.db".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("OPERATOR_URL") {
            self.operator_url = url;
        }
        if let Some(port) = env::var("SERVER_PORT").ok().and_then(|v| v.parse().ok()) {
            self.server_port = port;
        }
        if let Some(secs) = env::var("HEALTH_CHECK_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.health_check_interval = secs;
        }
        if let Some(secs) = env::var("HEALTH_CHECK_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.health_check_timeout = secs;
        }
        if let Some(secs) = env::var("MAX_JOB_TIMEOUT").ok().and_then(|v| v.parse().ok()) {
            self.max_job_timeout = secs;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(price) = env::var("PRICE_PER_TOKEN").ok().and_then(|v| v.parse().ok()) {
            self.pricing.price_per_token = price;
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    /// Nodes silent for longer than twice the sweep period are pruned.
    pub fn prune_max_age(&self) -> Duration {
        Duration::from_secs(self.health_check_interval * 2)
    }

    pub fn max_job_timeout(&self) -> Duration {
        Duration::from_secs(self.max_job_timeout)
    }

    pub fn stream_check_interval(&self) -> Duration {
        Duration::from_millis(self.stream_check_interval_ms)
    }
}
