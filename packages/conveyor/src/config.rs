//! Node configuration loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Runtime configuration for a queue node.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Number of worker loops to spawn.
    pub worker_count: usize,
    pub tick_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub lease_duration_ms: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            worker_count: env::var("CONVEYOR_WORKERS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("CONVEYOR_WORKERS must be a valid number")?,
            tick_interval_ms: env::var("CONVEYOR_TICK_INTERVAL_MS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .context("CONVEYOR_TICK_INTERVAL_MS must be a valid number")?,
            poll_interval_ms: env::var("CONVEYOR_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .context("CONVEYOR_POLL_INTERVAL_MS must be a valid number")?,
            lease_duration_ms: env::var("CONVEYOR_LEASE_DURATION_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("CONVEYOR_LEASE_DURATION_MS must be a valid number")?,
        })
    }
}
