/// Configuration management for the mechaflow engine
///
/// Handles the database location, job scheduler tuning and retry policy.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Persistence configuration
    pub database: DatabaseConfig,
    /// Job scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Failed job retry policy
    pub retry: RetryConfig,
    /// Directory of `*.json` workflow sources deployed at startup (optional)
    pub definitions_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (e.g., "sqlite://data/mechaflow.db")
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between polls for due jobs
    pub poll_interval_ms: u64,
    /// Maximum concurrently executing jobs
    pub workers: usize,
    /// Maximum jobs claimed per poll
    pub batch_size: usize,
    /// Lease length for job and instance claims
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failures allowed before a job becomes dead
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("MECHAFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/mechaflow.db".to_string()),
            },
            scheduler: SchedulerConfig {
                poll_interval_ms: env_or("MECHAFLOW_POLL_INTERVAL_MS", 1000),
                workers: env_or("MECHAFLOW_WORKERS", 4),
                batch_size: env_or("MECHAFLOW_BATCH_SIZE", 32),
                lease_secs: env_or("MECHAFLOW_LEASE_SECS", 60),
            },
            retry: RetryConfig {
                max_retries: env_or("MECHAFLOW_MAX_RETRIES", 5),
                initial_backoff_ms: env_or("MECHAFLOW_INITIAL_BACKOFF_MS", 1000),
                multiplier: env_or("MECHAFLOW_BACKOFF_MULTIPLIER", 2.0),
                max_backoff_ms: env_or("MECHAFLOW_MAX_BACKOFF_MS", 300_000),
            },
            definitions_dir: std::env::var("MECHAFLOW_DEFINITIONS_DIR").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("MECHAFLOW_TEST_GARBAGE_WORKERS", "many");
        assert_eq!(env_or("MECHAFLOW_TEST_GARBAGE_WORKERS", 4usize), 4);
        std::env::set_var("MECHAFLOW_TEST_GARBAGE_WORKERS", "8");
        assert_eq!(env_or("MECHAFLOW_TEST_GARBAGE_WORKERS", 4usize), 8);
    }
}
