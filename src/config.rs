//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::priority;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Address the HTTP/WebSocket server binds to.
    pub http_addr: String,
    /// Lease TTL for agent executions. Sized to exceed any single run.
    pub agent_lease_ttl: Duration,
    /// Lease TTL for inference tasks. Tighter, so crash recovery is quicker.
    pub inference_lease_ttl: Duration,
    /// How long an idle worker sleeps between lease attempts.
    pub poll_interval: Duration,
    /// Period of the anti-starvation aging loop.
    pub aging_interval: Duration,
    /// PENDING jobs older than this are eligible for an aging boost.
    pub aging_threshold: Duration,
    /// Number of agent workers to spawn.
    pub agent_workers: usize,
    /// Number of inference workers to spawn.
    pub inference_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("agent-core.db"),
            http_addr: "127.0.0.1:8000".to_string(),
            agent_lease_ttl: Duration::from_secs(600),
            inference_lease_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
            aging_interval: Duration::from_secs(priority::AGING_INTERVAL_SEC),
            aging_threshold: Duration::from_secs(priority::AGING_THRESHOLD_SEC),
            agent_workers: 1,
            inference_workers: 1,
        }
    }
}

impl EngineConfig {
    /// Build an EngineConfig from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("AGENT_CORE_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_addr: std::env::var("AGENT_CORE_ADDR").unwrap_or(defaults.http_addr),
            agent_lease_ttl: env_secs("AGENT_CORE_AGENT_LEASE_TTL", defaults.agent_lease_ttl),
            inference_lease_ttl: env_secs(
                "AGENT_CORE_INFERENCE_LEASE_TTL",
                defaults.inference_lease_ttl,
            ),
            poll_interval: std::env::var("AGENT_CORE_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            aging_interval: env_secs("AGENT_CORE_AGING_INTERVAL", defaults.aging_interval),
            aging_threshold: env_secs("AGENT_CORE_AGING_THRESHOLD", defaults.aging_threshold),
            agent_workers: env_usize("AGENT_CORE_AGENT_WORKERS", defaults.agent_workers),
            inference_workers: env_usize(
                "AGENT_CORE_INFERENCE_WORKERS",
                defaults.inference_workers,
            ),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_ttls() {
        let config = EngineConfig::default();
        assert_eq!(config.agent_lease_ttl, Duration::from_secs(600));
        assert_eq!(config.inference_lease_ttl, Duration::from_secs(300));
    }

    #[test]
    fn default_aging_knobs_match_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.aging_interval, Duration::from_secs(60));
        assert_eq!(config.aging_threshold, Duration::from_secs(300));
    }
}
