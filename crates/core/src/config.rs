//! Environment-driven engine settings.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Concurrent tasks per release fan-out.
    pub fanout: usize,
    pub delete_wait: Duration,
    pub delete_poll: Duration,
    pub request_timeout: Duration,
    pub db_path: String,
    pub max_yaml_bytes: usize,
    pub max_yaml_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fanout: 8,
            delete_wait: Duration::from_secs(60),
            delete_poll: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            db_path: default_db_path(),
            max_yaml_bytes: 1_000_000,
            max_yaml_nodes: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fanout: env_parse::<usize>("DECKHAND_FANOUT").unwrap_or(d.fanout).max(1),
            delete_wait: env_parse::<u64>("DECKHAND_DELETE_WAIT_SECS").map(Duration::from_secs).unwrap_or(d.delete_wait),
            delete_poll: env_parse::<u64>("DECKHAND_DELETE_POLL_MS").map(Duration::from_millis).unwrap_or(d.delete_poll),
            request_timeout: env_parse::<u64>("DECKHAND_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.request_timeout),
            db_path: std::env::var("DECKHAND_DB_PATH").unwrap_or(d.db_path),
            max_yaml_bytes: env_parse("DECKHAND_MAX_YAML_BYTES").unwrap_or(d.max_yaml_bytes),
            max_yaml_nodes: env_parse("DECKHAND_MAX_YAML_NODES").unwrap_or(d.max_yaml_nodes),
        }
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".deckhand");
        p.push("deckhand.db");
        return p.to_string_lossy().to_string();
    }
    "deckhand.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::default();
        assert_eq!(c.fanout, 8);
        assert_eq!(c.delete_poll, Duration::from_millis(100));
        assert!(c.db_path.ends_with("deckhand.db"));
    }
}
