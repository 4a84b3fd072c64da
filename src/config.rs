//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::limiter::RatePolicy;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Enable Schnorr signature verification on publish.
    pub verify_sig: bool,
    /// Relay name advertised in the info document.
    pub relay_name: String,
    /// Relay description advertised in the info document.
    pub relay_description: String,
    /// Operator contact, if any.
    pub relay_contact: Option<String>,
    /// Operator pubkey, if any.
    pub relay_pubkey: Option<String>,
    /// Per-address publish budget, events per minute.
    pub events_per_minute: u64,
    /// Per-address query budget, REQs per minute.
    pub queries_per_minute: u64,
    /// Per-author publish budget, events per minute.
    pub author_events_per_minute: u64,
    /// Relay-wide ingest ceiling, events per second.
    pub global_events_per_second: u64,
    /// Per-connection message budget, frames per minute.
    pub conn_messages_per_minute: u64,
    /// Maximum concurrent connections per address.
    pub connections_per_addr: u32,
    /// Reject events older than now minus this many seconds.
    pub max_past_skew_secs: i64,
    /// Reject events dated further than this many seconds into the future.
    pub max_future_skew_secs: i64,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue_cap: usize,
    /// Seconds of inactivity before an unused rate bucket is swept.
    pub idle_bucket_secs: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let relay_name = env::var("RELAY_NAME").unwrap_or_else(|_| "rostr".into());
        let relay_description =
            env::var("RELAY_DESCRIPTION").unwrap_or_else(|_| "a small event relay".into());
        let relay_contact = env::var("RELAY_CONTACT").ok().filter(|s| !s.is_empty());
        let relay_pubkey = env::var("RELAY_PUBKEY").ok().filter(|s| !s.is_empty());
        Ok(Self {
            store_root,
            bind_http,
            bind_ws,
            verify_sig,
            relay_name,
            relay_description,
            relay_contact,
            relay_pubkey,
            events_per_minute: env_u64("EVENTS_PER_MINUTE", 60),
            queries_per_minute: env_u64("QUERIES_PER_MINUTE", 120),
            author_events_per_minute: env_u64("AUTHOR_EVENTS_PER_MINUTE", 60),
            global_events_per_second: env_u64("GLOBAL_EVENTS_PER_SECOND", 500),
            conn_messages_per_minute: env_u64("CONN_MESSAGES_PER_MINUTE", 240),
            connections_per_addr: env_u64("CONNECTIONS_PER_ADDR", 10) as u32,
            max_past_skew_secs: env_u64("MAX_PAST_SKEW_SECS", 60 * 60 * 24 * 30) as i64,
            max_future_skew_secs: env_u64("MAX_FUTURE_SKEW_SECS", 60 * 60 * 24) as i64,
            outbound_queue_cap: env_u64("OUTBOUND_QUEUE_CAP", 256) as usize,
            idle_bucket_secs: env_u64("IDLE_BUCKET_SECS", 300),
        })
    }

    /// Derive the limiter policy from the loaded settings.
    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            global_events_per_second: self.global_events_per_second as u32,
            events_per_minute: self.events_per_minute as u32,
            queries_per_minute: self.queries_per_minute as u32,
            author_events_per_minute: self.author_events_per_minute as u32,
            conn_messages_per_minute: self.conn_messages_per_minute as u32,
            connections_per_addr: self.connections_per_addr,
            idle_window: Duration::from_secs(self.idle_bucket_secs),
        }
    }
}

/// Read an integer variable, falling back to `default` when unset or invalid.
fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "STORE_ROOT",
        "BIND_HTTP",
        "BIND_WS",
        "VERIFY_SIG",
        "RELAY_NAME",
        "RELAY_DESCRIPTION",
        "RELAY_CONTACT",
        "RELAY_PUBKEY",
        "EVENTS_PER_MINUTE",
        "QUERIES_PER_MINUTE",
        "AUTHOR_EVENTS_PER_MINUTE",
        "GLOBAL_EVENTS_PER_SECOND",
        "CONN_MESSAGES_PER_MINUTE",
        "CONNECTIONS_PER_ADDR",
        "MAX_PAST_SKEW_SECS",
        "MAX_FUTURE_SKEW_SECS",
        "OUTBOUND_QUEUE_CAP",
        "IDLE_BUCKET_SECS",
    ];

    fn clear_vars() {
        for v in ALL_VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "VERIFY_SIG=1\n",
                "RELAY_NAME=test relay\n",
                "RELAY_CONTACT=ops@example.org\n",
                "EVENTS_PER_MINUTE=30\n",
                "QUERIES_PER_MINUTE=90\n",
                "CONNECTIONS_PER_ADDR=5\n",
                "OUTBOUND_QUEUE_CAP=64\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp"));
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.bind_ws, "127.0.0.1:8081");
        assert!(cfg.verify_sig);
        assert_eq!(cfg.relay_name, "test relay");
        assert_eq!(cfg.relay_contact.as_deref(), Some("ops@example.org"));
        assert!(cfg.relay_pubkey.is_none());
        assert_eq!(cfg.events_per_minute, 30);
        assert_eq!(cfg.queries_per_minute, 90);
        assert_eq!(cfg.connections_per_addr, 5);
        assert_eq!(cfg.outbound_queue_cap, 64);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(!cfg.verify_sig);
        assert_eq!(cfg.relay_name, "rostr");
        assert!(cfg.relay_contact.is_none());
        assert_eq!(cfg.events_per_minute, 60);
        assert_eq!(cfg.queries_per_minute, 120);
        assert_eq!(cfg.author_events_per_minute, 60);
        assert_eq!(cfg.global_events_per_second, 500);
        assert_eq!(cfg.conn_messages_per_minute, 240);
        assert_eq!(cfg.connections_per_addr, 10);
        assert_eq!(cfg.max_future_skew_secs, 86_400);
        assert_eq!(cfg.outbound_queue_cap, 256);
        assert_eq!(cfg.idle_bucket_secs, 300);
        let policy = cfg.rate_policy();
        assert_eq!(policy.events_per_minute, 60);
        assert_eq!(policy.idle_window, Duration::from_secs(300));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "EVENTS_PER_MINUTE=notanumber\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.events_per_minute, 60);
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!("BIND_HTTP=127.0.0.1:8080\n", "BIND_WS=127.0.0.1:8081\n"),
        )
        .unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }
}
