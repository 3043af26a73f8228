//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::tagging::DEFAULT_SCOPE;

pub const DEFAULT_BIND_HTTP: &str = "127.0.0.1:4000";
pub const DEFAULT_RELAY: &str = "wss://relay.damus.io";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:4000/api";
pub const DEFAULT_SESSION_DIR: &str = ".blueorb";

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address of the community API.
    pub bind_http: String,
    /// Relays every publish and query fans out to.
    pub relays: Vec<String>,
    /// Community scope marker carried as a `t` tag.
    pub community_tag: String,
    /// How long a publish waits for the first relay acknowledgement.
    pub publish_timeout: Duration,
    /// Deadline for listing queries.
    pub query_timeout: Duration,
    /// Feed refresh period.
    pub poll_interval: Duration,
    /// Base URL the CLI talks to.
    pub api_url: String,
    /// Directory holding the local session (keys, profile, watermark).
    pub session_dir: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bind_http = var_or("BIND_HTTP", DEFAULT_BIND_HTTP);
        let mut relays = csv_strings(env::var("NOSTR_RELAY").unwrap_or_default());
        if relays.is_empty() {
            relays.push(DEFAULT_RELAY.to_string());
        }
        let community_tag = var_or("COMMUNITY_TAG", DEFAULT_SCOPE);
        let publish_timeout = Duration::from_millis(number("PUBLISH_TIMEOUT_MS", 3000)?);
        let query_timeout = Duration::from_millis(number("QUERY_TIMEOUT_MS", 3000)?);
        let poll_interval = Duration::from_secs(number("POLL_INTERVAL_SECS", 8)?.max(1));
        let api_url = var_or("API_URL", DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();
        let session_dir = PathBuf::from(var_or("SESSION_DIR", DEFAULT_SESSION_DIR));
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        Ok(Self {
            bind_http,
            relays,
            community_tag,
            publish_timeout,
            query_timeout,
            poll_interval,
            api_url,
            session_dir,
            tor_socks,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn number(key: &str, default: u64) -> Result<u64> {
    match env::var(key).ok().filter(|v| !v.trim().is_empty()) {
        Some(v) => v.trim().parse().with_context(|| format!("parsing {key}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};
    use tempfile::tempdir;

    const VARS: [&str; 9] = [
        "BIND_HTTP",
        "NOSTR_RELAY",
        "COMMUNITY_TAG",
        "PUBLISH_TIMEOUT_MS",
        "QUERY_TIMEOUT_MS",
        "POLL_INTERVAL_SECS",
        "API_URL",
        "SESSION_DIR",
        "TOR_SOCKS",
    ];

    fn clear_vars() {
        for v in VARS.iter() {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "BIND_HTTP=127.0.0.1:8080\n",
                "NOSTR_RELAY=\"wss://r1, wss://r2\"\n",
                "COMMUNITY_TAG=school42\n",
                "PUBLISH_TIMEOUT_MS=1500\n",
                "QUERY_TIMEOUT_MS=2000\n",
                "POLL_INTERVAL_SECS=30\n",
                "API_URL=http://example.test/api/\n",
                "SESSION_DIR=/tmp/orb\n",
                "TOR_SOCKS=127.0.0.1:9050\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.relays, vec!["wss://r1", "wss://r2"]);
        assert_eq!(cfg.community_tag, "school42");
        assert_eq!(cfg.publish_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.query_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.api_url, "http://example.test/api");
        assert_eq!(cfg.session_dir, PathBuf::from("/tmp/orb"));
        assert_eq!(cfg.tor_socks, Some("127.0.0.1:9050".into()));
        clear_vars();
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "NOSTR_RELAY=\nTOR_SOCKS=\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.bind_http, DEFAULT_BIND_HTTP);
        assert_eq!(cfg.relays, vec![DEFAULT_RELAY]);
        assert_eq!(cfg.community_tag, "blueorb");
        assert_eq!(cfg.publish_timeout, Duration::from_secs(3));
        assert_eq!(cfg.query_timeout, Duration::from_secs(3));
        assert_eq!(cfg.poll_interval, Duration::from_secs(8));
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.session_dir, PathBuf::from(DEFAULT_SESSION_DIR));
        assert!(cfg.tor_socks.is_none());
    }

    #[test]
    fn malformed_numbers_error() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "QUERY_TIMEOUT_MS=soon\n").unwrap();
        let err = Settings::from_env(env_path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("QUERY_TIMEOUT_MS"));
        clear_vars();
    }

    #[test]
    fn missing_file_errors() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join("absent.env");
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }
}
