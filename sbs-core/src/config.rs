//! Configuration file management for sbs-tracker.
//!
//! Reads/writes `~/.sbs-tracker/config.yaml` with the feed address, HTTP
//! listener, database path and cache timing. Command-line flags override
//! whatever is loaded here.

use std::path::{Path, PathBuf};

use chrono::TimeDelta;

use crate::types::TrackerError;

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub feed: FeedConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// `host:port` of the BaseStation output (dump1090 port 30003).
    pub addr: String,
    /// Upper bound for the reconnect backoff.
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served for paths that are not API routes.
    pub web_root: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// How often idle aircraft are evicted.
    pub evict_interval_secs: u64,
    /// How long an aircraft may stay silent before eviction.
    pub evict_window_secs: u64,
    /// Capacity of the decoded report queue.
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            feed: FeedConfig {
                addr: "localhost:30003".into(),
                max_backoff_secs: 60,
            },
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8888,
                web_root: "www".into(),
            },
            database: DatabaseConfig {
                path: "data/sbs.db".into(),
            },
            cache: CacheConfig {
                evict_interval_secs: 60,
                evict_window_secs: 60,
                queue_capacity: 50,
            },
        }
    }
}

impl CacheConfig {
    /// Eviction window as a chrono duration.
    pub fn evict_window(&self) -> Result<TimeDelta, TrackerError> {
        i64::try_from(self.evict_window_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                TrackerError::Config(format!(
                    "evict_window_secs out of range: {}",
                    self.evict_window_secs
                ))
            })
    }
}

/// Get the config directory path.
pub fn config_dir() -> PathBuf {
    dirs_home().join(".sbs-tracker")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `path`, or `~/.sbs-tracker/config.yaml` when `None`.
///
/// Returns default config if the file doesn't exist or can't be read.
pub fn load_config(path: Option<&Path>) -> Config {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
    if !path.exists() {
        return Config::default();
    }

    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => return Config::default(),
    };

    parse_config(&text)
}

/// Save config to `path`, or `~/.sbs-tracker/config.yaml` when `None`.
pub fn save_config(config: &Config, path: Option<&Path>) -> Result<PathBuf, TrackerError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    std::fs::write(&path, serialize_config(config))?;

    Ok(path)
}

/// Parse simple YAML-like config text. Unknown keys are ignored.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = val.is_empty().then(|| key.to_string());
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };

        match (section, key) {
            ("feed", "addr") => set_string(&mut config.feed.addr, val),
            ("feed", "max_backoff_secs") => set_parsed(&mut config.feed.max_backoff_secs, val),
            ("server", "host") => set_string(&mut config.server.host, val),
            ("server", "port") => set_parsed(&mut config.server.port, val),
            ("server", "web_root") => set_string(&mut config.server.web_root, val),
            ("database", "path") => set_string(&mut config.database.path, val),
            ("cache", "evict_interval_secs") => {
                set_parsed(&mut config.cache.evict_interval_secs, val)
            }
            ("cache", "evict_window_secs") => set_parsed(&mut config.cache.evict_window_secs, val),
            ("cache", "queue_capacity") => set_parsed(&mut config.cache.queue_capacity, val),
            _ => {}
        }
    }

    config
}

fn set_string(slot: &mut String, val: &str) {
    if let Some(v) = parse_string_value(val) {
        *slot = v;
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, val: &str) {
    if let Ok(v) = val.parse() {
        *slot = v;
    }
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let lines = [
        "# sbs-tracker configuration".to_string(),
        String::new(),
        "feed:".into(),
        format!("  addr: \"{}\"", config.feed.addr),
        format!("  max_backoff_secs: {}", config.feed.max_backoff_secs),
        String::new(),
        "server:".into(),
        format!("  host: \"{}\"", config.server.host),
        format!("  port: {}", config.server.port),
        format!("  web_root: \"{}\"", config.server.web_root),
        String::new(),
        "database:".into(),
        format!("  path: \"{}\"", config.database.path),
        String::new(),
        "cache:".into(),
        format!("  evict_interval_secs: {}", config.cache.evict_interval_secs),
        format!("  evict_window_secs: {}", config.cache.evict_window_secs),
        format!("  queue_capacity: {}", config.cache.queue_capacity),
    ];

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.feed.addr, "localhost:30003");
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.cache.evict_interval_secs, 60);
        assert_eq!(config.cache.queue_capacity, 50);
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
feed:
  addr: "192.168.2.19:30003"
  max_backoff_secs: 30

server:
  host: "127.0.0.1"
  port: 9090
  web_root: '/srv/www'

database:
  path: "/tmp/test.db"

cache:
  evict_interval_secs: 5
  evict_window_secs: 120
  queue_capacity: 256
"#;
        let config = parse_config(text);
        assert_eq!(config.feed.addr, "192.168.2.19:30003");
        assert_eq!(config.feed.max_backoff_secs, 30);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.web_root, "/srv/www");
        assert_eq!(config.database.path, "/tmp/test.db");
        assert_eq!(config.cache.evict_interval_secs, 5);
        assert_eq!(config.cache.evict_window_secs, 120);
        assert_eq!(config.cache.queue_capacity, 256);
    }

    #[test]
    fn test_parse_config_bad_values_keep_defaults() {
        let text = r#"
server:
  port: not-a-port
database:
  path: null
unknown:
  key: 1
"#;
        let config = parse_config(text);
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.database.path, "data/sbs.db");
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.feed.addr = "radar:30003".into();
        config.cache.evict_window_secs = 300;
        let parsed = parse_config(&serialize_config(&config));
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = Config::default();
        config.server.port = 9999;

        let written = save_config(&config, Some(&path)).unwrap();
        assert_eq!(written, path);
        assert_eq!(load_config(Some(&path)).server.port, 9999);
    }

    #[test]
    fn test_save_into_file_parent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let err = save_config(&Config::default(), Some(&blocker.join("config.yaml"))).unwrap_err();
        assert!(matches!(err, TrackerError::Io(_)));
    }

    #[test]
    fn test_evict_window_range() {
        let mut cache = Config::default().cache;
        assert_eq!(cache.evict_window().unwrap(), TimeDelta::seconds(60));

        cache.evict_window_secs = u64::MAX;
        assert!(matches!(cache.evict_window(), Err(TrackerError::Config(_))));
        cache.evict_window_secs = i64::MAX as u64;
        assert!(cache.evict_window().is_err());
    }

    #[test]
    fn test_missing_file_gives_default() {
        let config = load_config(Some(Path::new("/nonexistent/sbs/config.yaml")));
        assert_eq!(config, Config::default());
    }
}
