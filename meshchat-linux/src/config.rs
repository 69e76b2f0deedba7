//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use meshchat_core::AnnounceSchedule;
use rand::Rng;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/meshchat/config.toml or /etc/meshchat/config.toml,
/// or the path given with `--config`.
/// Env overrides: MESHCHAT_NICKNAME, MESHCHAT_LISTEN_PORT, MESHCHAT_DISCOVERY_PORT, MESHCHAT_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name carried in every message (default Anonymous####).
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// TCP port accepting links (default 45780).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Discovery UDP port (default 45781).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// LAN multicast discovery on/off.
    #[serde(default = "default_true")]
    pub discovery: bool,
    /// Endpoints (host:port) dialled at startup and redialled while unlinked.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default = "default_redial")]
    pub redial_interval_secs: u64,
    #[serde(default = "default_initial_delay")]
    pub announce_initial_delay_secs: u64,
    #[serde(default = "default_interval")]
    pub announce_interval_secs: u64,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_nickname() -> String {
    format!("Anonymous{}", rand::thread_rng().gen_range(1000..10000))
}
fn default_listen_port() -> u16 {
    45780
}
fn default_discovery_port() -> u16 {
    45781
}
fn default_true() -> bool {
    true
}
fn default_initial_delay() -> u64 {
    5
}
fn default_interval() -> u64 {
    30
}
fn default_redial() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            listen_port: default_listen_port(),
            discovery_port: default_discovery_port(),
            discovery: default_true(),
            peers: Vec::new(),
            redial_interval_secs: default_redial(),
            announce_initial_delay_secs: default_initial_delay(),
            announce_interval_secs: default_interval(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn schedule(&self) -> AnnounceSchedule {
        AnnounceSchedule::new(
            Duration::from_secs(self.announce_initial_delay_secs),
            Duration::from_secs(self.announce_interval_secs),
        )
    }

    pub fn redial_interval(&self) -> Duration {
        Duration::from_secs(self.redial_interval_secs.max(1))
    }

    /// The nickname travels in a one-byte-prefixed field.
    fn validate(&self) -> anyhow::Result<()> {
        if self.nickname.is_empty() || self.nickname.len() > u8::MAX as usize {
            anyhow::bail!(
                "nickname must be 1 to {} bytes, got {}",
                u8::MAX,
                self.nickname.len()
            );
        }
        Ok(())
    }

    /// Apply env overrides. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("MESHCHAT_NICKNAME").filter(|s| !s.trim().is_empty()) {
            self.nickname = s.trim().to_string();
        }
        if let Some(p) = var("MESHCHAT_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.listen_port = p;
        }
        if let Some(p) = var("MESHCHAT_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.discovery_port = p;
        }
        if let Some(s) = var("MESHCHAT_LOG") {
            self.log_level = s;
        }
    }
}

/// Load config: explicit path (must exist and parse), else the first default
/// path that exists, else defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshchat/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gets_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert!(c.nickname.starts_with("Anonymous"));
        assert_eq!(c.nickname.len(), "Anonymous".len() + 4);
        assert_eq!(c.listen_port, 45780);
        assert!(c.discovery);
        assert_eq!(c.schedule(), AnnounceSchedule::default());
        assert_eq!(c.redial_interval(), Duration::from_secs(10));
    }

    #[test]
    fn nickname_must_fit_sender_field() {
        let mut c = Config::default();
        assert!(c.validate().is_ok());
        c.nickname = "n".repeat(256);
        assert!(c.validate().is_err());
        c.nickname.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn file_values() {
        let c: Config = toml::from_str(
            r#"
            nickname = "alice"
            listen_port = 9000
            discovery = false
            peers = ["10.0.0.2:9000"]
            announce_interval_secs = 10
            redial_interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.nickname, "alice");
        assert_eq!(c.listen_port, 9000);
        assert!(!c.discovery);
        assert_eq!(c.peers, vec!["10.0.0.2:9000".to_string()]);
        assert_eq!(c.schedule().period, Duration::from_secs(10));
        assert_eq!(c.redial_interval(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "MESHCHAT_NICKNAME" => Some(" bob ".into()),
            "MESHCHAT_LISTEN_PORT" => Some("not a port".into()),
            "MESHCHAT_DISCOVERY_PORT" => Some("5000".into()),
            _ => None,
        });
        assert_eq!(c.nickname, "bob");
        assert_eq!(c.listen_port, 45780);
        assert_eq!(c.discovery_port, 5000);
        assert_eq!(c.log_level, "info");
    }
}
