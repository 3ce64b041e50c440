//! Client configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dashcore::{Network, ScriptBuf};

/// Configuration for the SPV tracking client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Network to operate on.
    pub network: Network,

    /// The single peer to connect to.
    pub peer_address: SocketAddr,

    /// Scripts to watch from startup. More can be added at runtime.
    pub watch_scripts: Vec<ScriptBuf>,

    /// Target false-positive rate for the bloom filter.
    pub false_positive_rate: f64,

    /// Minimum interval between periodic filter reinstalls. A filter made
    /// stale by new watch scripts is reinstalled sooner.
    pub filter_refresh_interval: Duration,

    /// Misbehavior score at which the peer is disconnected.
    pub misbehavior_threshold: u32,

    /// Interval over which the misbehavior score halves.
    pub misbehavior_decay_interval: Duration,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Maximum silence from the peer before the session gives up.
    pub message_timeout: Duration,

    /// Initial reconnect delay; doubles per consecutive failure.
    pub reconnect_base_delay: Duration,

    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,

    /// Give up after this many consecutive failed sessions. `None` retries
    /// forever.
    pub max_reconnect_attempts: Option<u32>,

    /// Directory for chain, cursor, and watch-list persistence. `None`
    /// disables persistence.
    pub data_dir: Option<PathBuf>,

    /// User agent advertised in the version handshake.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: Network::Dash,
            peer_address: "127.0.0.1:9999".parse().expect("static address parses"),
            watch_scripts: Vec::new(),
            false_positive_rate: 0.0005,
            filter_refresh_interval: Duration::from_secs(600),
            misbehavior_threshold: 100,
            misbehavior_decay_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(120),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: None,
            data_dir: None,
            user_agent: format!("/spv-tracker:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Config for the given network with defaults for everything else.
    pub fn new(network: Network, peer_address: SocketAddr) -> Self {
        Self {
            network,
            peer_address,
            ..Default::default()
        }
    }

    pub fn with_watch_scripts(mut self, scripts: Vec<ScriptBuf>) -> Self {
        self.watch_scripts = scripts;
        self
    }

    pub fn with_false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn with_misbehavior_threshold(mut self, threshold: u32) -> Self {
        self.misbehavior_threshold = threshold;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(format!(
                "false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            ));
        }
        if self.misbehavior_threshold == 0 {
            return Err("misbehavior_threshold must be positive".to_string());
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err("reconnect_base_delay exceeds reconnect_max_delay".to_string());
        }
        if self.message_timeout.is_zero() {
            return Err("message_timeout must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_false_positive_rate() {
        let mut config = ClientConfig::default();
        config.false_positive_rate = 0.0;
        assert!(config.validate().is_err());
        config.false_positive_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut config = ClientConfig::default();
        config.reconnect_base_delay = Duration::from_secs(120);
        config.reconnect_max_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
