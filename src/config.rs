//! Broker configuration.
//!
//! All structures deserialize with serde (kebab-case keys); loading them
//! from a file or any other source is the embedding application's concern.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::MAX_PACKET_SIZE;

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BrokerConfig {
    /// Named listeners; at least one is required to serve.
    #[serde(default)]
    pub listeners: HashMap<String, ListenerConfig>,

    /// Maximum accepted packet size in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Per-session outbound delivery queue depth. QoS 0 messages are
    /// dropped (and counted) when the queue is full; QoS > 0 deliveries
    /// apply backpressure instead.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Per-session offline queue depth for detached persistent sessions.
    /// Oldest messages are dropped on overflow.
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,

    /// Seconds a new connection may take to send CONNECT.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Grace period in seconds for writer queues to drain on shutdown.
    #[serde(default = "default_timeout_disconnect_delay")]
    pub timeout_disconnect_delay: u64,

    /// Per-call timeout in milliseconds for plugin filter votes; a
    /// timeout counts as deny.
    #[serde(default = "default_plugin_call_timeout_ms")]
    pub plugin_call_timeout_ms: u64,

    /// Publish cadence in seconds for `$SYS/broker/...` metrics;
    /// 0 disables the `$SYS` tree.
    #[serde(default)]
    pub sys_interval: u64,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Topic access control settings.
    #[serde(default)]
    pub topic_check: TopicCheckConfig,
}

impl BrokerConfig {
    /// Create a config with a single plain TCP listener.
    pub fn new(bind: impl Into<String>) -> Self {
        let mut listeners = HashMap::new();
        listeners.insert("default".to_string(), ListenerConfig::tcp(bind));
        Self {
            listeners,
            ..Self::empty()
        }
    }

    /// Create a config with no listeners.
    pub fn empty() -> Self {
        Self {
            listeners: HashMap::new(),
            max_packet_size: default_max_packet_size(),
            outbound_queue: default_outbound_queue(),
            max_queued_messages: default_max_queued_messages(),
            connect_timeout: default_connect_timeout(),
            timeout_disconnect_delay: default_timeout_disconnect_delay(),
            plugin_call_timeout_ms: default_plugin_call_timeout_ms(),
            sys_interval: 0,
            auth: AuthConfig::default(),
            topic_check: TopicCheckConfig::default(),
        }
    }

    /// Add a named listener.
    pub fn with_listener(mut self, name: impl Into<String>, listener: ListenerConfig) -> Self {
        self.listeners.insert(name.into(), listener);
        self
    }

    /// Set the `$SYS` publish interval in seconds (0 disables).
    pub fn with_sys_interval(mut self, seconds: u64) -> Self {
        self.sys_interval = seconds;
        self
    }

    /// Set authentication settings.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Set topic access control settings.
    pub fn with_topic_check(mut self, topic_check: TopicCheckConfig) -> Self {
        self.topic_check = topic_check;
        self
    }

    /// Set the maximum packet size.
    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes;
        self
    }

    /// Set the offline queue depth.
    pub fn with_max_queued_messages(mut self, depth: usize) -> Self {
        self.max_queued_messages = depth;
        self
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timeout_disconnect_delay)
    }

    pub(crate) fn plugin_call_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_call_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// Listener transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    /// Raw MQTT framing over TCP.
    #[default]
    Tcp,
    /// MQTT inside WebSocket binary messages (subprotocol `mqtt`).
    Ws,
}

/// A single listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListenerConfig {
    /// `tcp` or `ws`; TLS is controlled by [`ListenerConfig::ssl`].
    #[serde(rename = "type", default)]
    pub kind: ListenerKind,

    /// Bind address, `host:port`.
    pub bind: String,

    /// Per-listener connection cap; 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,

    /// TLS material; presence turns the listener into TLS.
    #[serde(default)]
    pub ssl: Option<TlsFiles>,
}

impl ListenerConfig {
    /// Plain TCP listener.
    pub fn tcp(bind: impl Into<String>) -> Self {
        Self {
            kind: ListenerKind::Tcp,
            bind: bind.into(),
            max_connections: 0,
            ssl: None,
        }
    }

    /// WebSocket listener.
    pub fn ws(bind: impl Into<String>) -> Self {
        Self {
            kind: ListenerKind::Ws,
            bind: bind.into(),
            max_connections: 0,
            ssl: None,
        }
    }

    /// Enable TLS with the given certificate and key PEM files.
    pub fn with_tls(mut self, certfile: impl Into<PathBuf>, keyfile: impl Into<PathBuf>) -> Self {
        self.ssl = Some(TlsFiles {
            certfile: certfile.into(),
            keyfile: keyfile.into(),
            cafile: None,
        });
        self
    }

    /// Set the per-listener connection cap (0 = unlimited).
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// PEM file paths for a TLS listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TlsFiles {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    /// When set, client certificates are required and verified against it.
    #[serde(default)]
    pub cafile: Option<PathBuf>,
}

/// Authentication settings consumed by the packaged auth plugin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AuthConfig {
    /// Accept connections without credentials.
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,

    /// Static `username -> password` table.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: HashMap::new(),
        }
    }
}

/// Topic access control settings consumed by the packaged ACL plugin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TopicCheckConfig {
    /// Master switch; when false no topic filtering happens.
    #[serde(default)]
    pub enabled: bool,

    /// Filters a client may publish to; `None` allows everything.
    #[serde(default)]
    pub allow_publish: Option<Vec<String>>,

    /// Filters a client may subscribe to; `None` allows everything.
    #[serde(default)]
    pub allow_subscribe: Option<Vec<String>>,

    /// Filters a client may receive from; `None` allows everything.
    #[serde(default)]
    pub allow_receive: Option<Vec<String>>,
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_max_queued_messages() -> usize {
    1000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_timeout_disconnect_delay() -> u64 {
    5
}

fn default_plugin_call_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::new("127.0.0.1:1883");
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners["default"].kind, ListenerKind::Tcp);
        assert!(config.auth.allow_anonymous);
        assert!(!config.topic_check.enabled);
        assert_eq!(config.sys_interval, 0);
    }

    #[test]
    fn test_deserialize_listeners() {
        let json = serde_json::json!({
            "listeners": {
                "plain": { "bind": "0.0.0.0:1883", "max-connections": 100 },
                "secure": {
                    "bind": "0.0.0.0:8883",
                    "ssl": { "certfile": "/etc/broker/cert.pem", "keyfile": "/etc/broker/key.pem" }
                },
                "websocket": { "type": "ws", "bind": "0.0.0.0:8080" }
            },
            "sys-interval": 20,
            "auth": { "allow-anonymous": false, "users": { "admin": "secret" } },
            "topic-check": { "enabled": true, "allow-publish": ["devices/#"] }
        });

        let config: BrokerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.listeners.len(), 3);
        assert_eq!(config.listeners["plain"].max_connections, 100);
        assert!(config.listeners["secure"].ssl.is_some());
        assert_eq!(config.listeners["websocket"].kind, ListenerKind::Ws);
        assert_eq!(config.sys_interval, 20);
        assert!(!config.auth.allow_anonymous);
        assert_eq!(config.auth.users["admin"], "secret");
        assert!(config.topic_check.enabled);
        assert_eq!(
            config.topic_check.allow_publish.as_deref(),
            Some(&["devices/#".to_string()][..])
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let json = serde_json::json!({ "no-such-key": true });
        assert!(serde_json::from_value::<BrokerConfig>(json).is_err());
    }
}
