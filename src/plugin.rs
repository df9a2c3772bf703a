//! Plugin and event bus.
//!
//! Two mechanisms, mirroring what the broker core consumes:
//!
//! - **Events** (fire and forget): lifecycle and traffic signals dispatched
//!   concurrently to every plugin. The broker awaits completion only for
//!   the pre/post lifecycle pairs.
//! - **Filters** (vote): `authenticate` and `check_topic` return
//!   `Some(bool)` to vote or `None` to abstain. Votes are collected
//!   concurrently, bounded by a per-call timeout (a timeout counts as
//!   deny), and combined with logical AND. An all-abstain authentication
//!   round falls back to the `allow-anonymous` setting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::{AuthConfig, TopicCheckConfig};
use crate::trie::topic_matches;

/// Named signals fired by the broker.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    BrokerPreStart,
    BrokerPostStart,
    BrokerPreShutdown,
    BrokerPostShutdown,
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
    MessageReceived { client_id: String, topic: String },
    MessageSent { client_id: String, topic: String },
}

impl BrokerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::BrokerPreStart => "broker_pre_start",
            BrokerEvent::BrokerPostStart => "broker_post_start",
            BrokerEvent::BrokerPreShutdown => "broker_pre_shutdown",
            BrokerEvent::BrokerPostShutdown => "broker_post_shutdown",
            BrokerEvent::ClientConnected { .. } => "client_connected",
            BrokerEvent::ClientDisconnected { .. } => "client_disconnected",
            BrokerEvent::MessageReceived { .. } => "message_received",
            BrokerEvent::MessageSent { .. } => "message_sent",
        }
    }
}

/// The action a topic filter vote applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAction {
    Publish,
    Subscribe,
    Receive,
}

/// Credentials presented at CONNECT time.
#[derive(Debug, Clone)]
pub struct AuthContext<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

/// A broker plugin: event sink plus filter votes.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin name, for logs.
    fn name(&self) -> &'static str;

    /// Receive a broker event.
    async fn on_event(&self, _event: &BrokerEvent) {}

    /// Vote on a connection attempt. `None` abstains.
    async fn authenticate(&self, _ctx: &AuthContext<'_>) -> Option<bool> {
        None
    }

    /// Vote on a topic action. `None` abstains.
    async fn check_topic(
        &self,
        _client_id: &str,
        _topic: &str,
        _action: TopicAction,
    ) -> Option<bool> {
        None
    }
}

/// Registry plus dispatcher for plugins.
pub struct PluginBus {
    plugins: Vec<Arc<dyn Plugin>>,
    call_timeout: Duration,
    allow_anonymous: bool,
}

impl PluginBus {
    pub fn new(call_timeout: Duration, allow_anonymous: bool) -> Self {
        Self {
            plugins: Vec::new(),
            call_timeout,
            allow_anonymous,
        }
    }

    /// Register a plugin. Registration order is preserved for logging only;
    /// dispatch is concurrent.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = plugin.name(), "registering plugin");
        self.plugins.push(plugin);
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Fire an event and wait for every plugin to process it. Used for
    /// the pre/post lifecycle pairs.
    pub async fn fire(&self, event: BrokerEvent) {
        join_all(self.plugins.iter().map(|p| p.on_event(&event))).await;
    }

    /// Fire an event without waiting for plugins.
    pub fn dispatch(&self, event: BrokerEvent) {
        if self.plugins.is_empty() {
            return;
        }
        let plugins = self.plugins.clone();
        tokio::spawn(async move {
            join_all(plugins.iter().map(|p| p.on_event(&event))).await;
        });
    }

    /// Collect authentication votes. AND of all cast votes; an all-abstain
    /// round falls back to `allow-anonymous`; a timed-out plugin denies.
    pub async fn authenticate(&self, ctx: &AuthContext<'_>) -> bool {
        let votes = join_all(
            self.plugins
                .iter()
                .map(|p| tokio::time::timeout(self.call_timeout, p.authenticate(ctx))),
        )
        .await;

        let mut voted = false;
        for (plugin, vote) in self.plugins.iter().zip(votes) {
            match vote {
                Err(_) => {
                    warn!(
                        plugin = plugin.name(),
                        client_id = ctx.client_id,
                        "authenticate vote timed out, denying"
                    );
                    return false;
                }
                Ok(Some(false)) => {
                    debug!(
                        plugin = plugin.name(),
                        client_id = ctx.client_id,
                        "authentication denied"
                    );
                    return false;
                }
                Ok(Some(true)) => voted = true,
                Ok(None) => {}
            }
        }

        if voted {
            true
        } else {
            self.allow_anonymous
        }
    }

    /// Collect topic-action votes. AND of all cast votes; an all-abstain
    /// round allows; a timed-out plugin denies.
    pub async fn check_topic(&self, client_id: &str, topic: &str, action: TopicAction) -> bool {
        let votes = join_all(
            self.plugins
                .iter()
                .map(|p| tokio::time::timeout(self.call_timeout, p.check_topic(client_id, topic, action))),
        )
        .await;

        for (plugin, vote) in self.plugins.iter().zip(votes) {
            match vote {
                Err(_) => {
                    warn!(
                        plugin = plugin.name(),
                        client_id,
                        topic,
                        "topic vote timed out, denying"
                    );
                    return false;
                }
                Ok(Some(false)) => {
                    debug!(plugin = plugin.name(), client_id, topic, ?action, "topic denied");
                    return false;
                }
                Ok(Some(true)) | Ok(None) => {}
            }
        }

        true
    }
}

/// In-memory username/password authentication.
pub struct StaticAuthPlugin {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl StaticAuthPlugin {
    pub fn new(auth: &AuthConfig) -> Self {
        Self {
            users: auth.users.clone(),
            allow_anonymous: auth.allow_anonymous,
        }
    }
}

#[async_trait]
impl Plugin for StaticAuthPlugin {
    fn name(&self) -> &'static str {
        "auth-static"
    }

    async fn authenticate(&self, ctx: &AuthContext<'_>) -> Option<bool> {
        match ctx.username {
            None => Some(self.allow_anonymous),
            Some(username) => match self.users.get(username) {
                Some(expected) => {
                    Some(ctx.password.is_some_and(|given| given == expected.as_bytes()))
                }
                None => Some(false),
            },
        }
    }
}

/// Filter-list topic access control.
pub struct TopicAclPlugin {
    allow_publish: Option<Vec<String>>,
    allow_subscribe: Option<Vec<String>>,
    allow_receive: Option<Vec<String>>,
}

impl TopicAclPlugin {
    pub fn new(config: &TopicCheckConfig) -> Self {
        Self {
            allow_publish: config.allow_publish.clone(),
            allow_subscribe: config.allow_subscribe.clone(),
            allow_receive: config.allow_receive.clone(),
        }
    }
}

#[async_trait]
impl Plugin for TopicAclPlugin {
    fn name(&self) -> &'static str {
        "topic-acl"
    }

    async fn check_topic(
        &self,
        _client_id: &str,
        topic: &str,
        action: TopicAction,
    ) -> Option<bool> {
        let allowed = match action {
            TopicAction::Publish => &self.allow_publish,
            TopicAction::Subscribe => &self.allow_subscribe,
            TopicAction::Receive => &self.allow_receive,
        };
        match allowed {
            None => Some(true),
            Some(filters) => Some(filters.iter().any(|f| topic_matches(f, topic))),
        }
    }
}

/// Logs every bus event through `tracing`.
#[derive(Default)]
pub struct EventLoggerPlugin;

#[async_trait]
impl Plugin for EventLoggerPlugin {
    fn name(&self) -> &'static str {
        "event-logger"
    }

    async fn on_event(&self, event: &BrokerEvent) {
        match event {
            BrokerEvent::ClientConnected { client_id } => {
                debug!(client_id, "client connected");
            }
            BrokerEvent::ClientDisconnected { client_id } => {
                debug!(client_id, "client disconnected");
            }
            BrokerEvent::MessageReceived { client_id, topic } => {
                debug!(client_id, topic, "message received");
            }
            BrokerEvent::MessageSent { client_id, topic } => {
                debug!(client_id, topic, "message sent");
            }
            other => debug!(event = other.name(), "broker event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with(plugins: Vec<Arc<dyn Plugin>>, allow_anonymous: bool) -> PluginBus {
        let mut bus = PluginBus::new(Duration::from_millis(100), allow_anonymous);
        for plugin in plugins {
            bus.register(plugin);
        }
        bus
    }

    #[tokio::test]
    async fn test_empty_bus_uses_anonymous_policy() {
        let ctx = AuthContext {
            client_id: "c1",
            username: None,
            password: None,
        };
        assert!(bus_with(vec![], true).authenticate(&ctx).await);
        assert!(!bus_with(vec![], false).authenticate(&ctx).await);
        assert!(
            bus_with(vec![], false)
                .check_topic("c1", "a/b", TopicAction::Publish)
                .await
        );
    }

    #[tokio::test]
    async fn test_static_auth() {
        let mut auth = AuthConfig {
            allow_anonymous: false,
            users: HashMap::new(),
        };
        auth.users.insert("admin".to_string(), "secret".to_string());
        let bus = bus_with(vec![Arc::new(StaticAuthPlugin::new(&auth))], false);

        let good = AuthContext {
            client_id: "c1",
            username: Some("admin"),
            password: Some(b"secret"),
        };
        assert!(bus.authenticate(&good).await);

        let bad = AuthContext {
            client_id: "c1",
            username: Some("admin"),
            password: Some(b"wrong"),
        };
        assert!(!bus.authenticate(&bad).await);

        let unknown = AuthContext {
            client_id: "c1",
            username: Some("nobody"),
            password: Some(b"x"),
        };
        assert!(!bus.authenticate(&unknown).await);

        let anonymous = AuthContext {
            client_id: "c1",
            username: None,
            password: None,
        };
        assert!(!bus.authenticate(&anonymous).await);
    }

    #[tokio::test]
    async fn test_votes_are_anded() {
        struct Allow;
        struct Deny;

        #[async_trait]
        impl Plugin for Allow {
            fn name(&self) -> &'static str {
                "allow"
            }
            async fn authenticate(&self, _: &AuthContext<'_>) -> Option<bool> {
                Some(true)
            }
        }

        #[async_trait]
        impl Plugin for Deny {
            fn name(&self) -> &'static str {
                "deny"
            }
            async fn authenticate(&self, _: &AuthContext<'_>) -> Option<bool> {
                Some(false)
            }
        }

        let ctx = AuthContext {
            client_id: "c1",
            username: None,
            password: None,
        };
        let bus = bus_with(vec![Arc::new(Allow), Arc::new(Deny)], true);
        assert!(!bus.authenticate(&ctx).await);

        let bus = bus_with(vec![Arc::new(Allow)], false);
        assert!(bus.authenticate(&ctx).await);
    }

    #[tokio::test]
    async fn test_slow_plugin_denies() {
        struct Slow;

        #[async_trait]
        impl Plugin for Slow {
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn authenticate(&self, _: &AuthContext<'_>) -> Option<bool> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Some(true)
            }
        }

        let ctx = AuthContext {
            client_id: "c1",
            username: None,
            password: None,
        };
        let bus = bus_with(vec![Arc::new(Slow)], true);
        assert!(!bus.authenticate(&ctx).await);
    }

    #[tokio::test]
    async fn test_topic_acl() {
        let config = TopicCheckConfig {
            enabled: true,
            allow_publish: Some(vec!["devices/#".to_string()]),
            allow_subscribe: None,
            allow_receive: None,
        };
        let bus = bus_with(vec![Arc::new(TopicAclPlugin::new(&config))], true);

        assert!(bus.check_topic("c1", "devices/d1/state", TopicAction::Publish).await);
        assert!(!bus.check_topic("c1", "admin/x", TopicAction::Publish).await);
        assert!(bus.check_topic("c1", "admin/x", TopicAction::Subscribe).await);
    }
}
