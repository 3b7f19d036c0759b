//! Validated runtime configuration.
//!
//! Values arrive from the CLI already parsed; this module only checks them and
//! fills in the protocol defaults.

use std::time::Duration;

use crate::error::ConfigError;

/// Hosted chat service the adapter logs into.
pub const DEFAULT_CHAT_HOST: &str = "chat.hipchat.com";

/// Client-to-server XMPP port. The service only listens here (STARTTLS).
pub const DEFAULT_CHAT_PORT: u16 = 5222;

pub const DEFAULT_RESOURCE: &str = "bot";

/// Fixed back-off between connection attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Interval between whitespace keepalives on an idle stream.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// TCP connection timeout for the chat service.
///
/// Without it the OS default applies, which can leave an attempt hanging for
/// minutes before the retry loop gets a chance to run.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Chat service account and connection settings.
#[derive(Debug, Clone)]
pub struct XmppConfig {
    pub username: String,
    pub password: String,
    /// Display name used as the MUC nick.
    pub nick: String,
    pub resource: String,
    pub host: String,
    pub port: u16,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    /// Skip certificate verification (development servers only).
    pub insecure_tls: bool,
}

impl XmppConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        nick: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            username: username.into(),
            password: password.into(),
            nick: nick.into(),
            resource: DEFAULT_RESOURCE.to_string(),
            host: DEFAULT_CHAT_HOST.to_string(),
            port: DEFAULT_CHAT_PORT,
            retry_delay: RETRY_DELAY,
            connect_timeout: TCP_CONNECT_TIMEOUT,
            insecure_tls: false,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("password"));
        }
        if self.nick.trim().is_empty() {
            return Err(ConfigError::Missing("nick"));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing("chat host"));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                name: "chat port",
                reason: "port 0 is not connectable".to_string(),
            });
        }
        if self.username.contains('@') {
            return Err(ConfigError::Invalid {
                name: "username",
                reason: "expected the bare user name, without a domain".to_string(),
            });
        }
        Ok(())
    }

    /// Identity announced in the stream header `from` attribute.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Connection settings for the bot bus server.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    /// Source id this adapter announces on the bus.
    pub source_id: String,
}

impl BusConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        source_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            host: host.into(),
            port,
            source_id: source_id.into(),
        };
        if config.host.trim().is_empty() {
            return Err(ConfigError::Missing("bus server"));
        }
        if config.source_id.trim().is_empty() {
            return Err(ConfigError::Missing("source id"));
        }
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything the adapter core needs to start.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub xmpp: XmppConfig,
    pub bus: BusConfig,
    pub keepalive_interval: Duration,
}

impl AdapterConfig {
    pub fn new(xmpp: XmppConfig, bus: BusConfig) -> Self {
        Self {
            xmpp,
            bus,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}
