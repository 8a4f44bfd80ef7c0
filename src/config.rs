//! Service configuration. Every field has a default, so an empty JSON object is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ExponentialBackoffReconnect, RealtimeError, RealtimeResult, WebSocketBufferConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeConfig {
    pub channel: ChannelConfig,
    pub polling: PollingConfig,
    pub alerts: AlertConfig,
    pub chat: ChatConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub socket_url: String,
    pub auth_timeout_ms: u64,
    pub backoff: BackoffConfig,
    pub max_message_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:5000/socket".into(),
            auth_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
            max_message_bytes: WebSocketBufferConfig::default().max_message_bytes,
        }
    }
}

impl ChannelConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn buffers(&self) -> WebSocketBufferConfig {
        WebSocketBufferConfig {
            max_message_bytes: self.max_message_bytes,
            max_frame_bytes: self.max_message_bytes,
            ..WebSocketBufferConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn strategy(&self) -> ExponentialBackoffReconnect {
        ExponentialBackoffReconnect::new(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
            self.factor,
        )
        .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub page_size: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            page_size: 20,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub stagger_ms: u64,
    pub display_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 500,
            display_ms: 5_000,
        }
    }
}

impl AlertConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn display_time(&self) -> Duration {
        Duration::from_millis(self.display_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub poll_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

impl ChatConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api/".into(),
            timeout_ms: 15_000,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RealtimeConfig {
    pub fn from_json_str(json: &str) -> RealtimeResult<Self> {
        let config: Self =
            sonic_rs::from_str(json).map_err(|e| RealtimeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RealtimeResult<()> {
        let zero = [
            ("channel.auth_timeout_ms", self.channel.auth_timeout_ms),
            ("channel.backoff.base_ms", self.channel.backoff.base_ms),
            ("polling.interval_ms", self.polling.interval_ms),
            ("polling.page_size", u64::from(self.polling.page_size)),
            ("alerts.display_ms", self.alerts.display_ms),
            ("chat.poll_interval_ms", self.chat.poll_interval_ms),
            ("api.timeout_ms", self.api.timeout_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((field, _)) = zero {
            return Err(RealtimeError::InvalidConfig(format!("{field} must be positive")));
        }

        let backoff = &self.channel.backoff;
        if backoff.max_ms < backoff.base_ms {
            return Err(RealtimeError::InvalidConfig(format!(
                "channel.backoff.max_ms ({}) is below base_ms ({})",
                backoff.max_ms, backoff.base_ms
            )));
        }
        if !(backoff.factor.is_finite() && backoff.factor > 1.0) {
            return Err(RealtimeError::InvalidConfig(
                "channel.backoff.factor must be greater than 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&backoff.jitter) {
            return Err(RealtimeError::InvalidConfig(
                "channel.backoff.jitter must be in [0, 1)".into(),
            ));
        }
        if self.channel.socket_url.is_empty() || self.api.base_url.is_empty() {
            return Err(RealtimeError::InvalidConfig("endpoint urls must be set".into()));
        }
        Ok(())
    }
}
