// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Loaded from TOML (or JSON when the file ends in `.json`), validated
//! before use, and split into per-channel settings by the engine.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{ChannelConfig, MAX_PACKET_SIZE};
use crate::handler::HandlerConfig;
use crate::transport::{LinkKind, TransportAddress};
use crate::types::PeerId;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Host/IP both discovery sockets bind to.
    #[serde(default = "default_host")]
    pub advertising_host: String,

    #[serde(default = "default_robot_port")]
    pub robot_advertising_port: u16,

    #[serde(default = "default_ui_port")]
    pub ui_advertising_port: u16,

    /// Reliable-accept listener for robots.
    #[serde(default)]
    pub robot_listen_port: Option<u16>,

    /// Reliable-accept listener for UI devices.
    #[serde(default)]
    pub ui_listen_port: Option<u16>,

    #[serde(default)]
    pub robot_link: LinkKind,

    #[serde(default)]
    pub ui_link: LinkKind,

    #[serde(default = "default_one")]
    pub min_ui_devices: usize,

    #[serde(default = "default_one")]
    pub min_robots: usize,

    /// Robot silence timeout.
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,

    /// UI silence timeout; 0 disables it.
    #[serde(default = "default_ui_disconnect_timeout")]
    pub ui_disconnect_timeout_ms: u64,

    /// Keepalive ping period towards UI peers; 0 disables it.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_staleness")]
    pub advertisement_staleness_ms: u64,

    #[serde(default = "default_tick_period")]
    pub tick_period_ms: u64,

    /// Tolerance added to one tick period before a tick counts as late.
    /// With 0 any gap longer than the period is reported.
    #[serde(default)]
    pub late_tick_slack_ms: u64,

    #[serde(default = "default_announce_interval")]
    pub announce_interval_updates: u32,

    /// `host:port` receiving this station's presence announcements.
    #[serde(default)]
    pub announce_to: Option<String>,

    #[serde(default)]
    pub local_peer_id: PeerId,

    /// UI peer accepted automatically while waiting for UI devices.
    #[serde(default)]
    pub local_ui_peer_id: Option<PeerId>,

    /// Accept every advertising robot while waiting for robots.
    #[serde(default)]
    pub auto_connect_robots: bool,

    #[serde(default)]
    pub strict_size_check: bool,

    #[serde(default)]
    pub send_budget_bytes_per_tick: Option<usize>,

    /// Outbound connects still pending after this long are abandoned.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Unwritten bytes a peer link may hold before the peer is evicted.
    #[serde(default = "default_send_backlog")]
    pub send_backlog_bytes: usize,

    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_robot_port() -> u16 {
    5100
}

fn default_ui_port() -> u16 {
    5103
}

fn default_one() -> usize {
    1
}

fn default_disconnect_timeout() -> u64 {
    3000
}

fn default_ui_disconnect_timeout() -> u64 {
    5000
}

fn default_ping_interval() -> u64 {
    1000
}

fn default_staleness() -> u64 {
    2000
}

fn default_tick_period() -> u64 {
    33
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_send_backlog() -> usize {
    64 * 1024
}

fn default_announce_interval() -> u32 {
    10
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            advertising_host: default_host(),
            robot_advertising_port: default_robot_port(),
            ui_advertising_port: default_ui_port(),
            robot_listen_port: None,
            ui_listen_port: None,
            robot_link: LinkKind::default(),
            ui_link: LinkKind::default(),
            min_ui_devices: 1,
            min_robots: 1,
            disconnect_timeout_ms: default_disconnect_timeout(),
            ui_disconnect_timeout_ms: default_ui_disconnect_timeout(),
            ping_interval_ms: default_ping_interval(),
            advertisement_staleness_ms: default_staleness(),
            tick_period_ms: default_tick_period(),
            late_tick_slack_ms: 0,
            announce_interval_updates: default_announce_interval(),
            announce_to: None,
            local_peer_id: 0,
            local_ui_peer_id: None,
            auto_connect_robots: false,
            strict_size_check: false,
            send_budget_bytes_per_tick: None,
            connect_timeout_ms: default_connect_timeout(),
            send_backlog_bytes: default_send_backlog(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration file. `.json` files are parsed as JSON,
    /// everything else as TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration, JSON or TOML by extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = if path.extension().is_some_and(|e| e == "json") {
            serde_json::to_string_pretty(self)?
        } else {
            self.to_toml_string()?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.advertising_host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "advertising_host '{}' is not an IP address",
                self.advertising_host
            )));
        }

        let discovery = [self.robot_advertising_port, self.ui_advertising_port];
        if discovery.contains(&0) {
            return Err(ConfigError::Invalid(
                "advertising ports must be non-zero".into(),
            ));
        }
        if self.robot_advertising_port == self.ui_advertising_port {
            return Err(ConfigError::Invalid(format!(
                "robot and UI advertising ports are both {}",
                self.robot_advertising_port
            )));
        }

        let listen: Vec<u16> = [self.robot_listen_port, self.ui_listen_port]
            .into_iter()
            .flatten()
            .collect();
        for port in &listen {
            if *port == 0 {
                return Err(ConfigError::Invalid("listen ports must be non-zero".into()));
            }
            if discovery.contains(port) {
                return Err(ConfigError::Invalid(format!(
                    "listen port {} collides with an advertising port",
                    port
                )));
            }
        }
        if listen.len() == 2 && listen[0] == listen[1] {
            return Err(ConfigError::Invalid(format!(
                "robot and UI listen ports are both {}",
                listen[0]
            )));
        }

        for (name, value) in [
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("advertisement_staleness_ms", self.advertisement_staleness_ms),
            ("tick_period_ms", self.tick_period_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }

        if let Some(target) = &self.announce_to {
            TransportAddress::parse(target).map_err(|e| {
                ConfigError::Invalid(format!("announce_to '{}': {}", target, e))
            })?;
        }

        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        if self.send_backlog_bytes == 0 {
            return Err(ConfigError::Invalid("send_backlog_bytes must be > 0".into()));
        }
        if self.send_budget_bytes_per_tick == Some(0) {
            return Err(ConfigError::Invalid(
                "send_budget_bytes_per_tick must be > 0 when set".into(),
            ));
        }

        Ok(())
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// `None` when UI silence eviction is disabled.
    pub fn ui_disconnect_timeout(&self) -> Option<Duration> {
        (self.ui_disconnect_timeout_ms > 0).then(|| Duration::from_millis(self.ui_disconnect_timeout_ms))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.advertisement_staleness_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Tick gap beyond which a tick is reported late.
    pub fn late_tick_threshold(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms + self.late_tick_slack_ms)
    }

    fn channel_config(
        &self,
        name: &str,
        discovery_port: u16,
        listen_port: Option<u16>,
        link: LinkKind,
        local_peer_id: PeerId,
    ) -> ChannelConfig {
        ChannelConfig {
            listen_port,
            link,
            staleness: self.staleness(),
            local_peer_id,
            announce_to: self
                .announce_to
                .as_deref()
                .and_then(|t| TransportAddress::parse(t).ok()),
            announce_interval_updates: self.announce_interval_updates,
            send_budget_bytes: self.send_budget_bytes_per_tick,
            connect_timeout: self.connect_timeout(),
            max_send_backlog_bytes: self.send_backlog_bytes,
            ..ChannelConfig::new(name, self.advertising_host.clone(), discovery_port)
        }
    }

    pub fn robot_channel_config(&self) -> ChannelConfig {
        self.channel_config(
            "robots",
            self.robot_advertising_port,
            self.robot_listen_port,
            self.robot_link,
            self.local_peer_id,
        )
    }

    /// The UI side never announces: UI devices find the station through
    /// the robot-side announcement or a fixed address.
    pub fn ui_channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            announce_to: None,
            ..self.channel_config(
                "ui",
                self.ui_advertising_port,
                self.ui_listen_port,
                self.ui_link,
                self.local_peer_id,
            )
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            strict_size_check: self.strict_size_check,
            max_message_size: MAX_PACKET_SIZE,
        }
    }
}
