//! Bridge process configuration.
//!
//! One TOML file per dispatcher process names the transport to open, the
//! protocol family spoken on it, and the two bus channel addresses:
//!
//! ```toml
//! [bridge]
//! name = "ccu"
//! family = "control"
//!
//! [bridge.transport]
//! kind = "serial"
//! device = "/dev/ccser0"
//! baud = 57600
//!
//! [bridge.channels]
//! command = "127.0.0.1:9100"
//! telemetry = "127.0.0.1:9101"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::ProtocolFamily;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// Subsystem name; also the topic prefix on the bus channels.
    pub name: String,
    pub family: ProtocolFamily,
    pub transport: TransportConfig,
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Stream socket; OBIS connects to us. One connection at a time.
    Tcp { bind: SocketAddr },
    /// Datagram socket; every datagram is one frame.
    Udp { bind: SocketAddr },
    /// Serial byte-stream device node, provisioned externally.
    Serial { device: PathBuf, baud: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Where scenario processes deliver commands (we bind, they connect).
    pub command: SocketAddr,
    /// Where consumers pick up telemetry (we bind, they connect).
    pub telemetry: SocketAddr,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let bridge = &self.bridge;
        if bridge.name.is_empty() {
            return Err(ConfigError::Invalid("bridge name must not be empty".into()));
        }
        if bridge.channels.command == bridge.channels.telemetry {
            return Err(ConfigError::Invalid(
                "command and telemetry channels must be distinct sockets".into(),
            ));
        }
        if let TransportConfig::Serial { baud, .. } = &bridge.transport {
            if *baud == 0 {
                return Err(ConfigError::Invalid("serial baud rate must be non-zero".into()));
            }
        }
        Ok(())
    }

    /// Topic commands arrive under on the command channel.
    pub fn command_topic(&self) -> String {
        format!("{}/cmd", self.bridge.name)
    }

    /// Topic telemetry is published under.
    pub fn telemetry_topic(&self) -> String {
        format!("{}/tlm", self.bridge.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: &str = r#"
        [bridge]
        name = "ccu"
        family = "control"

        [bridge.transport]
        kind = "serial"
        device = "/dev/ccser0"
        baud = 57600

        [bridge.channels]
        command = "127.0.0.1:9100"
        telemetry = "127.0.0.1:9101"
    "#;

    #[test]
    fn parses_serial_bridge() {
        let config = BridgeConfig::parse(SERIAL).unwrap();
        assert_eq!(config.bridge.name, "ccu");
        assert_eq!(config.bridge.family, ProtocolFamily::Control);
        assert!(matches!(
            config.bridge.transport,
            TransportConfig::Serial { baud: 57_600, .. }
        ));
        assert_eq!(config.command_topic(), "ccu/cmd");
        assert_eq!(config.telemetry_topic(), "ccu/tlm");
    }

    #[test]
    fn parses_tcp_bridge() {
        let text = r#"
            [bridge]
            name = "piaes"
            family = "telegram"

            [bridge.transport]
            kind = "tcp"
            bind = "192.168.6.10:3020"

            [bridge.channels]
            command = "127.0.0.1:9001"
            telemetry = "127.0.0.1:9002"
        "#;
        let config = BridgeConfig::parse(text).unwrap();
        assert_eq!(config.bridge.family, ProtocolFamily::Telegram);
        assert!(matches!(config.bridge.transport, TransportConfig::Tcp { .. }));
    }

    #[test]
    fn rejects_clashing_channels() {
        let text = SERIAL.replace("127.0.0.1:9101", "127.0.0.1:9100");
        assert!(matches!(
            BridgeConfig::parse(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_baud() {
        let text = SERIAL.replace("baud = 57600", "baud = 0");
        assert!(matches!(
            BridgeConfig::parse(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_unknown_transport_kind() {
        let text = SERIAL.replace("kind = \"serial\"", "kind = \"pigeon\"");
        assert!(matches!(BridgeConfig::parse(&text), Err(ConfigError::Parse(_))));
    }
}
