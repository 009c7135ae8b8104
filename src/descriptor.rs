// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Textual identity of a channel: the document a server endpoint publishes
// and an accessor parses to find the OS objects of the two rings. Also the
// optional endpoint configuration accepted by `create_endpoint`.

use crate::error::{ChannelError, Result};

/// Provider identity written into every descriptor.
pub const PROVIDER_NAME: &str = "LocalChannelControl";

/// Which ring of the channel a connect parameter describes. The server
/// transmits on the `response` ring and receives on the `request` ring;
/// the accessing side swaps the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Direction::Request),
            "response" => Some(Direction::Response),
            _ => None,
        }
    }
}

/// The OS object names backing one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    /// Shared memory object holding the ring.
    pub location: String,
    /// Signal fired when the producer commits data.
    pub sync_tx: String,
    /// Signal fired when the consumer frees space.
    pub sync_rx: String,
    pub direction: Direction,
}

/// A parsed connection descriptor: provider identity plus one connect
/// parameter per ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub provider: String,
    pub params: Vec<RegionSpec>,
}

impl ChannelDescriptor {
    pub fn new(params: Vec<RegionSpec>) -> Self {
        Self {
            provider: PROVIDER_NAME.to_string(),
            params,
        }
    }

    /// Parse a descriptor document. Connect parameters of types other than
    /// `shared_mem` are skipped; both directions must be present.
    pub fn parse(text: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(text)
            .map_err(|e| ChannelError::InvalidConfig(format!("descriptor is not valid TOML: {e}")))?;

        let provider = value
            .get("Provider")
            .and_then(|p| p.get("Name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::InvalidConfig("descriptor lacks Provider.Name".into()))?
            .to_string();

        let mut params = Vec::new();
        let connect = value
            .get("ConnectParam")
            .ok_or_else(|| ChannelError::InvalidConfig("descriptor lacks ConnectParam".into()))?;

        // A single table and an array of tables are both accepted.
        let tables: Vec<&toml::Value> = match connect.as_array() {
            Some(arr) => arr.iter().collect(),
            None => vec![connect],
        };

        for table in tables {
            let kind = table.get("Type").and_then(|v| v.as_str()).unwrap_or("");
            if kind != "shared_mem" {
                continue;
            }
            let field = |key: &str| -> Result<String> {
                table
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ChannelError::InvalidConfig(format!("ConnectParam lacks {key}"))
                    })
            };
            let direction = Direction::parse(&field("Direction")?).ok_or_else(|| {
                ChannelError::InvalidConfig("ConnectParam Direction is unknown".into())
            })?;
            params.push(RegionSpec {
                location: field("Location")?,
                sync_tx: field("SyncTx")?,
                sync_rx: field("SyncRx")?,
                direction,
            });
        }

        let desc = Self { provider, params };
        if desc.param(Direction::Request).is_none() || desc.param(Direction::Response).is_none() {
            return Err(ChannelError::InvalidConfig(
                "descriptor must carry a request and a response ring".into(),
            ));
        }
        Ok(desc)
    }

    /// Render the descriptor document.
    pub fn serialize(&self) -> String {
        let mut out = format!("[Provider]\nName = \"{}\"\n", self.provider);
        for param in &self.params {
            out.push('\n');
            out.push_str("[[ConnectParam]]\n");
            out.push_str("Type = \"shared_mem\"\n");
            out.push_str(&format!("Location = \"{}\"\n", param.location));
            out.push_str(&format!("SyncTx = \"{}\"\n", param.sync_tx));
            out.push_str(&format!("SyncRx = \"{}\"\n", param.sync_rx));
            out.push_str(&format!("Direction = \"{}\"\n", param.direction.as_str()));
        }
        out
    }

    /// The first connect parameter for `direction`.
    pub fn param(&self, direction: Direction) -> Option<&RegionSpec> {
        self.params.iter().find(|p| p.direction == direction)
    }
}

/// Configuration accepted by `create_endpoint` and, without a `Provider`
/// section, by `access` for a local bring-up by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: Option<String>,
    pub size: Option<u32>,
}

impl EndpointConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let value: toml::Value = toml::from_str(text)
            .map_err(|e| ChannelError::InvalidConfig(format!("config is not valid TOML: {e}")))?;
        let channel = value.get("IpcChannel");
        let name = channel
            .and_then(|c| c.get("Name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let size = channel
            .and_then(|c| c.get("Size"))
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0 && n <= u32::MAX as i64)
            .map(|n| n as u32);
        Ok(Self { name, size })
    }
}

/// Distinguish a connection string (published by an endpoint) from a local
/// endpoint configuration: the former carries a top-level `Provider` key.
pub fn is_connection_string(text: &str) -> bool {
    toml::from_str::<toml::Value>(text)
        .map(|v| v.get("Provider").is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChannelDescriptor {
        ChannelDescriptor::new(vec![
            RegionSpec {
                location: "SHMC_SHARED_RESPONSE_A".into(),
                sync_tx: "SHMC_TX_SYNC_RESPONSE_A".into(),
                sync_rx: "SHMC_RX_SYNC_RESPONSE_A".into(),
                direction: Direction::Response,
            },
            RegionSpec {
                location: "SHMC_SHARED_REQUEST_A".into(),
                sync_tx: "SHMC_TX_SYNC_REQUEST_A".into(),
                sync_rx: "SHMC_RX_SYNC_REQUEST_A".into(),
                direction: Direction::Request,
            },
        ])
    }

    #[test]
    fn descriptor_round_trip() {
        let desc = sample();
        let parsed = ChannelDescriptor::parse(&desc.serialize()).expect("parse");
        assert_eq!(parsed, desc);
    }

    #[test]
    fn descriptor_requires_both_directions() {
        let mut desc = sample();
        desc.params.pop();
        assert!(ChannelDescriptor::parse(&desc.serialize()).is_err());
    }

    #[test]
    fn descriptor_requires_provider() {
        let text = sample().serialize().replace("[Provider]", "[Something]");
        assert!(ChannelDescriptor::parse(&text).is_err());
    }

    #[test]
    fn foreign_param_types_are_skipped() {
        let mut text = sample().serialize();
        text.push_str("\n[[ConnectParam]]\nType = \"tcp\"\nPort = 80\n");
        let parsed = ChannelDescriptor::parse(&text).expect("parse");
        assert_eq!(parsed.params.len(), 2);
    }

    #[test]
    fn endpoint_config_keys() {
        let cfg = EndpointConfig::parse("[IpcChannel]\nName = \"CHAN_1\"\nSize = 10240\n").unwrap();
        assert_eq!(cfg.name.as_deref(), Some("CHAN_1"));
        assert_eq!(cfg.size, Some(10240));

        let empty = EndpointConfig::parse("").unwrap();
        assert_eq!(empty, EndpointConfig::default());
    }

    #[test]
    fn connection_string_detection() {
        assert!(is_connection_string(&sample().serialize()));
        assert!(!is_connection_string("[IpcChannel]\nName = \"X\"\n"));
    }
}
