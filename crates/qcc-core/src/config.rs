use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// One configured computor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputorConfig {
    pub url: Url,
    #[serde(default)]
    pub options: PeerOptions,
}

/// Per-peer connection tuning. Deliberately sparse: the Peer lifecycle
/// takes no per-peer timeouts beyond reconnect delay.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerOptions {
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

/// Configuration surface for the connection core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub computors: Vec<ComputorConfig>,

    #[serde(
        default = "default_sync_interval",
        with = "duration_millis"
    )]
    pub synchronization_interval: Duration,

    /// 32-byte admin public key, hex-encoded on the wire/in config files.
    #[serde(with = "hex_array32")]
    pub admin_public_key: [u8; 32],

    #[serde(
        default = "default_reconnect_delay",
        with = "duration_millis"
    )]
    pub reconnect_timeout_duration: Duration,
}

impl CoreConfig {
    pub fn peer_count(&self) -> usize {
        self.computors.len()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod hex_array32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("admin public key must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let json = serde_json::json!({
            "computors": [
                {"url": "wss://node-a.example/"},
                {"url": "wss://node-b.example/"},
                {"url": "wss://node-c.example/"}
            ],
            "admin_public_key": "ab".repeat(32),
        })
        .to_string();
        let cfg: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.peer_count(), 3);
        assert_eq!(cfg.reconnect_timeout_duration, default_reconnect_delay());
    }
}
