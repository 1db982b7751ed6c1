//! Wire format for the peer protocol.
//!
//! Every frame is a self-contained JSON object carrying at minimum a
//! `command` integer tag. Requests and replies for each tag are modeled as
//! distinct structs rather than one grab-bag struct, so the router can key
//! on `(tag, correlation field)` generically.

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

pub const CMD_INFO: u32 = 0;
pub const CMD_IDENTITY: u32 = 1;
pub const CMD_ENERGY: u32 = 2;
pub const CMD_TRANSFER: u32 = 3;
pub const CMD_STATUS: u32 = 4;
pub const CMD_SUBSCRIBE_ENVIRONMENT: u32 = 5;
pub const CMD_UNSUBSCRIBE_ENVIRONMENT: u32 = 6;

/// 32-byte digest, printed and parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageDigest(pub [u8; 32]);

impl MessageDigest {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("digest must be 32 bytes"))?;
        Ok(Self(arr))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for MessageDigest {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageDigest {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        MessageDigest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Command-0 server push: a signed `(epoch, tick)` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoPayload {
    pub epoch: u32,
    pub tick: u16,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl InfoPayload {
    /// The exact 6-byte buffer the admin signature covers: big-endian
    /// `epoch` at offset 0, big-endian `tick` at offset 4.
    pub fn signed_bytes(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..4].copy_from_slice(&self.epoch.to_be_bytes());
        buf[4..6].copy_from_slice(&self.tick.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityReply {
    pub identity: String,
    pub identity_nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyRequest {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnergyReply {
    pub identity: String,
    pub energy: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSubmit {
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub message_digest: MessageDigest,
}

/// Command-4 reply is one of two disjoint shapes on the wire: either an
/// inclusion verdict, or a rejection reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StatusReply {
    #[serde(rename_all = "camelCase")]
    Included {
        message_digest: MessageDigest,
        inclusion_state: bool,
        tick: u16,
        epoch: u32,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        message_digest: MessageDigest,
        reason: String,
    },
}

impl StatusReply {
    pub fn message_digest(&self) -> MessageDigest {
        match self {
            StatusReply::Included { message_digest, .. } => *message_digest,
            StatusReply::Rejected { message_digest, .. } => *message_digest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSubscribe {
    pub environment_digest: MessageDigest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentData {
    pub environment_digest: MessageDigest,
    pub data: serde_json::Value,
}

/// Top-level inbound frame, dispatched on `command`.
#[derive(Debug, Clone)]
pub enum Inbound {
    Info(InfoPayload),
    Identity(IdentityReply),
    Energy(EnergyReply),
    Status(StatusReply),
    EnvironmentData(EnvironmentData),
    EnvironmentUnsubscribeAck { environment_digest: MessageDigest },
}

impl Inbound {
    /// Parses a raw text frame. Frame corruption (missing/invalid
    /// `command` tag, or a body that doesn't match the tag's shape) is
    /// reported as an error; the caller (the Peer Session) closes the
    /// socket on this.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let command = value
            .get("command")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("frame missing integer `command` field"))?;
        match command as u32 {
            CMD_INFO => Ok(Inbound::Info(serde_json::from_value(value)?)),
            CMD_IDENTITY => Ok(Inbound::Identity(serde_json::from_value(value)?)),
            CMD_ENERGY => Ok(Inbound::Energy(serde_json::from_value(value)?)),
            CMD_STATUS => Ok(Inbound::Status(serde_json::from_value(value)?)),
            CMD_SUBSCRIBE_ENVIRONMENT => {
                Ok(Inbound::EnvironmentData(serde_json::from_value(value)?))
            }
            CMD_UNSUBSCRIBE_ENVIRONMENT => {
                let environment_digest = value
                    .get("environmentDigest")
                    .ok_or_else(|| anyhow::anyhow!("missing environmentDigest"))?;
                Ok(Inbound::EnvironmentUnsubscribeAck {
                    environment_digest: serde_json::from_value(environment_digest.clone())?,
                })
            }
            other => anyhow::bail!("unknown command tag {other}"),
        }
    }

    /// Raw bytes used for quorum comparison: the reply is compared by
    /// byte-exact equality of its canonical JSON form, not by semantic
    /// equality.
    pub fn canonical_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let v = match self {
            Inbound::Info(p) => serde_json::to_vec(p)?,
            Inbound::Identity(p) => serde_json::to_vec(p)?,
            Inbound::Energy(p) => serde_json::to_vec(p)?,
            Inbound::Status(p) => serde_json::to_vec(p)?,
            Inbound::EnvironmentData(p) => serde_json::to_vec(p)?,
            Inbound::EnvironmentUnsubscribeAck { environment_digest } => {
                serde_json::to_vec(environment_digest)?
            }
        };
        Ok(v)
    }

    /// Correlation key fragment: the request-identifying field this reply
    /// answers (`identity`, `hash`, or `digest`), matching the pending
    /// request key rule.
    pub fn correlation(&self) -> Option<String> {
        match self {
            Inbound::Identity(p) => Some(p.identity.clone()),
            Inbound::Energy(p) => Some(p.identity.clone()),
            Inbound::Status(p) => Some(p.message_digest().to_hex()),
            Inbound::EnvironmentData(p) => Some(p.environment_digest.to_hex()),
            Inbound::EnvironmentUnsubscribeAck { environment_digest } => {
                Some(environment_digest.to_hex())
            }
            Inbound::Info(_) => None,
        }
    }

    pub fn command(&self) -> u32 {
        match self {
            Inbound::Info(_) => CMD_INFO,
            Inbound::Identity(_) => CMD_IDENTITY,
            Inbound::Energy(_) => CMD_ENERGY,
            Inbound::Status(_) => CMD_STATUS,
            Inbound::EnvironmentData(_) => CMD_SUBSCRIBE_ENVIRONMENT,
            Inbound::EnvironmentUnsubscribeAck { .. } => CMD_UNSUBSCRIBE_ENVIRONMENT,
        }
    }
}
