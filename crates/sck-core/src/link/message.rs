//! Typed messages exchanged with the co-processor
//!
//! A message is one type tag byte followed by a postcard encoded
//! [`Payload`]. Messages that carry no fields have no payload bytes at all.

use alloc::collections::BTreeMap;
use alloc::string::String;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use super::MAX_MESSAGE_SIZE;

/// Buffer holding one encoded message.
pub type MessageBuf = heapless::Vec<u8, MAX_MESSAGE_SIZE>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    #[error("message has no type tag")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("payload does not fit the message buffer")]
    Encode,
    #[error("malformed payload")]
    Decode,
}

/// Type tag of a message in one direction of the link.
pub trait MessageKind: Copy + core::fmt::Debug {
    fn tag(self) -> u8;
    fn from_tag(tag: u8) -> Option<Self>;
}

/// Messages sent to the co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutboundKind {
    SetConfig = 0,
    GetTime = 1,
    GetNetInfo = 2,
    MqttHello = 3,
    MqttInfo = 4,
    MqttPublish = 5,
    MqttCustom = 6,
    StopAp = 7,
    LedOff = 8,
}

impl OutboundKind {
    const ALL: [Self; 9] = [
        Self::SetConfig,
        Self::GetTime,
        Self::GetNetInfo,
        Self::MqttHello,
        Self::MqttInfo,
        Self::MqttPublish,
        Self::MqttCustom,
        Self::StopAp,
        Self::LedOff,
    ];
}

impl MessageKind for OutboundKind {
    fn tag(self) -> u8 {
        self as u8
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u8 == tag)
    }
}

/// What the co-processor does after a `SetConfig`, sent as its `ac` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigAction {
    /// Join the configured network.
    Connect = 9,
    /// Open the setup access point.
    StartAp = 10,
}

impl ConfigAction {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        [Self::Connect, Self::StartAp]
            .into_iter()
            .find(|a| *a as u8 == tag)
    }
}

/// Messages received from the co-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InboundKind {
    SetConfig = 0,
    Debug = 1,
    NetInfo = 2,
    WifiConnected = 3,
    SsidError = 4,
    PassError = 5,
    WifiUnknownError = 6,
    Time = 7,
    MqttHelloOk = 8,
    MqttPublishOk = 9,
    MqttPublishError = 10,
    MqttInfoOk = 11,
    MqttInfoError = 12,
    MqttCustomOk = 13,
    MqttCustomError = 14,
    Booted = 15,
}

impl InboundKind {
    const ALL: [Self; 16] = [
        Self::SetConfig,
        Self::Debug,
        Self::NetInfo,
        Self::WifiConnected,
        Self::SsidError,
        Self::PassError,
        Self::WifiUnknownError,
        Self::Time,
        Self::MqttHelloOk,
        Self::MqttPublishOk,
        Self::MqttPublishError,
        Self::MqttInfoOk,
        Self::MqttInfoError,
        Self::MqttCustomOk,
        Self::MqttCustomError,
        Self::Booted,
    ];
}

impl MessageKind for InboundKind {
    fn tag(self) -> u8 {
        self as u8
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u8 == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f32),
    Text(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::Int(v.into())
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Key-ordered map of short keys to primitive values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer value; floats are truncated.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(_) => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f32> {
        match self.get(key)? {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message<K> {
    pub kind: K,
    pub payload: Payload,
}

pub type OutboundMessage = Message<OutboundKind>;
pub type InboundMessage = Message<InboundKind>;

impl<K: MessageKind> Message<K> {
    pub fn new(kind: K, payload: Payload) -> Self {
        Self { kind, payload }
    }

    /// A message without fields.
    pub fn bare(kind: K) -> Self {
        Self::new(kind, Payload::new())
    }

    pub fn encode(&self) -> Result<MessageBuf, MessageError> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        buf[0] = self.kind.tag();
        let used = if self.payload.is_empty() {
            0
        } else {
            postcard::to_slice(&self.payload, &mut buf[1..])
                .map_err(|_| MessageError::Encode)?
                .len()
        };
        MessageBuf::from_slice(&buf[..=used]).map_err(|_| MessageError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let (&tag, rest) = bytes.split_first().ok_or(MessageError::Empty)?;
        let kind = K::from_tag(tag).ok_or(MessageError::UnknownType(tag))?;
        let payload = if rest.is_empty() {
            Payload::new()
        } else {
            postcard::from_bytes(rest).map_err(|_| MessageError::Decode)?
        };
        Ok(Self { kind, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_message_is_tag_only() {
        let encoded = OutboundMessage::bare(OutboundKind::GetTime).encode().unwrap();
        assert_eq!(encoded.as_slice(), &[OutboundKind::GetTime as u8]);
    }

    #[test]
    fn test_payload_survives_encoding() {
        let msg = InboundMessage::new(
            InboundKind::Booted,
            Payload::new()
                .with("mac", "AB:45:2D:33:98:01")
                .with("ver", "0.3.0")
                .with("bd", "2018-07-17T06:55:06Z"),
        );
        let decoded = InboundMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, InboundKind::Booted);
        assert_eq!(decoded.payload.text("mac"), Some("AB:45:2D:33:98:01"));
        assert_eq!(decoded.payload.len(), 3);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            InboundMessage::decode(&[200]),
            Err(MessageError::UnknownType(200))
        );
        assert_eq!(InboundMessage::decode(&[]), Err(MessageError::Empty));
    }

    #[test]
    fn test_config_actions_are_not_message_types() {
        for action in [ConfigAction::Connect, ConfigAction::StartAp] {
            assert_eq!(OutboundKind::from_tag(action.tag()), None);
            assert_eq!(ConfigAction::from_tag(action.tag()), Some(action));
        }
        assert_eq!(
            OutboundMessage::decode(&[ConfigAction::Connect.tag()]),
            Err(MessageError::UnknownType(9))
        );
        assert_eq!(ConfigAction::from_tag(OutboundKind::SetConfig.tag()), None);
    }

    #[test]
    fn test_oversize_payload_fails_to_encode() {
        let long = "x".repeat(MAX_MESSAGE_SIZE);
        let msg = OutboundMessage::new(OutboundKind::MqttCustom, Payload::new().with("pl", long.as_str()));
        assert_eq!(msg.encode(), Err(MessageError::Encode));
    }

    #[test]
    fn test_numeric_coercions() {
        let p = Payload::new().with("pi", 120u32).with("f", 2.5f32).with("cs", true);
        assert_eq!(p.int("pi"), Some(120));
        assert_eq!(p.float("pi"), Some(120.0));
        assert_eq!(p.int("f"), Some(2));
        assert_eq!(p.flag("cs"), Some(true));
        assert_eq!(p.text("pi"), None);
    }
}
