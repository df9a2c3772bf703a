//! Common types for mqtt3.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (PUBLISH / PUBACK).
    AtLeastOnce = 1,
    /// Exactly once delivery (PUBLISH / PUBREC / PUBREL / PUBCOMP).
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// MQTT control packet type (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// The fixed-header flag nibble mandated by MQTT 3.1.1, or `None`
    /// for PUBLISH whose flags carry dup/qos/retain.
    pub fn reserved_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Bytes consumed by the fixed header itself (1 + length of the
    /// variable-length remaining length field).
    pub header_length: usize,
}

/// CONNECT variable-header flag byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectFlags {
    pub clean_session: bool,
    pub will: bool,
    pub will_qos: QoS,
    pub will_retain: bool,
    pub username: bool,
    pub password: bool,
}

impl ConnectFlags {
    /// Decode the flag byte, enforcing [MQTT-3.1.2-3] (reserved bit zero),
    /// [MQTT-3.1.2-14/15] (will qos/retain zero without will flag) and
    /// [MQTT-3.1.2-22] (password requires username).
    pub fn decode(byte: u8) -> Result<Self> {
        if byte & 0x01 != 0 {
            return Err(Error::MalformedPacket("connect reserved flag set"));
        }
        let will = byte & 0x04 != 0;
        let will_qos_raw = (byte >> 3) & 0x03;
        let will_qos = QoS::from_u8(will_qos_raw).ok_or(Error::InvalidQoS(will_qos_raw))?;
        let will_retain = byte & 0x20 != 0;
        if !will && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(Error::MalformedPacket("will qos/retain without will flag"));
        }
        let username = byte & 0x80 != 0;
        let password = byte & 0x40 != 0;
        if password && !username {
            return Err(Error::MalformedPacket("password flag without username flag"));
        }
        Ok(ConnectFlags {
            clean_session: byte & 0x02 != 0,
            will,
            will_qos,
            will_retain,
            username,
            password,
        })
    }

    pub fn encode(&self) -> u8 {
        let mut byte = 0u8;
        if self.clean_session {
            byte |= 0x02;
        }
        if self.will {
            byte |= 0x04;
            byte |= (self.will_qos as u8) << 3;
            if self.will_retain {
                byte |= 0x20;
            }
        }
        if self.password {
            byte |= 0x40;
        }
        if self.username {
            byte |= 0x80;
        }
        byte
    }
}

/// CONNACK return code, exact wire values per MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadUsernameOrPassword),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

/// An application message as routed between sessions.
///
/// One `Message` may produce many PUBLISH packets (one per matching
/// subscriber), each with its own packet id and downgraded QoS.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Quality of service level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the QoS level.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Last Will and Testament declared at CONNECT time.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    pub(crate) fn into_message(self) -> Message {
        Message {
            topic: self.topic,
            payload: self.payload,
            qos: self.qos,
            retain: self.retain,
        }
    }
}

/// Validate a topic name as used in PUBLISH: non-empty, no wildcards, no NUL.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::ProtocolViolation("empty topic name".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::ProtocolViolation(format!(
            "wildcard in topic name: {topic}"
        )));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidUtf8);
    }
    Ok(())
}

/// Validate a topic filter as used in SUBSCRIBE: `#` only as the final
/// level, `+` and `#` alone in their level, no NUL.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::ProtocolViolation("empty topic filter".to_string()));
    }
    if filter.contains('\0') {
        return Err(Error::InvalidUtf8);
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" || i != levels.len() - 1 {
                return Err(Error::ProtocolViolation(format!(
                    "'#' must be the final level: {filter}"
                )));
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(Error::ProtocolViolation(format!(
                "'+' must occupy a whole level: {filter}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_flags_roundtrip() {
        let flags = ConnectFlags {
            clean_session: true,
            will: true,
            will_qos: QoS::AtLeastOnce,
            will_retain: true,
            username: true,
            password: true,
        };
        let decoded = ConnectFlags::decode(flags.encode()).unwrap();
        assert!(decoded.clean_session);
        assert!(decoded.will);
        assert_eq!(decoded.will_qos, QoS::AtLeastOnce);
        assert!(decoded.will_retain);
        assert!(decoded.username);
        assert!(decoded.password);
    }

    #[test]
    fn test_connect_flags_reserved_bit() {
        assert!(ConnectFlags::decode(0x01).is_err());
    }

    #[test]
    fn test_connect_flags_password_without_username() {
        assert!(ConnectFlags::decode(0x40).is_err());
    }

    #[test]
    fn test_connect_flags_will_qos_without_will() {
        assert!(ConnectFlags::decode(0x08).is_err());
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("a/b/c").is_ok());
        assert!(validate_topic_name("a/+/c").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/b+/c").is_err());
        assert!(validate_topic_filter("").is_err());
    }
}
