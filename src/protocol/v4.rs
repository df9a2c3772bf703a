//! MQTT 3.1.1 packet encoding and decoding.
//!
//! Each packet type has `read` / `write` / `size` in terms of plain byte
//! slices; [`Packet::read`] and [`Packet::write`] dispatch over the 14
//! control packet types.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::{ConnectFlags, ConnectReturnCode, PacketType, QoS, Will};

use super::codec::{
    read_binary_slice, read_fixed_header, read_string_slice, read_u16, variable_int_len,
    write_binary, write_fixed_header, write_string, write_u16,
};

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pkid: u16,
}

/// PUBACK packet (QoS 1 acknowledgment).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubAck {
    pub pkid: u16,
}

/// PUBREC packet (QoS 2 step 2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubRec {
    pub pkid: u16,
}

/// PUBREL packet (QoS 2 step 3, fixed-header flags 0010).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubRel {
    pub pkid: u16,
}

/// PUBCOMP packet (QoS 2 step 4).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubComp {
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// SUBACK per-filter return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SubscribeReturnCode::Success(QoS::AtMostOnce)),
            1 => Ok(SubscribeReturnCode::Success(QoS::AtLeastOnce)),
            2 => Ok(SubscribeReturnCode::Success(QoS::ExactlyOnce)),
            0x80 => Ok(SubscribeReturnCode::Failure),
            _ => Err(Error::MalformedPacket("invalid suback return code")),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnsubAck {
    pub pkid: u16,
}

// ============================================================================
// Packet dispatch
// ============================================================================

impl Packet {
    /// Parse one packet from the buffer.
    ///
    /// Returns the packet and the number of bytes consumed.
    /// `Error::Incomplete` means the buffer holds a proper prefix.
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize)> {
        let header = read_fixed_header(buf)?;
        let total_len = header.header_length + header.remaining_length as usize;

        if total_len > max_size {
            return Err(Error::PacketTooLarge {
                size: total_len,
                max: max_size,
            });
        }

        if buf.len() < total_len {
            return Err(Error::Incomplete {
                needed: total_len - buf.len(),
            });
        }

        let payload = &buf[header.header_length..total_len];

        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(payload)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(payload)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, payload)?),
            PacketType::PubAck => Packet::PubAck(PubAck {
                pkid: read_pkid(payload)?,
            }),
            PacketType::PubRec => Packet::PubRec(PubRec {
                pkid: read_pkid(payload)?,
            }),
            PacketType::PubRel => Packet::PubRel(PubRel {
                pkid: read_pkid(payload)?,
            }),
            PacketType::PubComp => Packet::PubComp(PubComp {
                pkid: read_pkid(payload)?,
            }),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(payload)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(payload)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(payload)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck {
                pkid: read_pkid(payload)?,
            }),
            PacketType::PingReq => read_empty(payload, Packet::PingReq)?,
            PacketType::PingResp => read_empty(payload, Packet::PingResp)?,
            PacketType::Disconnect => read_empty(payload, Packet::Disconnect)?,
        };

        Ok((packet, total_len))
    }

    /// Write the packet to the buffer; returns bytes written.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::PubAck(p) => write_ack(buf, PacketType::PubAck, 0x00, p.pkid),
            Packet::PubRec(p) => write_ack(buf, PacketType::PubRec, 0x00, p.pkid),
            Packet::PubRel(p) => write_ack(buf, PacketType::PubRel, 0x02, p.pkid),
            Packet::PubComp(p) => write_ack(buf, PacketType::PubComp, 0x00, p.pkid),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(p) => write_ack(buf, PacketType::UnsubAck, 0x00, p.pkid),
            Packet::PingReq => write_empty(buf, PacketType::PingReq),
            Packet::PingResp => write_empty(buf, PacketType::PingResp),
            Packet::Disconnect => write_empty(buf, PacketType::Disconnect),
        }
    }

    /// Calculate the encoded packet size.
    pub fn size(&self) -> usize {
        match self {
            Packet::Connect(p) => p.size(),
            Packet::ConnAck(_) => 4,
            Packet::Publish(p) => p.size(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 4,
            Packet::Subscribe(p) => p.size(),
            Packet::SubAck(p) => p.size(),
            Packet::Unsubscribe(p) => p.size(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 2,
        }
    }

    /// Short name for logging and `UnexpectedPacket` errors.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

fn read_pkid(buf: &[u8]) -> Result<u16> {
    if buf.len() != 2 {
        return Err(Error::MalformedPacket("ack remaining length must be 2"));
    }
    let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
    if pkid == 0 {
        return Err(Error::MalformedPacket("zero packet id"));
    }
    Ok(pkid)
}

fn read_empty(buf: &[u8], packet: Packet) -> Result<Packet> {
    if !buf.is_empty() {
        return Err(Error::MalformedPacket("non-empty payload"));
    }
    Ok(packet)
}

fn write_ack(buf: &mut [u8], packet_type: PacketType, flags: u8, pkid: u16) -> Result<usize> {
    if buf.len() < 4 {
        return Err(Error::BufferTooSmall {
            required: 4,
            available: buf.len(),
        });
    }
    write_fixed_header(buf, packet_type, flags, 2).ok_or(Error::BufferTooSmall {
        required: 2,
        available: buf.len(),
    })?;
    write_u16(&mut buf[2..], pkid).ok_or(Error::BufferTooSmall {
        required: 2,
        available: buf.len() - 2,
    })?;
    Ok(4)
}

fn write_empty(buf: &mut [u8], packet_type: PacketType) -> Result<usize> {
    if buf.len() < 2 {
        return Err(Error::BufferTooSmall {
            required: 2,
            available: buf.len(),
        });
    }
    write_fixed_header(buf, packet_type, 0, 0).ok_or(Error::BufferTooSmall {
        required: 2,
        available: buf.len(),
    })
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

impl Connect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;

        // Protocol name + level. A mismatch surfaces as UnsupportedVersion
        // so the broker can answer CONNACK code 1 before closing.
        let (name, len) = read_string_slice(buf)?;
        pos += len;

        if buf.len() < pos + 1 {
            return Err(Error::Incomplete { needed: 1 });
        }
        let protocol_level = buf[pos];
        pos += 1;

        if name != "MQTT" || protocol_level != 4 {
            return Err(Error::UnsupportedVersion(protocol_level));
        }

        if buf.len() < pos + 1 {
            return Err(Error::Incomplete { needed: 1 });
        }
        let flags = ConnectFlags::decode(buf[pos])?;
        pos += 1;

        let keep_alive = read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?;
        pos += 2;

        let (client_id, len) = read_string_slice(&buf[pos..])?;
        let client_id = client_id.to_string();
        pos += len;

        let will = if flags.will {
            let (topic, len) = read_string_slice(&buf[pos..])?;
            pos += len;
            crate::types::validate_topic_name(topic)?;
            let (payload, len) = read_binary_slice(&buf[pos..])?;
            pos += len;
            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: flags.will_qos,
                retain: flags.will_retain,
            })
        } else {
            None
        };

        let username = if flags.username {
            let (u, len) = read_string_slice(&buf[pos..])?;
            pos += len;
            Some(u.to_string())
        } else {
            None
        };

        let password = if flags.password {
            let (p, len) = read_binary_slice(&buf[pos..])?;
            pos += len;
            Some(p.to_vec())
        } else {
            None
        };

        // The declared remaining length must be consumed exactly.
        if pos != buf.len() {
            return Err(Error::MalformedPacket("trailing bytes after connect payload"));
        }

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags.clean_session,
            username,
            password,
            will,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: buf.len(),
            });
        }

        let mut pos = write_fixed_header(buf, PacketType::Connect, 0, remaining_len as u32)
            .ok_or(Error::BufferTooSmall {
                required: header_len,
                available: buf.len(),
            })?;

        pos += write_string(&mut buf[pos..], "MQTT").ok_or(Error::BufferTooSmall {
            required: 6,
            available: buf.len() - pos,
        })?;
        buf[pos] = 4; // protocol level
        pos += 1;

        let mut flags = ConnectFlags {
            clean_session: self.clean_session,
            username: self.username.is_some(),
            password: self.password.is_some(),
            ..Default::default()
        };
        if let Some(ref will) = self.will {
            flags.will = true;
            flags.will_qos = will.qos;
            flags.will_retain = will.retain;
        }
        buf[pos] = flags.encode();
        pos += 1;

        write_u16(&mut buf[pos..], self.keep_alive).ok_or(Error::BufferTooSmall {
            required: 2,
            available: buf.len() - pos,
        })?;
        pos += 2;

        pos += write_string(&mut buf[pos..], &self.client_id).ok_or(Error::BufferTooSmall {
            required: 2 + self.client_id.len(),
            available: buf.len() - pos,
        })?;

        if let Some(ref will) = self.will {
            pos += write_string(&mut buf[pos..], &will.topic).ok_or(Error::BufferTooSmall {
                required: 2 + will.topic.len(),
                available: buf.len() - pos,
            })?;
            pos += write_binary(&mut buf[pos..], &will.payload).ok_or(Error::BufferTooSmall {
                required: 2 + will.payload.len(),
                available: buf.len() - pos,
            })?;
        }
        if let Some(ref username) = self.username {
            pos += write_string(&mut buf[pos..], username).ok_or(Error::BufferTooSmall {
                required: 2 + username.len(),
                available: buf.len() - pos,
            })?;
        }
        if let Some(ref password) = self.password {
            pos += write_binary(&mut buf[pos..], password).ok_or(Error::BufferTooSmall {
                required: 2 + password.len(),
                available: buf.len() - pos,
            })?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep_alive
        let mut len = 2 + 4 + 1 + 1 + 2;
        len += 2 + self.client_id.len();

        if let Some(ref will) = self.will {
            len += 2 + will.topic.len();
            len += 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl ConnAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 2 {
            return Err(Error::MalformedPacket("connack remaining length must be 2"));
        }
        if buf[0] & 0xFE != 0 {
            return Err(Error::MalformedPacket("connack reserved bits"));
        }

        let session_present = buf[0] & 0x01 != 0;
        let code = ConnectReturnCode::from_u8(buf[1])
            .ok_or(Error::MalformedPacket("invalid connack return code"))?;

        Ok(ConnAck {
            session_present,
            code,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.len(),
            });
        }

        write_fixed_header(buf, PacketType::ConnAck, 0, 2).ok_or(Error::BufferTooSmall {
            required: 2,
            available: buf.len(),
        })?;
        buf[2] = if self.session_present { 0x01 } else { 0x00 };
        buf[3] = self.code as u8;

        Ok(4)
    }
}

// ============================================================================
// PUBLISH
// ============================================================================

impl Publish {
    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos_raw = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_raw).ok_or(Error::InvalidQoS(qos_raw))?;
        let retain = flags & 0x01 != 0;

        // [MQTT-3.3.1-2] dup must be 0 for QoS 0 messages.
        if dup && qos == QoS::AtMostOnce {
            return Err(Error::MalformedPacket("dup set on qos 0 publish"));
        }

        let mut pos = 0;

        let (topic, len) = read_string_slice(buf)?;
        if topic.contains(['+', '#']) {
            return Err(Error::MalformedPacket("wildcard in publish topic"));
        }
        let topic = topic.to_string();
        pos += len;

        let pkid = if qos != QoS::AtMostOnce {
            let id = read_u16(&buf[pos..]).ok_or(Error::Incomplete { needed: 2 })?;
            if id == 0 {
                return Err(Error::MalformedPacket("zero packet id"));
            }
            pos += 2;
            id
        } else {
            0
        };

        let payload = Bytes::copy_from_slice(&buf[pos..]);

        Ok(Publish {
            topic,
            payload,
            qos,
            retain,
            dup,
            pkid,
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: buf.len(),
            });
        }

        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        let mut pos = write_fixed_header(buf, PacketType::Publish, flags, remaining_len as u32)
            .ok_or(Error::BufferTooSmall {
                required: header_len,
                available: buf.len(),
            })?;

        pos += write_string(&mut buf[pos..], &self.topic).ok_or(Error::BufferTooSmall {
            required: 2 + self.topic.len(),
            available: buf.len() - pos,
        })?;

        if self.qos != QoS::AtMostOnce {
            write_u16(&mut buf[pos..], self.pkid).ok_or(Error::BufferTooSmall {
                required: 2,
                available: buf.len() - pos,
            })?;
            pos += 2;
        }

        buf[pos..pos + self.payload.len()].copy_from_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

// ============================================================================
// SUBSCRIBE / SUBACK / UNSUBSCRIBE
// ============================================================================

impl Subscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        if pkid == 0 {
            return Err(Error::MalformedPacket("zero packet id"));
        }
        let mut pos = 2;

        let mut filters = Vec::new();
        while pos < buf.len() {
            let (path, len) = read_string_slice(&buf[pos..])?;
            pos += len;

            if pos >= buf.len() {
                return Err(Error::Incomplete { needed: 1 });
            }
            // [MQTT-3.8.3-4] upper bits of the requested QoS byte are reserved.
            if buf[pos] & 0xFC != 0 {
                return Err(Error::MalformedPacket("subscribe reserved qos bits"));
            }
            let qos = QoS::from_u8(buf[pos]).ok_or(Error::InvalidQoS(buf[pos]))?;
            pos += 1;

            filters.push(SubscribeFilter {
                path: path.to_string(),
                qos,
            });
        }

        // [MQTT-3.8.3-3] at least one filter is required.
        if filters.is_empty() {
            return Err(Error::MalformedPacket("subscribe with no filters"));
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: buf.len(),
            });
        }

        let mut pos = write_fixed_header(buf, PacketType::Subscribe, 0x02, remaining_len as u32)
            .ok_or(Error::BufferTooSmall {
                required: header_len,
                available: buf.len(),
            })?;

        write_u16(&mut buf[pos..], self.pkid).ok_or(Error::BufferTooSmall {
            required: 2,
            available: buf.len() - pos,
        })?;
        pos += 2;

        for filter in &self.filters {
            pos += write_string(&mut buf[pos..], &filter.path).ok_or(Error::BufferTooSmall {
                required: 2 + filter.path.len(),
                available: buf.len() - pos,
            })?;
            buf[pos] = filter.qos as u8;
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2; // pkid
        for filter in &self.filters {
            len += 2 + filter.path.len() + 1;
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl SubAck {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        if buf.len() < 3 {
            return Err(Error::MalformedPacket("suback with no return codes"));
        }
        let return_codes = buf[2..]
            .iter()
            .map(|&b| SubscribeReturnCode::from_u8(b))
            .collect::<Result<Vec<_>>>()?;

        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = 2 + self.return_codes.len();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: buf.len(),
            });
        }

        let mut pos = write_fixed_header(buf, PacketType::SubAck, 0, remaining_len as u32).ok_or(
            Error::BufferTooSmall {
                required: header_len,
                available: buf.len(),
            },
        )?;

        write_u16(&mut buf[pos..], self.pkid).ok_or(Error::BufferTooSmall {
            required: 2,
            available: buf.len() - pos,
        })?;
        pos += 2;

        for code in &self.return_codes {
            buf[pos] = code.to_u8();
            pos += 1;
        }

        Ok(pos)
    }

    pub fn size(&self) -> usize {
        let remaining = 2 + self.return_codes.len();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Unsubscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf).ok_or(Error::Incomplete { needed: 2 })?;
        if pkid == 0 {
            return Err(Error::MalformedPacket("zero packet id"));
        }
        let mut pos = 2;

        let mut topics = Vec::new();
        while pos < buf.len() {
            let (topic, len) = read_string_slice(&buf[pos..])?;
            topics.push(topic.to_string());
            pos += len;
        }

        // [MQTT-3.10.3-2] at least one filter is required.
        if topics.is_empty() {
            return Err(Error::MalformedPacket("unsubscribe with no filters"));
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let header_len = 1 + variable_int_len(remaining_len as u32);
        let total = header_len + remaining_len;

        if buf.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: buf.len(),
            });
        }

        let mut pos = write_fixed_header(buf, PacketType::Unsubscribe, 0x02, remaining_len as u32)
            .ok_or(Error::BufferTooSmall {
                required: header_len,
                available: buf.len(),
            })?;

        write_u16(&mut buf[pos..], self.pkid).ok_or(Error::BufferTooSmall {
            required: 2,
            available: buf.len() - pos,
        })?;
        pos += 2;

        for topic in &self.topics {
            pos += write_string(&mut buf[pos..], topic).ok_or(Error::BufferTooSmall {
                required: 2 + topic.len(),
                available: buf.len() - pos,
            })?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2; // pkid
        for topic in &self.topics {
            len += 2 + topic.len();
        }
        len
    }

    pub fn size(&self) -> usize {
        let remaining = self.remaining_length();
        1 + variable_int_len(remaining as u32) + remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let mut buf = vec![0u8; packet.size()];
        let written = packet.write(&mut buf).unwrap();
        assert_eq!(written, packet.size());

        let (decoded, consumed) = Packet::read(&buf, 1024 * 1024).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_connect_roundtrip() {
        roundtrip(Packet::Connect(Connect {
            client_id: "client-1".to_string(),
            keep_alive: 60,
            clean_session: true,
            username: Some("user".to_string()),
            password: Some(b"pass".to_vec()),
            will: Some(Will::new("bye", &b"gone"[..], QoS::AtLeastOnce, false)),
        }));
    }

    #[test]
    fn test_connack_roundtrip() {
        roundtrip(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Accepted,
        }));
    }

    #[test]
    fn test_publish_roundtrip_all_qos() {
        for (qos, pkid) in [
            (QoS::AtMostOnce, 0),
            (QoS::AtLeastOnce, 7),
            (QoS::ExactlyOnce, 65535),
        ] {
            roundtrip(Packet::Publish(Publish {
                topic: "sensors/room1/temp".to_string(),
                payload: Bytes::from_static(b"23"),
                qos,
                retain: true,
                dup: qos != QoS::AtMostOnce,
                pkid,
            }));
        }
    }

    #[test]
    fn test_ack_roundtrips() {
        roundtrip(Packet::PubAck(PubAck { pkid: 1 }));
        roundtrip(Packet::PubRec(PubRec { pkid: 2 }));
        roundtrip(Packet::PubRel(PubRel { pkid: 3 }));
        roundtrip(Packet::PubComp(PubComp { pkid: 4 }));
        roundtrip(Packet::UnsubAck(UnsubAck { pkid: 5 }));
    }

    #[test]
    fn test_subscribe_roundtrip() {
        roundtrip(Packet::Subscribe(Subscribe {
            pkid: 10,
            filters: vec![
                SubscribeFilter {
                    path: "a/+/c".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                SubscribeFilter {
                    path: "b/#".to_string(),
                    qos: QoS::ExactlyOnce,
                },
            ],
        }));
        roundtrip(Packet::SubAck(SubAck {
            pkid: 10,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        }));
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            pkid: 11,
            topics: vec!["a/+/c".to_string()],
        }));
    }

    #[test]
    fn test_simple_roundtrips() {
        roundtrip(Packet::PingReq);
        roundtrip(Packet::PingResp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_partial_read_every_offset() {
        let packet = Packet::Publish(Publish {
            topic: "t/partial".to_string(),
            payload: Bytes::from_static(b"payload bytes"),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pkid: 42,
        });
        let mut buf = vec![0u8; packet.size()];
        let written = packet.write(&mut buf).unwrap();

        for split in 0..written {
            let err = Packet::read(&buf[..split], 1024).unwrap_err();
            assert!(err.is_incomplete(), "offset {split}: {err:?}");
        }
        let (decoded, consumed) = Packet::read(&buf, 1024).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_connect_bad_protocol_level() {
        let packet = Packet::Connect(Connect {
            client_id: "c".to_string(),
            keep_alive: 0,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        });
        let mut buf = vec![0u8; packet.size()];
        packet.write(&mut buf).unwrap();
        // Corrupt the protocol level byte (fixed header 2 + name 6).
        buf[8] = 3;
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn test_connect_trailing_bytes_rejected() {
        let packet = Packet::Connect(Connect {
            client_id: "c".to_string(),
            keep_alive: 0,
            clean_session: true,
            username: Some("user".to_string()),
            password: Some(b"pass".to_vec()),
            will: None,
        });
        let mut buf = vec![0u8; packet.size()];
        packet.write(&mut buf).unwrap();

        // Grow the remaining length by one and append a garbage byte.
        buf[1] += 1;
        buf.push(0xAA);
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_qos3_rejected() {
        // Hand-built PUBLISH with qos bits 11.
        let buf = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert!(matches!(Packet::read(&buf, 1024), Err(Error::InvalidQoS(3))));
    }

    #[test]
    fn test_publish_dup_on_qos0_rejected() {
        let buf = [0x38, 0x03, 0x00, 0x01, b't'];
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_zero_pkid_rejected() {
        let buf = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_packet_too_large() {
        let packet = Packet::Publish(Publish {
            topic: "t".to_string(),
            payload: Bytes::from(vec![0u8; 64]),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            pkid: 0,
        });
        let mut buf = vec![0u8; packet.size()];
        packet.write(&mut buf).unwrap();
        assert!(matches!(
            Packet::read(&buf, 16),
            Err(Error::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_subscribe_empty_rejected() {
        let buf = [0x82, 0x02, 0x00, 0x01];
        assert!(matches!(
            Packet::read(&buf, 1024),
            Err(Error::MalformedPacket(_))
        ));
    }
}
