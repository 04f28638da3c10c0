//! MQTT 3.1.1 control packet encoding and decoding.
//!
//! Encode functions append complete packets (or packet prefixes) to a caller
//! buffer. Decoding works on a fixed header byte plus the packet body and
//! borrows topic and payload slices straight from the input, so the read loop
//! never copies an inbound message before dispatch.

use crate::error::ProtocolError;
use crate::varint;

/// Largest remaining length a packet may declare, per MQTT-2.2.3.
pub const PACKET_MAX: usize = varint::MAX;

/// DUP flag in the PUBLISH fixed header.
pub const DUP_FLAG: u8 = 0b1000;
/// RETAIN flag in the PUBLISH fixed header.
pub const RETAIN_FLAG: u8 = 0b0001;

/// MQTT control packet types (the high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::ReservedPacketType(value)),
        }
    }
}

/// Delivery guarantee grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::ReservedQos),
        }
    }
}

/// CONNACK return codes, per MQTT-3.2.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturn {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturn {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(ConnectReturn::Accepted),
            1 => Ok(ConnectReturn::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturn::IdentifierRejected),
            3 => Ok(ConnectReturn::ServerUnavailable),
            4 => Ok(ConnectReturn::BadCredentials),
            5 => Ok(ConnectReturn::NotAuthorized),
            _ => Err(ProtocolError::ReservedConnectReturn(value)),
        }
    }
}

impl std::fmt::Display for ConnectReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectReturn::Accepted => "connection accepted",
            ConnectReturn::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturn::IdentifierRejected => "client identifier rejected",
            ConnectReturn::ServerUnavailable => "server unavailable",
            ConnectReturn::BadCredentials => "bad user name or password",
            ConnectReturn::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Will message the server publishes when the session ends ungracefully.
#[derive(Debug, Clone)]
pub struct Will {
    /// Topic to publish the will under.
    pub topic: String,
    /// Will payload.
    pub message: Vec<u8>,
    /// Delivery grade for the will publication.
    pub qos: QoS,
    /// Whether the server retains the will message.
    pub retain: bool,
}

impl Will {
    /// New will with at-most-once delivery and no retention.
    pub fn new(topic: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the delivery grade.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the retain flag.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Session parameters for one CONNECT packet.
#[derive(Debug, Clone, Copy)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub user_name: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will: Option<&'a Will>,
    pub clean_session: bool,
    pub keep_alive: u16,
}

/// Reject strings MQTT cannot carry: U+0000 anywhere, or more than 65535
/// bytes once encoded (MQTT-1.5.3).
pub fn string_check(s: &str) -> Result<(), ProtocolError> {
    if s.len() > u16::MAX as usize || s.bytes().any(|b| b == 0) {
        return Err(ProtocolError::StringInvalid);
    }
    Ok(())
}

fn write_prefixed(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Append a CONNECT packet: protocol name "MQTT", level 4, flags per the
/// supplied session parameters, then the length-prefixed payload fields in
/// the order MQTT-3.1.3 requires.
pub fn encode_connect(c: &Connect<'_>, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    string_check(c.client_id)?;

    let mut flags = 0u8;
    let mut remaining = 10 + 2 + c.client_id.len();
    if let Some(w) = c.will {
        string_check(&w.topic)?;
        if w.message.len() > u16::MAX as usize {
            return Err(ProtocolError::StringInvalid);
        }
        remaining += 2 + w.topic.len() + 2 + w.message.len();
        flags |= 1 << 2;
        flags |= (w.qos as u8) << 3;
        if w.retain {
            flags |= 1 << 5;
        }
    }
    if let Some(u) = c.user_name {
        string_check(u)?;
        remaining += 2 + u.len();
        flags |= 1 << 7;
    }
    if let Some(p) = c.password {
        if p.len() > u16::MAX as usize {
            return Err(ProtocolError::StringInvalid);
        }
        remaining += 2 + p.len();
        flags |= 1 << 6;
    }
    if c.clean_session {
        flags |= 1 << 1;
    }
    if remaining > PACKET_MAX {
        return Err(ProtocolError::PacketTooLarge);
    }

    buf.push((PacketType::Connect as u8) << 4);
    varint::encode(remaining, buf);
    buf.extend_from_slice(&[0, 4, b'M', b'Q', b'T', b'T', 4, flags]);
    buf.extend_from_slice(&c.keep_alive.to_be_bytes());
    write_prefixed(c.client_id.as_bytes(), buf);
    if let Some(w) = c.will {
        write_prefixed(w.topic.as_bytes(), buf);
        write_prefixed(&w.message, buf);
    }
    if let Some(u) = c.user_name {
        write_prefixed(u.as_bytes(), buf);
    }
    if let Some(p) = c.password {
        write_prefixed(p, buf);
    }
    Ok(())
}

/// Append a PUBLISH packet up to and including the topic name.
///
/// The remaining length covers the full packet, yet neither the packet
/// identifier nor the payload is written: for QoS 1 and 2 the caller appends
/// the two identifier bytes once assigned, and the payload travels as a
/// separate buffer in a scatter write.
pub fn publish_header(
    topic: &str,
    payload_len: usize,
    qos: QoS,
    retain: bool,
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    string_check(topic)?;
    let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = (2 + topic.len() + id_len)
        .checked_add(payload_len)
        .ok_or(ProtocolError::PacketTooLarge)?;
    if remaining > PACKET_MAX {
        return Err(ProtocolError::PacketTooLarge);
    }

    let mut first = (PacketType::Publish as u8) << 4 | (qos as u8) << 1;
    if retain {
        first |= RETAIN_FLAG;
    }
    buf.push(first);
    varint::encode(remaining, buf);
    write_prefixed(topic.as_bytes(), buf);
    Ok(())
}

/// Append a SUBSCRIBE packet requesting exactly-once delivery on every
/// filter. Delivery still happens at the grade of each publication; the
/// request merely avoids a downgrade at the subscription.
pub fn encode_subscribe(
    packet_id: u16,
    topic_filters: &[&str],
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let mut remaining = 2;
    for filter in topic_filters {
        string_check(filter)?;
        remaining += 2 + filter.len() + 1;
    }
    if remaining > PACKET_MAX {
        return Err(ProtocolError::PacketTooLarge);
    }

    buf.push((PacketType::Subscribe as u8) << 4 | 0x02);
    varint::encode(remaining, buf);
    buf.extend_from_slice(&packet_id.to_be_bytes());
    for filter in topic_filters {
        write_prefixed(filter.as_bytes(), buf);
        buf.push(QoS::ExactlyOnce as u8);
    }
    Ok(())
}

/// Append an UNSUBSCRIBE packet.
pub fn encode_unsubscribe(
    packet_id: u16,
    topic_filters: &[&str],
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let mut remaining = 2;
    for filter in topic_filters {
        string_check(filter)?;
        remaining += 2 + filter.len();
    }
    if remaining > PACKET_MAX {
        return Err(ProtocolError::PacketTooLarge);
    }

    buf.push((PacketType::Unsubscribe as u8) << 4 | 0x02);
    varint::encode(remaining, buf);
    buf.extend_from_slice(&packet_id.to_be_bytes());
    for filter in topic_filters {
        write_prefixed(filter.as_bytes(), buf);
    }
    Ok(())
}

/// Append a two-byte acknowledgement packet (PUBACK, PUBREC, PUBREL or
/// PUBCOMP). PUBREL carries the mandatory 0x02 header flags (MQTT-3.6.1-1).
pub fn encode_ack(packet_type: PacketType, packet_id: u16, buf: &mut Vec<u8>) {
    let flags = if packet_type == PacketType::Pubrel {
        0x02
    } else {
        0
    };
    buf.push((packet_type as u8) << 4 | flags);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

/// The complete PINGREQ packet.
pub const PINGREQ: [u8; 2] = [(PacketType::Pingreq as u8) << 4, 0];

/// The complete DISCONNECT packet.
pub const DISCONNECT: [u8; 2] = [(PacketType::Disconnect as u8) << 4, 0];

/// One inbound server-to-client packet, borrowed from the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
        topic: &'a str,
        /// Absent for at-most-once deliveries.
        packet_id: Option<u16>,
        payload: &'a [u8],
    },
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Suback {
        packet_id: u16,
        return_codes: &'a [u8],
    },
    Unsuback { packet_id: u16 },
    Pingresp,
}

/// Decode one inbound packet from its fixed-header byte and body.
///
/// Client-originated packet types, CONNACK, and the reserved type codes all
/// fail here; the caller treats any error as a protocol reset.
pub fn decode_packet(first_byte: u8, body: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    let packet_type = PacketType::try_from(first_byte >> 4)?;
    match packet_type {
        PacketType::Publish => decode_publish(first_byte & 0x0F, body),
        PacketType::Puback => Ok(Packet::Puback {
            packet_id: ack_id("publish acknowledgement", body)?,
        }),
        PacketType::Pubrec => Ok(Packet::Pubrec {
            packet_id: ack_id("publish received", body)?,
        }),
        PacketType::Pubrel => Ok(Packet::Pubrel {
            packet_id: ack_id("publish release", body)?,
        }),
        PacketType::Pubcomp => Ok(Packet::Pubcomp {
            packet_id: ack_id("publish complete", body)?,
        }),
        PacketType::Suback => {
            if body.len() < 3 {
                return Err(ProtocolError::SizeMismatch {
                    kind: "subscribe acknowledgement",
                    got: body.len(),
                });
            }
            Ok(Packet::Suback {
                packet_id: u16::from_be_bytes([body[0], body[1]]),
                return_codes: &body[2..],
            })
        }
        PacketType::Unsuback => Ok(Packet::Unsuback {
            packet_id: ack_id("unsubscribe acknowledgement", body)?,
        }),
        PacketType::Pingresp => {
            if !body.is_empty() {
                return Err(ProtocolError::SizeMismatch {
                    kind: "ping response",
                    got: body.len(),
                });
            }
            Ok(Packet::Pingresp)
        }
        PacketType::Connack => Err(ProtocolError::StrayConnack),
        PacketType::Connect
        | PacketType::Subscribe
        | PacketType::Unsubscribe
        | PacketType::Pingreq
        | PacketType::Disconnect => Err(ProtocolError::UnexpectedPacketType(packet_type as u8)),
    }
}

fn ack_id(kind: &'static str, body: &[u8]) -> Result<u16, ProtocolError> {
    if body.len() != 2 {
        return Err(ProtocolError::SizeMismatch {
            kind,
            got: body.len(),
        });
    }
    Ok(u16::from_be_bytes([body[0], body[1]]))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet<'_>, ProtocolError> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let dup = flags & DUP_FLAG != 0;
    let retain = flags & RETAIN_FLAG != 0;

    if body.len() < 2 {
        return Err(ProtocolError::SizeMismatch {
            kind: "publish",
            got: body.len(),
        });
    }
    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
    if body.len() < 2 + topic_len + id_len {
        return Err(ProtocolError::SizeMismatch {
            kind: "publish",
            got: body.len(),
        });
    }

    let topic_bytes = &body[2..2 + topic_len];
    if topic_bytes.contains(&0) {
        return Err(ProtocolError::TopicInvalid);
    }
    let topic = std::str::from_utf8(topic_bytes).map_err(|_| ProtocolError::TopicInvalid)?;

    let mut at = 2 + topic_len;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        let id = u16::from_be_bytes([body[at], body[at + 1]]);
        at += 2;
        Some(id)
    };

    Ok(Packet::Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: &body[at..],
    })
}
