//! MQTT 3.1 / 3.1.1 control packet codec
//!
//! Typed control packets plus their wire encoding. The client core never
//! touches packet bytes directly: it builds [`Packet`] values, hands them to a
//! [`PacketWriter`], and receives them back from a [`PacketReader`]. The
//! durable store persists packets in their encoded form via
//! [`Packet::to_bytes`] / [`Packet::from_bytes`].

pub mod codec;
pub mod io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use codec::{
    decode_remaining_length, encode_remaining_length, read_binary, read_string, read_u16,
    read_u8, write_binary, write_string,
};
use std::fmt;
use thiserror::Error;

pub use io::{PacketReader, PacketWriter};
pub use rumqttc::mqttbytes::QoS;

/// Codec errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    #[error("Packet too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Invalid packet type: {0:#04x}")]
    InvalidPacketType(u8),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert a wire QoS value into [`QoS`]
pub fn qos_from_u8(value: u8) -> Result<QoS, PacketError> {
    match value {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(PacketError::InvalidQos(other)),
    }
}

/// Protocol revision sent in CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name "MQIsdp", level 3
    V31,
    /// MQTT 3.1.1, protocol name "MQTT", level 4
    V311,
}

impl ProtocolVersion {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            3 => Some(ProtocolVersion::V31),
            4 => Some(ProtocolVersion::V311),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
        }
    }

    pub fn protocol_name(self) -> &'static str {
        match self {
            ProtocolVersion::V31 => "MQIsdp",
            ProtocolVersion::V311 => "MQTT",
        }
    }
}

/// CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
    Reserved(u8),
}

impl ConnectReturnCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Reserved(code) => code,
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "connection accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                write!(f, "connection refused: unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => {
                write!(f, "connection refused: identifier rejected")
            }
            ConnectReturnCode::ServerUnavailable => {
                write!(f, "connection refused: server unavailable")
            }
            ConnectReturnCode::BadUsernameOrPassword => {
                write!(f, "connection refused: bad user name or password")
            }
            ConnectReturnCode::NotAuthorized => write!(f, "connection refused: not authorized"),
            ConnectReturnCode::Reserved(code) => {
                write!(f, "connection refused: reserved return code {code}")
            }
        }
    }
}

/// Will message registered with the broker at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub protocol: ProtocolVersion,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Zero for QoS 0 publications
    pub message_id: u16,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, retain: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            message_id: 0,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub message_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub message_id: u16,
    /// Granted QoS per filter, 0x80 for a rejected filter
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub filters: Vec<String>,
}

/// MQTT control packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { message_id: u16 },
    PubRec { message_id: u16 },
    PubRel { message_id: u16 },
    PubComp { message_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { message_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::PubRec { .. } => "PUBREC",
            Packet::PubRel { .. } => "PUBREL",
            Packet::PubComp { .. } => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Packet identifier, if this packet type carries one
    pub fn message_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.message_id),
            Packet::PubAck { message_id }
            | Packet::PubRec { message_id }
            | Packet::PubRel { message_id }
            | Packet::PubComp { message_id }
            | Packet::UnsubAck { message_id } => Some(*message_id),
            Packet::Subscribe(s) => Some(s.message_id),
            Packet::SubAck(s) => Some(s.message_id),
            Packet::Unsubscribe(u) => Some(u.message_id),
            _ => None,
        }
    }

    /// Whether delivery of this outbound packet is confirmed by an acknowledgement
    /// keyed on its message id
    pub fn requires_ack(&self) -> bool {
        match self {
            Packet::Publish(p) => p.qos != QoS::AtMostOnce,
            Packet::Subscribe(_) | Packet::Unsubscribe(_) | Packet::PubRel { .. } => true,
            _ => false,
        }
    }

    pub fn set_message_id(&mut self, id: u16) {
        match self {
            Packet::Publish(p) => p.message_id = id,
            Packet::Subscribe(s) => s.message_id = id,
            Packet::Unsubscribe(u) => u.message_id = id,
            Packet::PubAck { message_id }
            | Packet::PubRec { message_id }
            | Packet::PubRel { message_id }
            | Packet::PubComp { message_id }
            | Packet::UnsubAck { message_id } => *message_id = id,
            Packet::SubAck(s) => s.message_id = id,
            _ => {}
        }
    }

    /// Append the wire encoding of this packet to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), PacketError> {
        let mut body = BytesMut::new();
        let first_byte = match self {
            Packet::Connect(connect) => {
                encode_connect(connect, &mut body);
                0x10
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.return_code.as_u8());
                0x20
            }
            Packet::Publish(publish) => {
                write_string(&mut body, &publish.topic);
                if publish.qos != QoS::AtMostOnce {
                    body.put_u16(publish.message_id);
                }
                body.put_slice(&publish.payload);
                0x30 | (u8::from(publish.dup) << 3)
                    | ((publish.qos as u8) << 1)
                    | u8::from(publish.retain)
            }
            Packet::PubAck { message_id } => {
                body.put_u16(*message_id);
                0x40
            }
            Packet::PubRec { message_id } => {
                body.put_u16(*message_id);
                0x50
            }
            Packet::PubRel { message_id } => {
                body.put_u16(*message_id);
                0x62
            }
            Packet::PubComp { message_id } => {
                body.put_u16(*message_id);
                0x70
            }
            Packet::Subscribe(subscribe) => {
                body.put_u16(subscribe.message_id);
                for (filter, qos) in &subscribe.filters {
                    write_string(&mut body, filter);
                    body.put_u8(*qos as u8);
                }
                0x82
            }
            Packet::SubAck(suback) => {
                body.put_u16(suback.message_id);
                body.put_slice(&suback.return_codes);
                0x90
            }
            Packet::Unsubscribe(unsubscribe) => {
                body.put_u16(unsubscribe.message_id);
                for filter in &unsubscribe.filters {
                    write_string(&mut body, filter);
                }
                0xA2
            }
            Packet::UnsubAck { message_id } => {
                body.put_u16(*message_id);
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        buf.reserve(body.len() + 5);
        buf.put_u8(first_byte);
        encode_remaining_length(body.len(), buf)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, PacketError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one packet from a complete encoded frame
    pub fn from_bytes(raw: &[u8]) -> Result<Packet, PacketError> {
        let mut buf = BytesMut::from(raw);
        match Packet::decode(&mut buf)? {
            Some(packet) if buf.is_empty() => Ok(packet),
            Some(_) => Err(PacketError::Malformed(
                "trailing bytes after packet".to_string(),
            )),
            None => Err(PacketError::Malformed("incomplete packet".to_string())),
        }
    }

    /// Decode the next packet from the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when a full frame has not
    /// arrived yet; on success the frame is consumed from `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (remaining, len_bytes) = match decode_remaining_length(&buf[1..])? {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        let frame_len = 1 + len_bytes + remaining;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let first_byte = buf[0];
        let mut body = buf.split_to(frame_len).freeze();
        body.advance(1 + len_bytes);
        decode_body(first_byte, body).map(Some)
    }

    /// Size of the remaining-length payload of a frame whose header is at the
    /// front of `buf`, if enough bytes have arrived to tell
    pub fn peek_remaining_length(buf: &[u8]) -> Result<Option<usize>, PacketError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        Ok(decode_remaining_length(&buf[1..])?.map(|(len, _)| len))
    }
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) {
    write_string(body, connect.protocol.protocol_name());
    body.put_u8(connect.protocol.level());

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    write_string(body, &connect.client_id);
    if let Some(will) = &connect.will {
        write_string(body, &will.topic);
        write_binary(body, &will.payload);
    }
    if let Some(username) = &connect.username {
        write_string(body, username);
    }
    if let Some(password) = &connect.password {
        write_binary(body, password);
    }
}

fn decode_connect(mut body: Bytes) -> Result<Connect, PacketError> {
    let name = read_string(&mut body)?;
    let level = read_u8(&mut body)?;
    let protocol = match (name.as_str(), ProtocolVersion::from_level(level)) {
        ("MQTT", Some(ProtocolVersion::V311)) => ProtocolVersion::V311,
        ("MQIsdp", Some(ProtocolVersion::V31)) => ProtocolVersion::V31,
        _ => {
            return Err(PacketError::Malformed(format!(
                "unsupported protocol {name} level {level}"
            )))
        }
    };
    let flags = read_u8(&mut body)?;
    let keep_alive = read_u16(&mut body)?;
    let client_id = read_string(&mut body)?;

    let will = if flags & 0x04 != 0 {
        let topic = read_string(&mut body)?;
        let payload = read_binary(&mut body)?;
        Some(LastWill {
            topic,
            payload,
            qos: qos_from_u8((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(&mut body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(&mut body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol,
        client_id,
        keep_alive,
        clean_session: flags & 0x02 != 0,
        will,
        username,
        password,
    })
}

fn decode_body(first_byte: u8, mut body: Bytes) -> Result<Packet, PacketError> {
    let flags = first_byte & 0x0F;
    let packet = match first_byte >> 4 {
        1 => Packet::Connect(decode_connect(body)?),
        2 => {
            let ack_flags = read_u8(&mut body)?;
            let code = read_u8(&mut body)?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                return_code: ConnectReturnCode::from_u8(code),
            })
        }
        3 => {
            let qos = qos_from_u8((flags >> 1) & 0x03)?;
            let topic = read_string(&mut body)?;
            let message_id = if qos != QoS::AtMostOnce {
                read_u16(&mut body)?
            } else {
                0
            };
            Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                message_id,
                payload: body,
            })
        }
        4 => Packet::PubAck {
            message_id: read_u16(&mut body)?,
        },
        5 => Packet::PubRec {
            message_id: read_u16(&mut body)?,
        },
        6 => Packet::PubRel {
            message_id: read_u16(&mut body)?,
        },
        7 => Packet::PubComp {
            message_id: read_u16(&mut body)?,
        },
        8 => {
            let message_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body)?;
                let qos = qos_from_u8(read_u8(&mut body)? & 0x03)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(PacketError::Malformed("SUBSCRIBE without filters".to_string()));
            }
            Packet::Subscribe(Subscribe {
                message_id,
                filters,
            })
        }
        9 => {
            let message_id = read_u16(&mut body)?;
            Packet::SubAck(SubAck {
                message_id,
                return_codes: body.to_vec(),
            })
        }
        10 => {
            let message_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(&mut body)?);
            }
            Packet::Unsubscribe(Unsubscribe {
                message_id,
                filters,
            })
        }
        11 => Packet::UnsubAck {
            message_id: read_u16(&mut body)?,
        },
        12 => Packet::PingReq,
        13 => Packet::PingResp,
        14 => Packet::Disconnect,
        _ => return Err(PacketError::InvalidPacketType(first_byte)),
    };
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(packet: Packet) -> Packet {
        let bytes = packet.to_bytes().unwrap();
        Packet::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_connect_v311_header() {
        let connect = Connect {
            protocol: ProtocolVersion::V311,
            client_id: "abc".to_string(),
            keep_alive: 30,
            clean_session: true,
            will: None,
            username: None,
            password: None,
        };
        let bytes = Packet::Connect(connect).to_bytes().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[
                0x10, 15, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 30, 0x00, 0x03,
                b'a', b'b', b'c'
            ]
        );
    }

    #[test]
    fn test_connect_v31_uses_mqisdp() {
        let connect = Connect {
            protocol: ProtocolVersion::V31,
            client_id: "c".to_string(),
            keep_alive: 0,
            clean_session: false,
            will: None,
            username: None,
            password: None,
        };
        let bytes = Packet::Connect(connect.clone()).to_bytes().unwrap();
        assert_eq!(&bytes[4..10], b"MQIsdp");
        assert_eq!(bytes[10], 3);
        assert_eq!(roundtrip(Packet::Connect(connect.clone())), Packet::Connect(connect));
    }

    #[test]
    fn test_connect_with_will_and_credentials() {
        let connect = Connect {
            protocol: ProtocolVersion::V311,
            client_id: "will-client".to_string(),
            keep_alive: 60,
            clean_session: true,
            will: Some(LastWill::new("status/offline", "gone", QoS::AtLeastOnce, true)),
            username: Some("user".to_string()),
            password: Some(Bytes::from_static(b"secret")),
        };
        let bytes = Packet::Connect(connect.clone()).to_bytes().unwrap();
        // username | password | will retain | will qos 1 | will flag | clean session
        assert_eq!(bytes[11], 0x80 | 0x40 | 0x20 | 0x08 | 0x04 | 0x02);
        assert_eq!(roundtrip(Packet::Connect(connect.clone())), Packet::Connect(connect));
    }

    #[test]
    fn test_publish_flags() {
        let mut publish = Publish::new("a/b", QoS::ExactlyOnce, true, "hi");
        publish.dup = true;
        publish.message_id = 7;
        let bytes = Packet::Publish(publish.clone()).to_bytes().unwrap();
        assert_eq!(bytes[0], 0x30 | 0x08 | 0x04 | 0x01);
        assert_eq!(roundtrip(Packet::Publish(publish.clone())), Packet::Publish(publish));
    }

    #[test]
    fn test_qos0_publish_has_no_message_id() {
        let publish = Publish::new("t", QoS::AtMostOnce, false, Bytes::new());
        let bytes = Packet::Publish(publish).to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0x30, 3, 0x00, 0x01, b't']);
    }

    #[test]
    fn test_control_packets_reserved_flags() {
        let subscribe = Packet::Subscribe(Subscribe {
            message_id: 1,
            filters: vec![("a/#".to_string(), QoS::AtLeastOnce)],
        });
        assert_eq!(subscribe.to_bytes().unwrap()[0], 0x82);
        assert_eq!(Packet::PubRel { message_id: 1 }.to_bytes().unwrap()[0], 0x62);
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            message_id: 1,
            filters: vec!["a/#".to_string()],
        });
        assert_eq!(unsubscribe.to_bytes().unwrap()[0], 0xA2);
        assert_eq!(Packet::PingReq.to_bytes().unwrap().as_ref(), &[0xC0, 0x00]);
        assert_eq!(Packet::Disconnect.to_bytes().unwrap().as_ref(), &[0xE0, 0x00]);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let bytes = Packet::PubAck { message_id: 42 }.to_bytes().unwrap();
        let mut buf = BytesMut::from(&bytes[..3]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&bytes[3..]);
        buf.extend_from_slice(&[0xD0, 0x00]);
        assert_eq!(
            Packet::decode(&mut buf).unwrap(),
            Some(Packet::PubAck { message_id: 42 })
        );
        assert_eq!(Packet::decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_reserved_type() {
        let mut buf = BytesMut::from(&[0xF0u8, 0x00][..]);
        assert!(matches!(
            Packet::decode(&mut buf),
            Err(PacketError::InvalidPacketType(0xF0))
        ));
    }

    #[test]
    fn test_decode_rejects_qos3_publish() {
        let mut buf = BytesMut::from(&[0x36u8, 0x03, 0x00, 0x01, b't'][..]);
        assert!(matches!(
            Packet::decode(&mut buf),
            Err(PacketError::InvalidQos(3))
        ));
    }

    #[test]
    fn test_suback_return_codes() {
        let suback = Packet::SubAck(SubAck {
            message_id: 9,
            return_codes: vec![0x00, 0x01, 0x80],
        });
        assert_eq!(roundtrip(suback.clone()), suback);
    }

    #[test]
    fn test_requires_ack() {
        assert!(!Packet::Publish(Publish::new("t", QoS::AtMostOnce, false, "x")).requires_ack());
        assert!(Packet::Publish(Publish::new("t", QoS::AtLeastOnce, false, "x")).requires_ack());
        assert!(Packet::PubRel { message_id: 3 }.requires_ack());
        assert!(!Packet::PubAck { message_id: 3 }.requires_ack());
        assert!(!Packet::Disconnect.requires_ack());
    }

    #[test]
    fn test_connect_return_code_display() {
        assert_eq!(ConnectReturnCode::from_u8(5), ConnectReturnCode::NotAuthorized);
        assert_eq!(ConnectReturnCode::from_u8(9).as_u8(), 9);
        assert!(ConnectReturnCode::NotAuthorized
            .to_string()
            .contains("not authorized"));
    }

    proptest! {
        #[test]
        fn publish_survives_arbitrary_payloads(
            topic in "[a-z/]{1,32}",
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            message_id in 1u16..,
        ) {
            let mut publish = Publish::new(topic, QoS::AtLeastOnce, false, payload);
            publish.message_id = message_id;
            let packet = Packet::Publish(publish);
            prop_assert_eq!(roundtrip(packet.clone()), packet);
        }

        #[test]
        fn decode_never_panics_on_garbage(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut buf = BytesMut::from(&raw[..]);
            let _ = Packet::decode(&mut buf);
        }
    }
}
