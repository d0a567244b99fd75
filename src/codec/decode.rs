//! MQTT v3.1.1 Packet Decoder

use bytes::Bytes;

use super::{decode_length, take_bytes, take_str, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, SubAck, SubAckCode, Subscribe, SubscribeFilter,
    UnsubAck, Unsubscribe, Will,
};
use crate::topic::check_topic_name;

/// Streaming packet decoder.
///
/// `decode` returns `Ok(None)` while the buffer holds an incomplete frame,
/// so callers can keep reading from the socket and retry.
pub struct Decoder {
    /// Largest accepted body size
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode one packet from the front of the buffer.
    /// Returns (packet, bytes consumed), `None` if incomplete, or an error.
    pub fn decode(&self, input: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&control) = input.first() else {
            return Ok(None);
        };

        let (body_len, len_field) = match decode_length(&input[1..]) {
            Ok(pair) => pair,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body_len = body_len as usize;

        if body_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let frame_len = 1 + len_field + body_len;
        if input.len() < frame_len {
            return Ok(None);
        }
        let body = &input[1 + len_field..frame_len];

        let kind = PacketType::from_u8(control >> 4)
            .ok_or(DecodeError::InvalidPacketType(control >> 4))?;
        let flags = control & 0x0F;

        let packet = match kind {
            PacketType::Connect => decode_connect(flags, body)?,
            PacketType::ConnAck => decode_connack(flags, body)?,
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::PubAck => Packet::PubAck(PubAck {
                packet_id: packet_id_body(flags, 0, body)?,
            }),
            PacketType::PubRec => Packet::PubRec(PubRec {
                packet_id: packet_id_body(flags, 0, body)?,
            }),
            // PUBREL carries the reserved flag pattern 0010
            PacketType::PubRel => Packet::PubRel(PubRel {
                packet_id: packet_id_body(flags, 0x02, body)?,
            }),
            PacketType::PubComp => Packet::PubComp(PubComp {
                packet_id: packet_id_body(flags, 0, body)?,
            }),
            PacketType::Subscribe => decode_subscribe(flags, body)?,
            PacketType::SubAck => decode_suback(flags, body)?,
            PacketType::Unsubscribe => decode_unsubscribe(flags, body)?,
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck {
                packet_id: packet_id_body(flags, 0, body)?,
            }),
            PacketType::PingReq => {
                require_flags(flags, 0)?;
                Packet::PingReq
            }
            PacketType::PingResp => {
                require_flags(flags, 0)?;
                Packet::PingResp
            }
            PacketType::Disconnect => {
                require_flags(flags, 0)?;
                Packet::Disconnect
            }
        };

        Ok(Some((packet, frame_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn require_flags(actual: u8, expected: u8) -> Result<(), DecodeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidFlags)
    }
}

fn be_u16(body: &[u8], at: usize) -> Result<u16, DecodeError> {
    body.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DecodeError::InsufficientData)
}

/// Body of the four ack packets and UNSUBACK: flags check + packet id
fn packet_id_body(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    require_flags(flags, expected_flags)?;
    be_u16(body, 0)
}

fn nonzero_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    match be_u16(body, 0)? {
        0 => Err(DecodeError::MalformedPacket("packet id 0")),
        id => Ok(id),
    }
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    require_flags(flags, 0)?;

    let (name, mut offset) = take_str(body)?;

    let level = *body.get(offset).ok_or(DecodeError::InsufficientData)?;
    offset += 1;

    // the protocol name and level must agree
    let protocol_version = match (name, level) {
        ("MQTT", 4) => ProtocolVersion::V311,
        ("MQIsdp", 3) => ProtocolVersion::V31,
        ("MQTT" | "MQIsdp", other) => {
            return Err(DecodeError::UnsupportedProtocolVersion(other))
        }
        _ => return Err(DecodeError::InvalidProtocolName),
    };

    let connect_flags = *body.get(offset).ok_or(DecodeError::InsufficientData)?;
    offset += 1;

    if connect_flags & 0x01 != 0 {
        return Err(DecodeError::InvalidFlags); // reserved bit
    }
    let clean_session = connect_flags & 0x02 != 0;
    let has_will = connect_flags & 0x04 != 0;
    let will_qos_bits = (connect_flags >> 3) & 0x03;
    let will_retain = connect_flags & 0x20 != 0;
    let has_password = connect_flags & 0x40 != 0;
    let has_username = connect_flags & 0x80 != 0;

    // [MQTT-3.1.2-22] a password is only legal alongside a username
    if has_password && !has_username {
        return Err(DecodeError::InvalidFlags);
    }
    // the will bits must be clear when no will is present
    if !has_will && (will_qos_bits != 0 || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }
    let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

    let keep_alive = be_u16(body, offset)?;
    offset += 2;

    let (client_id, consumed) = take_str(&body[offset..])?;
    offset += consumed;

    let will = if has_will {
        let (will_topic, consumed) = take_str(&body[offset..])?;
        offset += consumed;
        check_topic_name(will_topic).map_err(DecodeError::InvalidTopic)?;

        let (will_payload, consumed) = take_bytes(&body[offset..])?;
        offset += consumed;

        Some(Will {
            topic: will_topic.to_string(),
            payload: Bytes::copy_from_slice(will_payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if has_username {
        let (user, consumed) = take_str(&body[offset..])?;
        offset += consumed;
        Some(user.to_string())
    } else {
        None
    };

    let password = if has_password {
        let (pass, _) = take_bytes(&body[offset..])?;
        Some(Bytes::copy_from_slice(pass))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        protocol_version,
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    require_flags(flags, 0)?;

    let ack_flags = *body.first().ok_or(DecodeError::InsufficientData)?;
    // only bit 0 (session present) is defined
    if ack_flags & !0x01 != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let code = *body.get(1).ok_or(DecodeError::InsufficientData)?;
    let return_code =
        ConnectReturnCode::from_u8(code).ok_or(DecodeError::InvalidReturnCode(code))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let retain = flags & 0x01 != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let dup = flags & 0x08 != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    if dup && qos == QoS::AtMostOnce {
        return Err(DecodeError::MalformedPacket("DUP set on a QoS 0 publish"));
    }

    let (topic, mut offset) = take_str(body)?;
    check_topic_name(topic).map_err(DecodeError::InvalidTopic)?;

    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => {
            let id = be_u16(body, offset)?;
            offset += 2;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id 0"));
            }
            Some(id)
        }
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(&body[offset..]),
    }))
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // SUBSCRIBE carries the reserved flag pattern 0010
    require_flags(flags, 0x02)?;

    let packet_id = nonzero_packet_id(body)?;
    let mut rest = &body[2..];

    let mut filters = Vec::new();
    while !rest.is_empty() {
        let (filter, consumed) = take_str(rest)?;
        rest = &rest[consumed..];

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("empty topic filter"));
        }

        let (&qos_byte, tail) = rest.split_first().ok_or(DecodeError::InsufficientData)?;
        rest = tail;

        // the upper six bits of the requested-QoS byte are reserved
        if qos_byte & !0x03 != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;

        filters.push(SubscribeFilter {
            filter: filter.to_string(),
            qos,
        });
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE carries no filters"));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    require_flags(flags, 0)?;

    let packet_id = be_u16(body, 0)?;
    let codes = &body[2..];
    if codes.is_empty() {
        return Err(DecodeError::InsufficientData);
    }

    let return_codes = codes
        .iter()
        .map(|&c| SubAckCode::from_u8(c).ok_or(DecodeError::InvalidSubAckCode(c)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // UNSUBSCRIBE carries the reserved flag pattern 0010
    require_flags(flags, 0x02)?;

    let packet_id = nonzero_packet_id(body)?;
    let mut rest = &body[2..];

    let mut filters = Vec::new();
    while !rest.is_empty() {
        let (filter, consumed) = take_str(rest)?;
        rest = &rest[consumed..];

        if filter.is_empty() {
            return Err(DecodeError::MalformedPacket("empty topic filter"));
        }
        filters.push(filter.to_string());
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE carries no filters",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
