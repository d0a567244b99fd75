//! MQTT v3.1.1 Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{encode_length, put_bytes, put_str};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};

/// MQTT packet encoder
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_ack(0x40, p.packet_id, buf),
            Packet::PubRec(p) => encode_ack(0x50, p.packet_id, buf),
            // PUBREL carries the reserved flag pattern 0010
            Packet::PubRel(p) => encode_ack(0x62, p.packet_id, buf),
            Packet::PubComp(p) => encode_ack(0x70, p.packet_id, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_ack(0xB0, p.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }
}

/// Byte cost of a length-prefixed field
fn prefixed(len: usize) -> usize {
    2 + len
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let protocol_name = packet.protocol_version.protocol_name();

    // variable header: protocol name + level byte + flag byte + keep alive
    let mut body_len = prefixed(protocol_name.len()) + 1 + 1 + 2;
    body_len += prefixed(packet.client_id.len());
    if let Some(will) = &packet.will {
        body_len += prefixed(will.topic.len()) + prefixed(will.payload.len());
    }
    if let Some(username) = &packet.username {
        body_len += prefixed(username.len());
    }
    if let Some(password) = &packet.password {
        body_len += prefixed(password.len());
    }

    buf.put_u8(0x10);
    encode_length(buf, body_len)?;

    put_str(buf, protocol_name)?;
    buf.put_u8(packet.protocol_version as u8);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(will) = &packet.will {
        connect_flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);

    put_str(buf, &packet.client_id)?;
    if let Some(will) = &packet.will {
        put_str(buf, &will.topic)?;
        put_bytes(buf, &will.payload)?;
    }
    if let Some(username) = &packet.username {
        put_str(buf, username)?;
    }
    if let Some(password) = &packet.password {
        put_bytes(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02); // body length
    buf.put_u8(u8::from(packet.session_present));
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut body_len = prefixed(packet.topic.len()) + packet.payload.len();
    if packet.qos != QoS::AtMostOnce {
        body_len += 2; // packet identifier
    }

    let mut control: u8 = 0x30 | ((packet.qos as u8) << 1);
    if packet.dup {
        control |= 0x08;
    }
    if packet.retain {
        control |= 0x01;
    }
    buf.put_u8(control);
    encode_length(buf, body_len)?;

    put_str(buf, &packet.topic)?;
    if let Some(packet_id) = packet.packet_id {
        buf.put_u16(packet_id);
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

/// The four ack packets and UNSUBACK share one shape: control byte, fixed
/// body length 2, packet id
fn encode_ack(control: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(control);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let body_len = 2 + packet
        .filters
        .iter()
        .map(|f| prefixed(f.filter.len()) + 1)
        .sum::<usize>();

    buf.put_u8(0x82); // SUBSCRIBE + reserved flag pattern 0010
    encode_length(buf, body_len)?;

    buf.put_u16(packet.packet_id);
    for f in &packet.filters {
        put_str(buf, &f.filter)?;
        buf.put_u8(f.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x90);
    encode_length(buf, 2 + packet.return_codes.len())?;

    buf.put_u16(packet.packet_id);
    for code in &packet.return_codes {
        buf.put_u8(*code as u8);
    }

    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let body_len = 2 + packet
        .filters
        .iter()
        .map(|f| prefixed(f.len()))
        .sum::<usize>();

    buf.put_u8(0xA2); // UNSUBSCRIBE + reserved flag pattern 0010
    encode_length(buf, body_len)?;

    buf.put_u16(packet.packet_id);
    for f in &packet.filters {
        put_str(buf, f)?;
    }

    Ok(())
}
