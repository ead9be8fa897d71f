// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 packet codec.
//!
//! Only the packets needed for QoS 0/1 publish/subscribe are supported.
//!
//! Fixed header:
//! ```text
//! byte 0     : packet type (high nibble) | flags (low nibble)
//! bytes 1..5 : remaining length (7-bit varint, at most 4 bytes)
//! ```

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::broker::{BrokerError, ConnectOptions};

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// Largest remaining length expressible in four varint bytes.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// SUBACK return code for a rejected filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// An inbound or outbound PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    /// Present for QoS > 0.
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectOptions),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        let mut body = Vec::new();
        let first = match self {
            Packet::Connect(opts) => {
                put_str(&mut body, PROTOCOL_NAME)?;
                body.push(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if opts.clean_session {
                    flags |= 0x02;
                }
                if opts.username.is_some() {
                    flags |= 0x80;
                }
                if opts.password.is_some() {
                    flags |= 0x40;
                }
                body.push(flags);
                body.extend_from_slice(&opts.keep_alive_secs.to_be_bytes());
                put_str(&mut body, &opts.client_id)?;
                if let Some(user) = &opts.username {
                    put_str(&mut body, user)?;
                }
                if let Some(pass) = &opts.password {
                    put_str(&mut body, pass)?;
                }
                CONNECT << 4
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.push(u8::from(*session_present));
                body.push(*code);
                CONNACK << 4
            }
            Packet::Publish(p) => {
                if p.qos > 1 {
                    return Err(BrokerError::Protocol(format!(
                        "QoS {} publish not supported",
                        p.qos
                    )));
                }
                put_str(&mut body, &p.topic)?;
                let mut flags = p.qos << 1;
                if p.qos > 0 {
                    let id = p.packet_id.ok_or_else(|| {
                        BrokerError::Protocol("QoS 1 publish without packet id".to_string())
                    })?;
                    body.extend_from_slice(&id.to_be_bytes());
                }
                if p.dup {
                    flags |= 0x08;
                }
                if p.retain {
                    flags |= 0x01;
                }
                body.extend_from_slice(&p.payload);
                (PUBLISH << 4) | flags
            }
            Packet::PubAck { packet_id } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                PUBACK << 4
            }
            Packet::Subscribe { packet_id, filters } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                for (filter, qos) in filters {
                    put_str(&mut body, filter)?;
                    body.push(*qos);
                }
                (SUBSCRIBE << 4) | 0x02
            }
            Packet::SubAck { packet_id, codes } => {
                body.extend_from_slice(&packet_id.to_be_bytes());
                body.extend_from_slice(codes);
                SUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(BrokerError::Protocol(format!(
                "{} packet too large ({} bytes)",
                self.name(),
                body.len()
            )));
        }

        let mut out = Vec::with_capacity(body.len() + 5);
        out.push(first);
        put_remaining_length(&mut out, body.len());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), BrokerError> {
    let len = u16::try_from(s.len())
        .map_err(|_| BrokerError::Protocol(format!("string too long ({} bytes)", s.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Read one packet from an async stream.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, BrokerError> {
    let first = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(BrokerError::ConnectionLost(
                "connection closed by broker".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let mut len = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(BrokerError::Protocol("malformed remaining length".to_string()));
        }
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(first, &body)
}

/// Decode a packet body given its first header byte.
pub fn decode(first: u8, body: &[u8]) -> Result<Packet, BrokerError> {
    let kind = first >> 4;
    let flags = first & 0x0F;
    let mut cur = Cursor { buf: body, pos: 0 };

    let packet = match kind {
        CONNECT => {
            let name = cur.string()?;
            let level = cur.u8()?;
            if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
                return Err(BrokerError::Protocol(format!(
                    "unsupported protocol {} level {}",
                    name, level
                )));
            }
            let connect_flags = cur.u8()?;
            let keep_alive_secs = cur.u16()?;
            let client_id = cur.string()?;
            let username = if connect_flags & 0x80 != 0 {
                Some(cur.string()?)
            } else {
                None
            };
            let password = if connect_flags & 0x40 != 0 {
                Some(cur.string()?)
            } else {
                None
            };
            Packet::Connect(ConnectOptions {
                client_id,
                clean_session: connect_flags & 0x02 != 0,
                keep_alive_secs,
                username,
                password,
            })
        }
        CONNACK => Packet::ConnAck {
            session_present: cur.u8()? & 0x01 != 0,
            code: cur.u8()?,
        },
        PUBLISH => {
            let qos = (flags >> 1) & 0x03;
            if qos > 1 {
                return Err(BrokerError::Protocol(format!(
                    "QoS {} publish not supported",
                    qos
                )));
            }
            let topic = cur.string()?;
            let packet_id = if qos > 0 { Some(cur.u16()?) } else { None };
            Packet::Publish(Publish {
                topic,
                qos,
                packet_id,
                dup: flags & 0x08 != 0,
                retain: flags & 0x01 != 0,
                payload: cur.rest().to_vec(),
            })
        }
        PUBACK => Packet::PubAck {
            packet_id: cur.u16()?,
        },
        SUBSCRIBE => {
            let packet_id = cur.u16()?;
            let mut filters = Vec::new();
            while !cur.is_empty() {
                let filter = cur.string()?;
                let qos = cur.u8()?;
                filters.push((filter, qos));
            }
            Packet::Subscribe { packet_id, filters }
        }
        SUBACK => Packet::SubAck {
            packet_id: cur.u16()?,
            codes: cur.rest().to_vec(),
        },
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => {
            return Err(BrokerError::Protocol(format!(
                "unsupported packet type {}",
                other
            )))
        }
    };
    Ok(packet)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BrokerError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(BrokerError::Protocol("truncated packet".to_string()));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BrokerError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BrokerError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn string(&mut self) -> Result<String, BrokerError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| BrokerError::Protocol("invalid UTF-8 string".to_string()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Human-readable reason for a CONNACK return code.
pub fn connack_reason(code: u8) -> String {
    match code {
        0 => "accepted".to_string(),
        1 => "incorrect protocol version".to_string(),
        2 => "invalid client identifier".to_string(),
        3 => "server unavailable".to_string(),
        4 => "bad username or password".to_string(),
        5 => "not authorized".to_string(),
        other => format!("unknown return code {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reparse(packet: &Packet) -> Packet {
        let bytes = packet.encode().unwrap();
        let mut slice = bytes.as_slice();
        read_packet(&mut slice).await.unwrap()
    }

    #[test]
    fn test_connect_bytes() {
        let opts = ConnectOptions {
            client_id: "device_v1".to_string(),
            clean_session: false,
            keep_alive_secs: 60,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
        };
        let bytes = Packet::Connect(opts).encode().unwrap();
        assert_eq!(bytes[0], 0x10);
        // "MQTT" level 4, flags: username + password, no clean session
        assert_eq!(&bytes[2..10], &[0, 4, b'M', b'Q', b'T', b'T', 4, 0xC0]);
        assert_eq!(&bytes[10..12], &[0, 60]);
    }

    #[test]
    fn test_publish_qos1_bytes() {
        let packet = Packet::Publish(Publish {
            topic: "a/b".to_string(),
            qos: 1,
            packet_id: Some(7),
            dup: false,
            retain: false,
            payload: b"hi".to_vec(),
        });
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes, vec![0x32, 9, 0, 3, b'a', b'/', b'b', 0, 7, b'h', b'i']);
    }

    #[test]
    fn test_remaining_length_varint() {
        let mut out = Vec::new();
        put_remaining_length(&mut out, 321);
        assert_eq!(out, vec![0xC1, 0x02]);

        let mut out = Vec::new();
        put_remaining_length(&mut out, 127);
        assert_eq!(out, vec![0x7F]);
    }

    #[tokio::test]
    async fn test_large_publish_reparses() {
        let packet = Packet::Publish(Publish {
            topic: "device/data/vehicle_01".to_string(),
            qos: 1,
            packet_id: Some(65535),
            dup: true,
            retain: false,
            payload: vec![b'x'; 20_000],
        });
        assert_eq!(reparse(&packet).await, packet);
    }

    #[tokio::test]
    async fn test_subscribe_and_suback() {
        let sub = Packet::Subscribe {
            packet_id: 3,
            filters: vec![("device/data/+".to_string(), 1)],
        };
        assert_eq!(reparse(&sub).await, sub);

        let mut slice: &[u8] = &[0x90, 3, 0, 3, SUBACK_FAILURE];
        let ack = read_packet(&mut slice).await.unwrap();
        assert_eq!(
            ack,
            Packet::SubAck {
                packet_id: 3,
                codes: vec![0x80]
            }
        );
    }

    #[tokio::test]
    async fn test_connack_and_ping() {
        let mut slice: &[u8] = &[0x20, 2, 1, 5, 0xD0, 0];
        assert_eq!(
            read_packet(&mut slice).await.unwrap(),
            Packet::ConnAck {
                session_present: true,
                code: 5
            }
        );
        assert_eq!(read_packet(&mut slice).await.unwrap(), Packet::PingResp);
        assert!(matches!(
            read_packet(&mut slice).await,
            Err(BrokerError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_rejects_qos2_and_truncation() {
        assert!(decode(0x34, &[0, 1, b'a', 0, 1]).is_err());
        assert!(decode(0x40, &[0]).is_err());
        assert!(matches!(decode(0xF0, &[]), Err(BrokerError::Protocol(_))));
    }

    #[test]
    fn test_connack_reasons() {
        assert_eq!(connack_reason(4), "bad username or password");
        assert_eq!(connack_reason(5), "not authorized");
        assert_eq!(connack_reason(9), "unknown return code 9");
    }
}
