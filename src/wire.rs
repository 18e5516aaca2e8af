//! C1: length-prefixed binary framing + per-message tag dispatch (§4.1).
//!
//! Integers are QUIC-style (RFC 9000 §16) variable-length: the top two bits
//! of the first byte select a 1/2/4/8-byte encoding, big-endian otherwise.
//! This is the same varint shape used throughout the retrieved networking
//! corpus (e.g. `strata-transport`'s wire module) rather than a hand-rolled
//! one-off. Byte strings and UTF-8 strings are a varint length followed by
//! the raw bytes. Every [`Message`] maps to exactly one tag byte; tag
//! numbers are fixed below and MUST NOT change once assigned (§4.1).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{TransferError, Result};
use crate::session::FileHeader;

// ── VarInt ──────────────────────────────────────────────────────────────

const VARINT_MAX_1: u64 = (1 << 6) - 1;
const VARINT_MAX_2: u64 = (1 << 14) - 1;
const VARINT_MAX_4: u64 = (1 << 30) - 1;
const VARINT_MAX_8: u64 = (1 << 62) - 1;

pub fn write_varint(buf: &mut BytesMut, v: u64) {
    if v <= VARINT_MAX_1 {
        buf.put_u8(v as u8);
    } else if v <= VARINT_MAX_2 {
        buf.put_u16(0x4000 | v as u16);
    } else if v <= VARINT_MAX_4 {
        buf.put_u32(0x8000_0000 | v as u32);
    } else if v <= VARINT_MAX_8 {
        buf.put_u64(0xC000_0000_0000_0000 | v);
    } else {
        panic!("varint value {v} exceeds 62-bit range");
    }
}

pub fn read_varint(buf: &mut Bytes) -> Result<u64> {
    if buf.is_empty() {
        return Err(TransferError::MalformedFrame("varint: empty buffer".into()));
    }
    let first = buf[0];
    let tag = first >> 6;
    let len = 1usize << tag;
    if buf.len() < len {
        return Err(TransferError::MalformedFrame(format!(
            "varint: need {len} bytes, have {}",
            buf.len()
        )));
    }
    let mut raw = [0u8; 8];
    raw[8 - len..].copy_from_slice(&buf[..len]);
    raw[8 - len] &= 0x3F; // mask off the length-tag bits
    buf.advance(len);
    Ok(u64::from_be_bytes(raw))
}

pub fn write_bytes_field(buf: &mut BytesMut, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

pub fn read_bytes_field(buf: &mut Bytes) -> Result<Bytes> {
    let len = read_varint(buf)? as usize;
    if buf.len() < len {
        return Err(TransferError::MalformedFrame(format!(
            "byte field: need {len} bytes, have {}",
            buf.len()
        )));
    }
    Ok(buf.split_to(len))
}

pub fn write_string_field(buf: &mut BytesMut, s: &str) {
    write_bytes_field(buf, s.as_bytes());
}

pub fn read_string_field(buf: &mut Bytes) -> Result<String> {
    let raw = read_bytes_field(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| TransferError::MalformedFrame(format!("string field not utf8: {e}")))
}

fn write_ip(buf: &mut BytesMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        }
    }
}

fn read_ip(buf: &mut Bytes) -> Result<IpAddr> {
    if buf.is_empty() {
        return Err(TransferError::MalformedFrame("ip: empty".into()));
    }
    let tag = buf.get_u8();
    match tag {
        4 => {
            if buf.len() < 4 {
                return Err(TransferError::MalformedFrame("ipv4: short".into()));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf.split_to(4));
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 => {
            if buf.len() < 16 {
                return Err(TransferError::MalformedFrame("ipv6: short".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf.split_to(16));
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(TransferError::MalformedFrame(format!("ip: bad tag {other}"))),
    }
}

// ── Status / response-type enums ────────────────────────────────────────

/// Generic ack status carried by every `Response`-shaped message (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    AuthFailed,
    Refused,
    PayloadMismatch,
    Error,
}

impl Status {
    fn to_u8(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::AuthFailed => 1,
            Status::Refused => 2,
            Status::PayloadMismatch => 3,
            Status::Error => 4,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Status::Ok,
            1 => Status::AuthFailed,
            2 => Status::Refused,
            3 => Status::PayloadMismatch,
            4 => Status::Error,
            other => return Err(TransferError::DeserialiseFailed(format!("bad status {other}"))),
        })
    }
}

/// `PacketStatusUpdateResponse.response_type` (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketResponseType {
    Ok,
    WaveComplete,
}

impl PacketResponseType {
    fn to_u8(self) -> u8 {
        match self {
            PacketResponseType::Ok => 0,
            PacketResponseType::WaveComplete => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PacketResponseType::Ok,
            1 => PacketResponseType::WaveComplete,
            other => {
                return Err(TransferError::DeserialiseFailed(format!(
                    "bad packet response type {other}"
                )))
            }
        })
    }
}

// ── Tags (stable once assigned, §4.1) ───────────────────────────────────

mod tag {
    pub const CHALLENGE: u8 = 0x01;
    pub const CHALLENGE_RESPONSE: u8 = 0x02;
    pub const RESPONSE: u8 = 0x03;
    pub const SESSION_JOIN_REQUEST: u8 = 0x04;
    pub const SESSION_JOIN_RESPONSE: u8 = 0x05;
    pub const FILE_SEGMENT: u8 = 0x06;
    pub const PACKET_STATUS_UPDATE: u8 = 0x07;
    pub const PACKET_STATUS_UPDATE_RESPONSE: u8 = 0x08;
    pub const WAVE_STATUS_UPDATE: u8 = 0x09;
    pub const WAVE_COMPLETE_RESPONSE: u8 = 0x0A;
}

// ── Message set ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Challenge {
        challenge_key: Vec<u8>,
    },
    ChallengeResponse {
        challenge_key: Vec<u8>,
    },
    Response {
        status: Status,
        error_message: Option<String>,
    },
    SessionJoinRequest {
        path: String,
        state: u64,
    },
    SessionJoinResponse {
        status: Status,
        error_message: Option<String>,
        files: Vec<FileHeader>,
        multicast_address: IpAddr,
        multicast_port: u16,
        wave_number: u64,
        /// Block size the server derived from its own MTU/IP-version/
        /// encoder configuration (§4.5). Announced here rather than
        /// independently re-derived by the receiver so the two sides can
        /// never disagree on chunk boundaries without also disagreeing on
        /// the file list itself — the same reasoning the teacher's own
        /// handshake uses to hand the client its sample rate/channel
        /// count/format instead of letting the client guess them.
        block_size: u32,
    },
    FileSegment {
        segment_id: u64,
        data: Vec<u8>,
    },
    PacketStatusUpdate {
        bytes_left: u64,
        leaving_session: bool,
    },
    PacketStatusUpdateResponse {
        status: Status,
        error_message: Option<String>,
        reception_rate: f32,
        response_type: PacketResponseType,
    },
    WaveStatusUpdate {
        bytes_left: u64,
        leaving_session: bool,
        file_bit_vector: Vec<u8>,
    },
    WaveCompleteResponse {
        status: Status,
        error_message: Option<String>,
        wave_number: u64,
    },
}

fn write_optional_error(buf: &mut BytesMut, error_message: &Option<String>) {
    match error_message {
        Some(s) => {
            buf.put_u8(1);
            write_string_field(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn read_optional_error(buf: &mut Bytes) -> Result<Option<String>> {
    if buf.is_empty() {
        return Err(TransferError::MalformedFrame("optional error: empty".into()));
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(read_string_field(buf)?)),
        other => Err(TransferError::MalformedFrame(format!("optional error tag {other}"))),
    }
}

impl Message {
    /// Encode tag + fields. Does not add an outer frame-length prefix —
    /// that framing layer is applied by the transport (`control.rs` for
    /// the control channel; raw for the multicast datagram path, since UDP
    /// already delimits the message).
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Challenge { challenge_key } => {
                buf.put_u8(tag::CHALLENGE);
                write_bytes_field(&mut buf, challenge_key);
            }
            Message::ChallengeResponse { challenge_key } => {
                buf.put_u8(tag::CHALLENGE_RESPONSE);
                write_bytes_field(&mut buf, challenge_key);
            }
            Message::Response { status, error_message } => {
                buf.put_u8(tag::RESPONSE);
                buf.put_u8(status.to_u8());
                write_optional_error(&mut buf, error_message);
            }
            Message::SessionJoinRequest { path, state } => {
                buf.put_u8(tag::SESSION_JOIN_REQUEST);
                write_string_field(&mut buf, path);
                write_varint(&mut buf, *state);
            }
            Message::SessionJoinResponse {
                status,
                error_message,
                files,
                multicast_address,
                multicast_port,
                wave_number,
                block_size,
            } => {
                buf.put_u8(tag::SESSION_JOIN_RESPONSE);
                buf.put_u8(status.to_u8());
                write_optional_error(&mut buf, error_message);
                write_varint(&mut buf, files.len() as u64);
                for f in files {
                    write_string_field(&mut buf, &f.name);
                    write_varint(&mut buf, f.length);
                    write_varint(&mut buf, f.ordinal as u64);
                }
                write_ip(&mut buf, *multicast_address);
                buf.put_u16(*multicast_port);
                write_varint(&mut buf, *wave_number);
                write_varint(&mut buf, *block_size as u64);
            }
            Message::FileSegment { segment_id, data } => {
                buf.put_u8(tag::FILE_SEGMENT);
                write_varint(&mut buf, *segment_id);
                write_bytes_field(&mut buf, data);
            }
            Message::PacketStatusUpdate { bytes_left, leaving_session } => {
                buf.put_u8(tag::PACKET_STATUS_UPDATE);
                write_varint(&mut buf, *bytes_left);
                buf.put_u8(*leaving_session as u8);
            }
            Message::PacketStatusUpdateResponse {
                status,
                error_message,
                reception_rate,
                response_type,
            } => {
                buf.put_u8(tag::PACKET_STATUS_UPDATE_RESPONSE);
                buf.put_u8(status.to_u8());
                write_optional_error(&mut buf, error_message);
                buf.put_f32(*reception_rate);
                buf.put_u8(response_type.to_u8());
            }
            Message::WaveStatusUpdate {
                bytes_left,
                leaving_session,
                file_bit_vector,
            } => {
                buf.put_u8(tag::WAVE_STATUS_UPDATE);
                write_varint(&mut buf, *bytes_left);
                buf.put_u8(*leaving_session as u8);
                write_bytes_field(&mut buf, file_bit_vector);
            }
            Message::WaveCompleteResponse {
                status,
                error_message,
                wave_number,
            } => {
                buf.put_u8(tag::WAVE_COMPLETE_RESPONSE);
                buf.put_u8(status.to_u8());
                write_optional_error(&mut buf, error_message);
                write_varint(&mut buf, *wave_number);
            }
        }
        buf
    }

    /// Decode a complete, already-length-delimited message body.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(TransferError::MalformedFrame("message: empty".into()));
        }
        let tag = buf.get_u8();
        let msg = match tag {
            tag::CHALLENGE => Message::Challenge {
                challenge_key: read_bytes_field(&mut buf)?.to_vec(),
            },
            tag::CHALLENGE_RESPONSE => Message::ChallengeResponse {
                challenge_key: read_bytes_field(&mut buf)?.to_vec(),
            },
            tag::RESPONSE => {
                if buf.is_empty() {
                    return Err(TransferError::MalformedFrame("response: missing status".into()));
                }
                let status = Status::from_u8(buf.get_u8())?;
                let error_message = read_optional_error(&mut buf)?;
                Message::Response { status, error_message }
            }
            tag::SESSION_JOIN_REQUEST => {
                let path = read_string_field(&mut buf)?;
                let state = read_varint(&mut buf)?;
                Message::SessionJoinRequest { path, state }
            }
            tag::SESSION_JOIN_RESPONSE => {
                if buf.is_empty() {
                    return Err(TransferError::MalformedFrame("join response: missing status".into()));
                }
                let status = Status::from_u8(buf.get_u8())?;
                let error_message = read_optional_error(&mut buf)?;
                let file_count = read_varint(&mut buf)? as usize;
                let mut files = Vec::with_capacity(file_count);
                for _ in 0..file_count {
                    let name = read_string_field(&mut buf)?;
                    let length = read_varint(&mut buf)?;
                    let ordinal = read_varint(&mut buf)? as usize;
                    files.push(FileHeader { name, length, ordinal });
                }
                let multicast_address = read_ip(&mut buf)?;
                if buf.len() < 2 {
                    return Err(TransferError::MalformedFrame("join response: missing port".into()));
                }
                let multicast_port = buf.get_u16();
                let wave_number = read_varint(&mut buf)?;
                let block_size = read_varint(&mut buf)? as u32;
                Message::SessionJoinResponse {
                    status,
                    error_message,
                    files,
                    multicast_address,
                    multicast_port,
                    wave_number,
                    block_size,
                }
            }
            tag::FILE_SEGMENT => {
                let segment_id = read_varint(&mut buf)?;
                let data = read_bytes_field(&mut buf)?.to_vec();
                Message::FileSegment { segment_id, data }
            }
            tag::PACKET_STATUS_UPDATE => {
                let bytes_left = read_varint(&mut buf)?;
                if buf.is_empty() {
                    return Err(TransferError::MalformedFrame("status update: missing flag".into()));
                }
                let leaving_session = buf.get_u8() != 0;
                Message::PacketStatusUpdate { bytes_left, leaving_session }
            }
            tag::PACKET_STATUS_UPDATE_RESPONSE => {
                if buf.is_empty() {
                    return Err(TransferError::MalformedFrame("packet response: missing status".into()));
                }
                let status = Status::from_u8(buf.get_u8())?;
                let error_message = read_optional_error(&mut buf)?;
                if buf.len() < 5 {
                    return Err(TransferError::MalformedFrame("packet response: truncated".into()));
                }
                let reception_rate = buf.get_f32();
                let response_type = PacketResponseType::from_u8(buf.get_u8())?;
                Message::PacketStatusUpdateResponse {
                    status,
                    error_message,
                    reception_rate: reception_rate.clamp(0.0, 1.0),
                    response_type,
                }
            }
            tag::WAVE_STATUS_UPDATE => {
                let bytes_left = read_varint(&mut buf)?;
                if buf.is_empty() {
                    return Err(TransferError::MalformedFrame("wave update: missing flag".into()));
                }
                let leaving_session = buf.get_u8() != 0;
                let file_bit_vector = read_bytes_field(&mut buf)?.to_vec();
                Message::WaveStatusUpdate {
                    bytes_left,
                    leaving_session,
                    file_bit_vector,
                }
            }
            tag::WAVE_COMPLETE_RESPONSE => {
                if buf.is_empty() {
                    return Err(TransferError::MalformedFrame("wave complete: missing status".into()));
                }
                let status = Status::from_u8(buf.get_u8())?;
                let error_message = read_optional_error(&mut buf)?;
                let wave_number = read_varint(&mut buf)?;
                Message::WaveCompleteResponse {
                    status,
                    error_message,
                    wave_number,
                }
            }
            other => return Err(TransferError::DeserialiseFailed(format!("unknown tag {other}"))),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode().freeze();
        let decoded = Message::decode(encoded).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn varint_roundtrip_all_widths() {
        for v in [0u64, 1, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, (1 << 62) - 1] {
            let mut buf = BytesMut::new();
            write_varint(&mut buf, v);
            let mut frozen = buf.freeze();
            assert_eq!(read_varint(&mut frozen).unwrap(), v);
        }
    }

    #[test]
    fn challenge_roundtrip() {
        roundtrip(Message::Challenge {
            challenge_key: vec![1, 2, 3, 4],
        });
    }

    #[test]
    fn session_join_request_roundtrip() {
        roundtrip(Message::SessionJoinRequest {
            path: "payload/set-a".into(),
            state: 0,
        });
    }

    #[test]
    fn session_join_response_roundtrip() {
        roundtrip(Message::SessionJoinResponse {
            status: Status::Ok,
            error_message: None,
            files: vec![
                FileHeader { name: "a.bin".into(), length: 1024, ordinal: 0 },
                FileHeader { name: "b.bin".into(), length: 2048, ordinal: 1 },
            ],
            multicast_address: IpAddr::V4(Ipv4Addr::new(239, 1, 2, 3)),
            multicast_port: 9001,
            wave_number: 0,
            block_size: 1452,
        });
    }

    #[test]
    fn response_with_error_roundtrip() {
        roundtrip(Message::Response {
            status: Status::Refused,
            error_message: Some("too many receivers".into()),
        });
    }

    #[test]
    fn file_segment_roundtrip() {
        roundtrip(Message::FileSegment {
            segment_id: 42,
            data: vec![0xAB; 256],
        });
    }

    #[test]
    fn wave_status_update_roundtrip() {
        roundtrip(Message::WaveStatusUpdate {
            bytes_left: 4096,
            leaving_session: false,
            file_bit_vector: vec![0xFF, 0x00, 0x3C],
        });
    }

    #[test]
    fn packet_status_update_response_clamps_rate() {
        let mut buf = BytesMut::new();
        buf.put_u8(tag::PACKET_STATUS_UPDATE_RESPONSE);
        buf.put_u8(Status::Ok.to_u8());
        buf.put_u8(0);
        buf.put_f32(1.5);
        buf.put_u8(PacketResponseType::Ok.to_u8());
        let decoded = Message::decode(buf.freeze()).unwrap();
        match decoded {
            Message::PacketStatusUpdateResponse { reception_rate, .. } => {
                assert_eq!(reception_rate, 1.0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(tag::FILE_SEGMENT);
        write_varint(&mut buf, 3);
        write_varint(&mut buf, 10); // claims 10 bytes of data
        buf.put_slice(&[1, 2, 3]); // but only provides 3
        let err = Message::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_tag_is_deserialise_failed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFE);
        let err = Message::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, TransferError::DeserialiseFailed(_)));
    }
}
