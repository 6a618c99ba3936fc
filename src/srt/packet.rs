//! SRT handshake packet codec
//!
//! Layout of a handshake control packet (all fields big-endian):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1|        Control Type         |            Subtype            |  0
//! |                   Type-specific Information                   |  4
//! |                           Timestamp                           |  8
//! |                     Destination Socket ID                     | 12
//! |                            Version                            | 16
//! |        Encryption Field       |        Extension Field        | 20
//! |                 Initial Packet Sequence Number                | 24
//! |                 Maximum Transmission Unit Size                | 28
//! |                    Maximum Flow Window Size                   | 32
//! |                         Handshake Type                        | 36
//! |                         SRT Socket ID                         | 40
//! |                           SYN Cookie                          | 44
//! |                        Peer IP Address (128 bits)             | 48
//! |                      Extensions (variable)                    | 64
//! ```
//!
//! Only IPv4 peer addresses are carried; the first peer-ip word holds the
//! address with its bytes reversed.
//!
//! Reference: draft-sharabayko-srt, section 3.2.1

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the fixed part of a handshake packet
pub const HANDSHAKE_HEADER_SIZE: usize = 64;

/// Extension field the listener sends back in its INDUCTION response
pub const INDUCTION_MAGIC: u16 = 0x4A17;

/// Extension block type carrying the stream id
pub const EXT_STREAM_ID: u16 = 0x05;

/// Handshake type values
pub mod handshake_type {
    pub const DONE: u32 = 0xFFFF_FFFD;
    pub const AGREEMENT: u32 = 0xFFFF_FFFE;
    pub const CONCLUSION: u32 = 0xFFFF_FFFF;
    pub const WAVEAHAND: u32 = 0x0000_0000;
    pub const INDUCTION: u32 = 0x0000_0001;
}

/// True if `data` is a handshake control packet (control bit, type 0, subtype 0)
pub fn is_handshake(data: &[u8]) -> bool {
    data.len() >= 4 && u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == 0x8000_0000
}

/// Destination socket id of any SRT packet, or 0 when too short
pub fn socket_id_of(data: &[u8]) -> u32 {
    if data.len() < 16 {
        return 0;
    }
    u32::from_be_bytes([data[12], data[13], data[14], data[15]])
}

/// A parsed SRT handshake packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    /// 0x80 for control packets, 0 for data
    pub control_flag: u8,
    pub control_type: u16,
    pub sub_type: u16,
    pub additional_info: u32,
    pub timestamp: u32,
    /// Destination socket id
    pub socket_id: u32,

    pub version: u32,
    pub encryption_field: u16,
    pub extension_field: u16,
    pub init_sequence: u32,
    pub mtu: u32,
    pub flow_window: u32,
    pub handshake_type: u32,
    /// Socket id of the sender
    pub srt_socket_id: u32,
    pub syn_cookie: u32,
    pub peer_ip: Ipv4Addr,

    /// Extension blocks following the fixed header
    pub extra_data: Bytes,
}

impl Default for HandshakePacket {
    fn default() -> Self {
        Self {
            control_flag: 0x80,
            control_type: 0,
            sub_type: 0,
            additional_info: 0,
            timestamp: 0,
            socket_id: 0,
            version: 0,
            encryption_field: 0,
            extension_field: 0,
            init_sequence: 0,
            mtu: 0,
            flow_window: 0,
            handshake_type: 0,
            srt_socket_id: 0,
            syn_cookie: 0,
            peer_ip: Ipv4Addr::UNSPECIFIED,
            extra_data: Bytes::new(),
        }
    }
}

impl HandshakePacket {
    /// Parse a handshake packet
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_HEADER_SIZE {
            return Err(Error::Parse(format!(
                "SRT handshake needs {HANDSHAKE_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }

        let mut buf = &data[..HANDSHAKE_HEADER_SIZE];
        let first = buf.get_u16();
        let control_flag = ((first >> 8) as u8) & 0x80;
        let control_type = first & 0x7FFF;

        let mut packet = Self {
            control_flag,
            control_type,
            sub_type: buf.get_u16(),
            additional_info: buf.get_u32(),
            timestamp: buf.get_u32(),
            socket_id: buf.get_u32(),
            version: buf.get_u32(),
            encryption_field: buf.get_u16(),
            extension_field: buf.get_u16(),
            init_sequence: buf.get_u32(),
            mtu: buf.get_u32(),
            flow_window: buf.get_u32(),
            handshake_type: buf.get_u32(),
            srt_socket_id: buf.get_u32(),
            syn_cookie: buf.get_u32(),
            peer_ip: Ipv4Addr::UNSPECIFIED,
            extra_data: Bytes::copy_from_slice(&data[HANDSHAKE_HEADER_SIZE..]),
        };
        packet.peer_ip = Ipv4Addr::new(data[51], data[50], data[49], data[48]);

        Ok(packet)
    }

    /// Serialize to wire format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_HEADER_SIZE + self.extra_data.len());

        buf.put_u16(((self.control_flag as u16) << 8) | (self.control_type & 0x7FFF));
        buf.put_u16(self.sub_type);
        buf.put_u32(self.additional_info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.socket_id);
        buf.put_u32(self.version);
        buf.put_u16(self.encryption_field);
        buf.put_u16(self.extension_field);
        buf.put_u32(self.init_sequence);
        buf.put_u32(self.mtu);
        buf.put_u32(self.flow_window);
        buf.put_u32(self.handshake_type);
        buf.put_u32(self.srt_socket_id);
        buf.put_u32(self.syn_cookie);

        let mut ip = self.peer_ip.octets();
        ip.reverse();
        buf.put_slice(&ip);
        buf.put_bytes(0, 12);

        buf.put_slice(&self.extra_data);
        buf.freeze()
    }

    pub fn is_control(&self) -> bool {
        self.control_flag == 0x80
    }

    pub fn is_handshake(&self) -> bool {
        self.is_control() && self.control_type == 0 && self.sub_type == 0
    }

    /// Extract the stream id from the extension chain
    ///
    /// The stream id is stored as little-endian 32-bit words padded with
    /// NULs; each word is reversed and the padding trimmed.
    pub fn stream_id(&self) -> Result<String> {
        let mut p = &self.extra_data[..];

        while !p.is_empty() {
            if p.len() < 4 {
                return Err(Error::ProtocolViolation(format!(
                    "truncated SRT extension header, {} bytes left",
                    p.len()
                )));
            }
            let ext_type = p.get_u16();
            let ext_len = p.get_u16() as usize * 4;

            if p.len() < ext_len {
                return Err(Error::ProtocolViolation(format!(
                    "SRT extension 0x{ext_type:02x} needs {ext_len} bytes, got {}",
                    p.len()
                )));
            }

            if ext_type != EXT_STREAM_ID {
                p.advance(ext_len);
                continue;
            }

            let mut data: Vec<u8> = p[..ext_len]
                .chunks_exact(4)
                .flat_map(|word| [word[3], word[2], word[1], word[0]])
                .collect();
            while data.last() == Some(&0) {
                data.pop();
            }

            return String::from_utf8(data)
                .map_err(|_| Error::Parse("SRT stream id is not UTF-8".into()));
        }

        Err(Error::ProtocolViolation("SRT handshake has no stream id".into()))
    }
}

impl fmt::Display for HandshakePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "control={}, type={}, subtype={}, ts={}, socket={}, version={}, encrypt={}, \
             ext=0x{:x}, seq={}, mtu={}, window={}, hs_type=0x{:x}, srt_socket={}, cookie=0x{:x}, \
             peer={}, extra={}B",
            self.is_control(),
            self.control_type,
            self.sub_type,
            self.timestamp,
            self.socket_id,
            self.version,
            self.encryption_field,
            self.extension_field,
            self.init_sequence,
            self.mtu,
            self.flow_window,
            self.handshake_type,
            self.srt_socket_id,
            self.syn_cookie,
            self.peer_ip,
            self.extra_data.len()
        )
    }
}

/// Encode a stream id as an SRT extension block (type 0x05)
pub fn stream_id_extension(stream_id: &str) -> Bytes {
    let mut padded = stream_id.as_bytes().to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }

    let mut buf = BytesMut::with_capacity(4 + padded.len());
    buf.put_u16(EXT_STREAM_ID);
    buf.put_u16((padded.len() / 4) as u16);
    for word in padded.chunks_exact(4) {
        buf.put_slice(&[word[3], word[2], word[1], word[0]]);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conclusion() -> HandshakePacket {
        let mut extra = BytesMut::new();
        // HSREQ block that must be skipped.
        extra.put_u16(0x01);
        extra.put_u16(3);
        extra.put_slice(&[0u8; 12]);
        extra.put_slice(&stream_id_extension("#!::r=live/stream1"));

        HandshakePacket {
            timestamp: 1234,
            version: 5,
            extension_field: 0x0005,
            init_sequence: 0x1234_5678,
            mtu: 1500,
            flow_window: 8192,
            handshake_type: handshake_type::CONCLUSION,
            srt_socket_id: 0x0102_0304,
            syn_cookie: 0x418D_5E4E,
            peer_ip: Ipv4Addr::new(192, 168, 1, 20),
            extra_data: extra.freeze(),
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_parse_preserves_fields() {
        let packet = conclusion();
        let wire = packet.encode();
        assert_eq!(wire.len(), HANDSHAKE_HEADER_SIZE + packet.extra_data.len());

        let parsed = HandshakePacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert!(parsed.is_handshake());
    }

    #[test]
    fn test_peer_ip_is_byte_reversed() {
        let packet = HandshakePacket {
            peer_ip: Ipv4Addr::new(127, 0, 0, 1),
            ..Default::default()
        };
        let wire = packet.encode();
        assert_eq!(&wire[48..52], &[1, 0, 0, 127]);
        assert!(wire[52..64].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_control_header_bits() {
        let wire = HandshakePacket::default().encode();
        assert!(is_handshake(&wire));
        assert_eq!(&wire[0..4], &[0x80, 0, 0, 0]);

        let mut data_packet = wire.to_vec();
        data_packet[0] = 0x00;
        assert!(!is_handshake(&data_packet));
    }

    #[test]
    fn test_stream_id_extraction() {
        let packet = conclusion();
        assert_eq!(packet.stream_id().unwrap(), "#!::r=live/stream1");
    }

    #[test]
    fn test_stream_id_word_order() {
        let ext = stream_id_extension("abcdef");
        // "abcd" stored as "dcba", "ef\0\0" stored as "\0\0fe".
        assert_eq!(&ext[4..], b"dcba\0\0fe");
    }

    #[test]
    fn test_stream_id_missing() {
        let packet = HandshakePacket::default();
        assert!(matches!(
            packet.stream_id(),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_stream_id_truncated_block() {
        let mut extra = BytesMut::new();
        extra.put_u16(EXT_STREAM_ID);
        extra.put_u16(4);
        extra.put_slice(b"abcd");
        let packet = HandshakePacket {
            extra_data: extra.freeze(),
            ..Default::default()
        };
        assert!(matches!(
            packet.stream_id(),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_parse_too_short() {
        assert!(matches!(
            HandshakePacket::parse(&[0x80, 0, 0, 0]),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_socket_id_of() {
        let packet = HandshakePacket {
            socket_id: 0xAABB_CCDD,
            ..Default::default()
        };
        assert_eq!(socket_id_of(&packet.encode()), 0xAABB_CCDD);
        assert_eq!(socket_id_of(&[0u8; 8]), 0);
    }
}
