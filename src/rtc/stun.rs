//! Minimal STUN parsing
//!
//! The relay only needs the USERNAME attribute of binding requests to tell
//! which session a new client address belongs to.
//!
//! Reference: RFC 5389 section 6 and 15.3

use bytes::Buf;

use crate::error::{Error, Result};

const HEADER_SIZE: usize = 20;
const ATTR_USERNAME: u16 = 0x0006;

/// True if the datagram looks like STUN (first byte 0 or 1)
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE && (data[0] == 0 || data[0] == 1)
}

/// True if the datagram looks like RTP or RTCP (version 2)
pub fn is_rtp_or_rtcp(data: &[u8]) -> bool {
    data.len() >= 12 && (data[0] & 0xC0) == 0x80
}

/// The parts of a STUN message the relay cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunPacket {
    pub message_type: u16,
    pub username: String,
}

impl StunPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Parse(format!("stun packet too short {}", data.len())));
        }

        let mut header = &data[..4];
        let message_type = header.get_u16();
        let length = header.get_u16() as usize;

        let mut body = &data[HEADER_SIZE..];
        if body.len() != length {
            return Err(Error::Parse(format!(
                "stun length {length} does not match body {}",
                body.len()
            )));
        }

        let mut username = String::new();
        while body.len() >= 4 {
            let attr_type = body.get_u16();
            let attr_len = body.get_u16() as usize;
            if body.len() < attr_len {
                return Err(Error::Parse(format!(
                    "stun attribute 0x{attr_type:04x} needs {attr_len} bytes, got {}",
                    body.len()
                )));
            }

            if attr_type == ATTR_USERNAME {
                username = String::from_utf8_lossy(&body[..attr_len]).into_owned();
            }

            let padded = (attr_len + 3) & !3;
            body.advance(padded.min(body.len()));
        }

        Ok(Self {
            message_type,
            username,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;

    fn binding_request(username: &str) -> Vec<u8> {
        let mut attrs = BytesMut::new();
        attrs.put_u16(ATTR_USERNAME);
        attrs.put_u16(username.len() as u16);
        attrs.put_slice(username.as_bytes());
        while attrs.len() % 4 != 0 {
            attrs.put_u8(0);
        }
        // PRIORITY attribute after the padded username.
        attrs.put_u16(0x0024);
        attrs.put_u16(4);
        attrs.put_u32(0x6E00_01FF);

        let mut msg = BytesMut::new();
        msg.put_u16(0x0001);
        msg.put_u16(attrs.len() as u16);
        msg.put_u32(0x2112_A442);
        msg.put_slice(&[7u8; 12]);
        msg.put_slice(&attrs);
        msg.to_vec()
    }

    #[test]
    fn test_parse_username() {
        let data = binding_request("b4k9x2:Ab1c");
        assert!(is_stun(&data));
        assert!(!is_rtp_or_rtcp(&data));

        let packet = StunPacket::parse(&data).unwrap();
        assert_eq!(packet.message_type, 0x0001);
        assert_eq!(packet.username, "b4k9x2:Ab1c");
    }

    #[test]
    fn test_length_mismatch() {
        let mut data = binding_request("a:b");
        data.push(0);
        assert!(StunPacket::parse(&data).is_err());
    }

    #[test]
    fn test_classification() {
        let mut rtp = vec![0u8; 12];
        rtp[0] = 0x80;
        assert!(is_rtp_or_rtcp(&rtp));
        assert!(!is_stun(&rtp));

        let dtls = [22u8; 30];
        assert!(!is_stun(&dtls));
        assert!(!is_rtp_or_rtcp(&dtls));
    }
}
