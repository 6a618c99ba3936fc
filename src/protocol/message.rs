//! RTMP messages and AMF0 commands

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{amf0, AmfValue};
use crate::error::{Error, Result};
use crate::protocol::constants::{csid, msg_type, user_control};

/// One reassembled RTMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpMessage {
    /// Chunk stream the message arrived on, or should be written on
    pub csid: u32,
    pub timestamp: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(csid: u32, type_id: u8, stream_id: u32, timestamp: u32, payload: Bytes) -> Self {
        Self {
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }

    pub fn set_chunk_size(size: u32) -> Self {
        Self::control(msg_type::SET_CHUNK_SIZE, size)
    }

    pub fn window_ack_size(size: u32) -> Self {
        Self::control(msg_type::WINDOW_ACK_SIZE, size)
    }

    pub fn acknowledgement(sequence: u32) -> Self {
        Self::control(msg_type::ACKNOWLEDGEMENT, sequence)
    }

    /// SetPeerBandwidth with the dynamic limit type
    pub fn set_peer_bandwidth(size: u32) -> Self {
        let mut payload = BytesMut::with_capacity(5);
        payload.put_u32(size);
        payload.put_u8(2);
        Self::new(
            csid::PROTOCOL_CONTROL,
            msg_type::SET_PEER_BANDWIDTH,
            0,
            0,
            payload.freeze(),
        )
    }

    /// User control StreamBegin for `stream_id`
    pub fn stream_begin(stream_id: u32) -> Self {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u16(user_control::STREAM_BEGIN);
        payload.put_u32(stream_id);
        Self::new(
            csid::PROTOCOL_CONTROL,
            msg_type::USER_CONTROL,
            0,
            0,
            payload.freeze(),
        )
    }

    /// An AMF0 command message
    pub fn command(csid: u32, stream_id: u32, command: &Command) -> Self {
        Self::new(
            csid,
            msg_type::COMMAND_AMF0,
            stream_id,
            0,
            command.encode(),
        )
    }

    fn control(type_id: u8, value: u32) -> Self {
        Self::new(
            csid::PROTOCOL_CONTROL,
            type_id,
            0,
            0,
            Bytes::copy_from_slice(&value.to_be_bytes()),
        )
    }

    /// Value of a 4-byte protocol control message
    pub fn control_value(&self) -> Result<u32> {
        if self.payload.len() < 4 {
            return Err(Error::ProtocolViolation(format!(
                "control message type {} has {} bytes",
                self.type_id,
                self.payload.len()
            )));
        }
        Ok((&self.payload[..4]).get_u32())
    }

    pub fn is_command(&self) -> bool {
        matches!(
            self.type_id,
            msg_type::COMMAND_AMF0 | msg_type::COMMAND_AMF3
        )
    }

    /// Protocol control messages are hop-local and never relayed
    pub fn is_protocol_control(&self) -> bool {
        matches!(
            self.type_id,
            msg_type::SET_CHUNK_SIZE
                | msg_type::ABORT
                | msg_type::ACKNOWLEDGEMENT
                | msg_type::WINDOW_ACK_SIZE
                | msg_type::SET_PEER_BANDWIDTH
        )
    }
}

/// An AMF0 command: name, transaction id, command object, arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: AmfValue,
    pub args: Vec<AmfValue>,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64, command_object: AmfValue) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            command_object,
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<AmfValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Decode a command message body
    ///
    /// AMF3 command messages (type 17) carry a leading format byte followed
    /// by AMF0 values.
    pub fn decode(message: &RtmpMessage) -> Result<Self> {
        let mut payload = message.payload.clone();
        if message.type_id == msg_type::COMMAND_AMF3 && payload.has_remaining() {
            payload.advance(1);
        }

        let mut values = amf0::Amf0Decoder::new().decode_all(&mut payload)?.into_iter();
        let name = match values.next() {
            Some(AmfValue::String(name)) => name,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "command without name: {other:?}"
                )))
            }
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let command_object = values.next().unwrap_or(AmfValue::Null);

        Ok(Self {
            name,
            transaction_id,
            command_object,
            args: values.collect(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut encoder = amf0::Amf0Encoder::new();
        encoder.encode(&AmfValue::from(self.name.as_str()));
        encoder.encode(&AmfValue::Number(self.transaction_id));
        encoder.encode(&self.command_object);
        encoder.encode_all(&self.args);
        encoder.finish()
    }

    /// First argument as a string, e.g. the stream name of publish/play
    pub fn stream_name(&self) -> Option<&str> {
        self.args.first().and_then(|v| v.as_str())
    }

    /// `code` of the info object in an onStatus or _result
    pub fn status_code(&self) -> Option<&str> {
        self.args
            .iter()
            .chain(std::iter::once(&self.command_object))
            .find_map(|v| v.get_str("code"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip_through_message() {
        let cmd = Command::new("publish", 5.0, AmfValue::Null)
            .with_arg("livestream")
            .with_arg("live");
        let msg = RtmpMessage::command(csid::STREAM_COMMAND, 1, &cmd);
        assert!(msg.is_command());
        assert_eq!(msg.stream_id, 1);

        let decoded = Command::decode(&msg).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.stream_name(), Some("livestream"));
    }

    #[test]
    fn test_amf3_command_skips_format_byte() {
        let cmd = Command::new("createStream", 2.0, AmfValue::Null);
        let mut payload = BytesMut::new();
        payload.put_u8(0);
        payload.put_slice(&cmd.encode());
        let msg = RtmpMessage::new(3, msg_type::COMMAND_AMF3, 0, 0, payload.freeze());

        assert_eq!(Command::decode(&msg).unwrap(), cmd);
    }

    #[test]
    fn test_status_code() {
        let cmd = Command::new("onStatus", 0.0, AmfValue::Null).with_arg(AmfValue::object([
            ("level", "status"),
            ("code", "NetStream.Publish.Start"),
        ]));
        assert_eq!(cmd.status_code(), Some("NetStream.Publish.Start"));

        let result = Command::new(
            "_result",
            1.0,
            AmfValue::object([("fmsVer", "FMS/3,5,3,888")]),
        )
        .with_arg(AmfValue::object([("code", "NetConnection.Connect.Success")]));
        assert_eq!(result.status_code(), Some("NetConnection.Connect.Success"));
    }

    #[test]
    fn test_control_messages() {
        let msg = RtmpMessage::set_chunk_size(60000);
        assert!(msg.is_protocol_control());
        assert_eq!(msg.control_value().unwrap(), 60000);

        let begin = RtmpMessage::stream_begin(1);
        assert!(!begin.is_protocol_control());
        assert_eq!(&begin.payload[..], &[0, 0, 0, 0, 0, 1]);

        let short = RtmpMessage::new(2, msg_type::SET_CHUNK_SIZE, 0, 0, Bytes::from_static(&[1]));
        assert!(short.control_value().is_err());
    }

    #[test]
    fn test_nameless_command_rejected() {
        let payload = amf0::encode_all(&[AmfValue::Number(1.0)]);
        let msg = RtmpMessage::new(3, msg_type::COMMAND_AMF0, 0, 0, payload);
        assert!(matches!(
            Command::decode(&msg),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
