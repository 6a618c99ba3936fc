//! RTMP chunk stream codec
//!
//! ```text
//! +--------------+----------------+--------------------+--------------+
//! | Basic Header | Message Header | Extended Timestamp | Chunk Data   |
//! | 1-3 bytes    | 0, 3, 7 or 11  | 0 or 4 bytes       | <= chunk size|
//! +--------------+----------------+--------------------+--------------+
//! ```
//!
//! Format 0 carries a full header, 1 omits the stream id, 2 carries only
//! a timestamp delta and 3 inherits everything from the previous chunk on
//! the same chunk stream. Reassembly state is kept per chunk stream, so
//! messages on different chunk streams may interleave.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::constants::{
    msg_type, DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE,
};
use super::message::{Command, RtmpMessage};
use crate::error::{ChunkError, Result};

#[derive(Debug, Default)]
struct ChunkStream {
    started: bool,
    timestamp: u32,
    delta: u32,
    length: usize,
    type_id: u8,
    stream_id: u32,
    extended: bool,
    payload: BytesMut,
}

/// Reads whole messages from a chunked byte stream
pub struct ChunkReader<R> {
    reader: BufReader<R>,
    chunk_size: usize,
    streams: HashMap<u32, ChunkStream>,
    bytes_read: u64,
    ack_window: u32,
    last_ack: u64,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            chunk_size: DEFAULT_CHUNK_SIZE as usize,
            streams: HashMap::new(),
            bytes_read: 0,
            ack_window: 0,
            last_ack: 0,
        }
    }

    /// Apply a hop-local protocol control message
    ///
    /// Returns true when `message` was protocol control and must not be
    /// relayed to the other hop.
    pub fn apply_control(&mut self, message: &RtmpMessage) -> Result<bool> {
        match message.type_id {
            msg_type::SET_CHUNK_SIZE => {
                // The top bit is reserved and must be ignored.
                let size = message.control_value()? & MAX_CHUNK_SIZE;
                self.set_chunk_size(size)?;
                tracing::trace!(chunk_size = size, "Peer chunk size changed");
            }
            msg_type::WINDOW_ACK_SIZE => {
                self.ack_window = message.control_value()?;
            }
            _ => return Ok(message.is_protocol_control()),
        }
        Ok(true)
    }

    /// Sequence number to acknowledge, once a full window was received
    pub fn take_ack(&mut self) -> Option<u32> {
        if self.ack_window == 0 || self.bytes_read - self.last_ack < u64::from(self.ack_window) {
            return None;
        }
        self.last_ack = self.bytes_read;
        Some(self.bytes_read as u32)
    }

    /// Apply a SetChunkSize received from the peer
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ChunkError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size as usize;
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total bytes consumed, for acknowledgements
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read chunks until one message is complete
    pub async fn read_message(&mut self) -> Result<RtmpMessage> {
        loop {
            if let Some(message) = self.read_chunk().await? {
                return Ok(message);
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<RtmpMessage>> {
        let first = self.read_u8().await?;
        let fmt = first >> 6;
        let csid = match u32::from(first & 0x3F) {
            0 => 64 + u32::from(self.read_u8().await?),
            1 => {
                let lo = u32::from(self.read_u8().await?);
                let hi = u32::from(self.read_u8().await?);
                64 + lo + hi * 256
            }
            id => id,
        };

        let mut header = [0u8; 11];
        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        self.read_exact(&mut header[..header_len]).await?;

        let stream = self.streams.entry(csid).or_default();
        if fmt != 0 && !stream.started {
            return Err(ChunkError::MissingHeader(csid).into());
        }

        let starts_message = stream.payload.is_empty();
        if fmt <= 2 {
            let ts = u24(&header[0..3]);
            stream.extended = ts >= EXTENDED_TIMESTAMP;
            if fmt == 0 {
                stream.timestamp = ts;
                stream.delta = 0;
            } else {
                stream.delta = ts;
            }
            if fmt <= 1 {
                stream.length = u24(&header[3..6]) as usize;
                stream.type_id = header[6];
            }
            if fmt == 0 {
                stream.stream_id = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
            }
        }
        stream.started = true;

        let extended = stream.extended;
        let length = stream.length;
        if length > MAX_MESSAGE_SIZE {
            return Err(ChunkError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            }
            .into());
        }

        if extended {
            let mut ext = [0u8; 4];
            self.read_exact(&mut ext).await?;
            let value = u32::from_be_bytes(ext);
            let stream = self.stream_mut(csid);
            if fmt == 0 {
                stream.timestamp = value;
            } else if fmt <= 2 {
                stream.delta = value;
            }
        }

        if fmt != 0 && starts_message {
            let stream = self.stream_mut(csid);
            stream.timestamp = stream.timestamp.wrapping_add(stream.delta);
        }

        let have = self.stream_mut(csid).payload.len();
        let need = length
            .checked_sub(have)
            .ok_or(ChunkError::LengthMismatch {
                csid,
                length,
                received: have,
            })?
            .min(self.chunk_size);
        let mut data = vec![0u8; need];
        self.read_exact(&mut data).await?;

        let stream = self.stream_mut(csid);
        stream.payload.extend_from_slice(&data);
        if stream.payload.len() < length {
            return Ok(None);
        }

        let payload = stream.payload.split().freeze();
        Ok(Some(RtmpMessage {
            csid,
            timestamp: stream.timestamp,
            type_id: stream.type_id,
            stream_id: stream.stream_id,
            payload,
        }))
    }

    fn stream_mut(&mut self, csid: u32) -> &mut ChunkStream {
        self.streams.entry(csid).or_default()
    }

    async fn read_u8(&mut self) -> Result<u8> {
        let b = self.reader.read_u8().await?;
        self.bytes_read += 1;
        Ok(b)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).await?;
        self.bytes_read += buf.len() as u64;
        Ok(())
    }
}

/// Read until the next command message
///
/// Protocol control is applied to the reader and acknowledgements are
/// written back on the same hop; everything else before the command is
/// dropped.
pub async fn read_command<R, W>(
    reader: &mut ChunkReader<R>,
    writer: &mut ChunkWriter<W>,
) -> Result<(RtmpMessage, Command)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let message = reader.read_message().await?;
        if let Some(sequence) = reader.take_ack() {
            writer
                .write_message(&RtmpMessage::acknowledgement(sequence))
                .await?;
        }
        if reader.apply_control(&message)? {
            continue;
        }
        if message.is_command() {
            let command = Command::decode(&message)?;
            return Ok((message, command));
        }
        tracing::trace!(type_id = message.type_id, "Skipping message while waiting for a command");
    }
}

fn u24(b: &[u8]) -> u32 {
    u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2])
}

/// Writes messages as chunks
pub struct ChunkWriter<W> {
    writer: W,
    chunk_size: usize,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            chunk_size: DEFAULT_CHUNK_SIZE as usize,
        }
    }

    /// Change the outbound chunk size
    ///
    /// The caller announces it with a SetChunkSize message first.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ChunkError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size as usize;
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub async fn write_message(&mut self, message: &RtmpMessage) -> Result<()> {
        let data = encode_message(message, self.chunk_size);
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Chunk one message: a format 0 chunk followed by format 3 chunks
pub fn encode_message(message: &RtmpMessage, chunk_size: usize) -> Bytes {
    let chunk_size = chunk_size.max(1);
    let payload = &message.payload;
    let chunks = payload.len().div_ceil(chunk_size).max(1);
    let extended = message.timestamp >= EXTENDED_TIMESTAMP;

    let mut buf = BytesMut::with_capacity(payload.len() + 18 + chunks * 8);

    put_basic_header(&mut buf, 0, message.csid);
    let ts = if extended { EXTENDED_TIMESTAMP } else { message.timestamp };
    put_u24(&mut buf, ts);
    put_u24(&mut buf, payload.len() as u32);
    buf.put_u8(message.type_id);
    buf.put_u32_le(message.stream_id);
    if extended {
        buf.put_u32(message.timestamp);
    }

    for (i, chunk) in payload.chunks(chunk_size).enumerate() {
        if i > 0 {
            put_basic_header(&mut buf, 3, message.csid);
            if extended {
                buf.put_u32(message.timestamp);
            }
        }
        buf.put_slice(chunk);
    }

    buf.freeze()
}

fn put_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => buf.put_u8(fmt << 6 | csid as u8),
        64..=319 => {
            buf.put_u8(fmt << 6);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            let id = csid.saturating_sub(64).min(0xFFFF);
            buf.put_u8(fmt << 6 | 1);
            buf.put_u8((id & 0xFF) as u8);
            buf.put_u8((id >> 8) as u8);
        }
    }
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_slice(&value.to_be_bytes()[1..]);
}
