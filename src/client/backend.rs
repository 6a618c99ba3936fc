//! RTMP client towards a backend SRS server
//!
//! The proxy replays the client's intent (publish or play) on a fresh
//! connection to the backend, then hands the connected halves to the relay.

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::amf::AmfValue;
use crate::error::{Error, Result, ResultExt};
use crate::protocol::chunk::read_command;
use crate::protocol::constants::{
    csid, CMD_CONNECT, CMD_CREATE_STREAM, CMD_ERROR, CMD_FC_PUBLISH, CMD_ON_STATUS, CMD_PLAY,
    CMD_PUBLISH, CMD_RELEASE_STREAM, CMD_RESULT, NS_PLAY_RESET, NS_PLAY_START, NS_PUBLISH_START,
};
use crate::protocol::handshake::client_handshake;
use crate::protocol::{ChunkReader, ChunkWriter, Command, RtmpMessage};

const FLASH_VER: &str = "FMLE/3.0 (compatible; SRSProxy)";

/// A connected RTMP client session
pub struct BackendClient {
    reader: ChunkReader<OwnedReadHalf>,
    writer: ChunkWriter<OwnedWriteHalf>,
    stream_id: u32,
    transaction_id: f64,
}

impl BackendClient {
    /// Dial `host:port`, handshake and `connect` to the app of `tc_url`
    ///
    /// `chunk_size` is announced before the first command and used for
    /// everything written afterwards.
    pub async fn connect(host: &str, port: u16, tc_url: &str, chunk_size: u32) -> Result<Self> {
        let mut stream = TcpStream::connect((host, port))
            .await
            .stage(format!("dial backend {host}:{port}"))?;
        stream.set_nodelay(true)?;
        client_handshake(&mut stream).await.stage("backend handshake")?;
        tracing::debug!(backend = %host, port, "Backend handshake done");

        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: ChunkReader::new(read_half),
            writer: ChunkWriter::new(write_half),
            stream_id: 0,
            transaction_id: 0.0,
        };

        client
            .writer
            .write_message(&RtmpMessage::set_chunk_size(chunk_size))
            .await?;
        client.writer.set_chunk_size(chunk_size)?;

        let mut object = AmfValue::object([("app", app_of(tc_url)), ("tcUrl", tc_url.to_string())]);
        object.set("flashVer", FLASH_VER);
        object.set("objectEncoding", 0.0);
        let tid = client.next_transaction();
        client
            .call(Command::new(CMD_CONNECT, tid, object), 0)
            .await
            .stage("backend connect")?;

        Ok(client)
    }

    /// Publish `stream` as a live stream and wait until the backend accepts it
    pub async fn publish(&mut self, stream: &str) -> Result<()> {
        for name in [CMD_RELEASE_STREAM, CMD_FC_PUBLISH] {
            let tid = self.next_transaction();
            self.call(Command::new(name, tid, AmfValue::Null).with_arg(stream), 0)
                .await
                .stage(name)?;
        }
        self.create_stream().await?;

        let tid = self.next_transaction();
        let publish = Command::new(CMD_PUBLISH, tid, AmfValue::Null)
            .with_arg(stream)
            .with_arg("live");
        self.send(&publish).await?;
        self.wait_status(NS_PUBLISH_START).await.stage("publish")?;

        tracing::debug!(stream, stream_id = self.stream_id, "Backend accepted publish");
        Ok(())
    }

    /// Play `stream` and wait until the backend starts it
    pub async fn play(&mut self, stream: &str) -> Result<()> {
        self.create_stream().await?;

        let tid = self.next_transaction();
        self.send(&Command::new(CMD_PLAY, tid, AmfValue::Null).with_arg(stream))
            .await?;
        self.wait_status(NS_PLAY_START).await.stage("play")?;

        tracing::debug!(stream, stream_id = self.stream_id, "Backend started play");
        Ok(())
    }

    /// Stream id the backend assigned in `createStream`
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Next message that is not protocol control
    #[cfg(test)]
    pub(crate) async fn read_message(&mut self) -> Result<RtmpMessage> {
        loop {
            let message = self.reader.read_message().await?;
            if let Some(sequence) = self.reader.take_ack() {
                self.writer
                    .write_message(&RtmpMessage::acknowledgement(sequence))
                    .await?;
            }
            if !self.reader.apply_control(&message)? {
                return Ok(message);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn write_message(&mut self, message: &RtmpMessage) -> Result<()> {
        self.writer.write_message(message).await
    }

    /// Split into reader, writer and backend stream id for relaying
    pub fn into_parts(self) -> (ChunkReader<OwnedReadHalf>, ChunkWriter<OwnedWriteHalf>, u32) {
        (self.reader, self.writer, self.stream_id)
    }

    fn next_transaction(&mut self) -> f64 {
        self.transaction_id += 1.0;
        self.transaction_id
    }

    async fn create_stream(&mut self) -> Result<()> {
        let tid = self.next_transaction();
        let reply = self
            .call(Command::new(CMD_CREATE_STREAM, tid, AmfValue::Null), 0)
            .await
            .stage(CMD_CREATE_STREAM)?;

        self.stream_id = match reply.args.first().and_then(|v| v.as_number()) {
            Some(id) if (1.0..=f64::from(u32::MAX)).contains(&id) => id as u32,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "createStream returned stream id {other:?}"
                )))
            }
        };
        Ok(())
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        let chunk_stream = if self.stream_id == 0 {
            csid::COMMAND
        } else {
            csid::STREAM_COMMAND
        };
        self.writer
            .write_message(&RtmpMessage::command(chunk_stream, self.stream_id, command))
            .await
    }

    /// Send `command` on `stream_id` and wait for its `_result`
    async fn call(&mut self, command: Command, stream_id: u32) -> Result<Command> {
        self.writer
            .write_message(&RtmpMessage::command(csid::COMMAND, stream_id, &command))
            .await?;

        loop {
            let (_, reply) = read_command(&mut self.reader, &mut self.writer).await?;
            if reply.transaction_id != command.transaction_id {
                tracing::trace!(command = %reply.name, "Skipping backend command");
                continue;
            }
            match reply.name.as_str() {
                CMD_RESULT => return Ok(reply),
                CMD_ERROR => {
                    return Err(Error::BackendUnavailable(format!(
                        "{} rejected with {}",
                        command.name,
                        reply.status_code().unwrap_or("no code")
                    )))
                }
                _ => {}
            }
        }
    }

    /// Wait for an onStatus carrying `expected`
    ///
    /// Play.Reset precedes Play.Start and is skipped; any other status code
    /// means the backend refused.
    async fn wait_status(&mut self, expected: &str) -> Result<()> {
        loop {
            let (_, reply) = read_command(&mut self.reader, &mut self.writer).await?;
            match reply.name.as_str() {
                CMD_ON_STATUS => match reply.status_code() {
                    Some(code) if code == expected => return Ok(()),
                    Some(NS_PLAY_RESET) => continue,
                    code => {
                        return Err(Error::BackendUnavailable(format!(
                            "onStatus code={} not {expected}",
                            code.unwrap_or_default()
                        )))
                    }
                },
                CMD_ERROR => {
                    return Err(Error::BackendUnavailable(format!(
                        "backend error {}",
                        reply.status_code().unwrap_or_default()
                    )))
                }
                _ => tracing::trace!(command = %reply.name, "Skipping backend command"),
            }
        }
    }
}

/// RTMP app of a tcUrl: its path without the leading slash
fn app_of(tc_url: &str) -> String {
    url::Url::parse(tc_url)
        .map(|u| u.path().trim_start_matches('/').to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{msg_type, NC_CONNECT_SUCCESS};
    use crate::protocol::handshake::server_handshake;
    use tokio::net::TcpListener;

    /// Accepts one client, answers commands by name and reports what it saw
    async fn mock_backend(reject_publish: bool) -> (u16, tokio::task::JoinHandle<Vec<Command>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            server_handshake(&mut stream).await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = ChunkReader::new(r);
            let mut writer = ChunkWriter::new(w);
            let mut seen = Vec::new();

            loop {
                let Ok((_, cmd)) = read_command(&mut reader, &mut writer).await else {
                    break;
                };
                seen.push(cmd.clone());
                let tid = cmd.transaction_id;
                let reply = match cmd.name.as_str() {
                    "connect" => Command::new(CMD_RESULT, tid, AmfValue::Null)
                        .with_arg(AmfValue::object([("code", NC_CONNECT_SUCCESS)])),
                    "createStream" => {
                        Command::new(CMD_RESULT, tid, AmfValue::Null).with_arg(7.0)
                    }
                    "publish" if reject_publish => Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null)
                        .with_arg(AmfValue::object([("code", "NetStream.Publish.BadName")])),
                    "publish" => Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null)
                        .with_arg(AmfValue::object([("code", NS_PUBLISH_START)])),
                    "play" => {
                        let reset = Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null)
                            .with_arg(AmfValue::object([("code", NS_PLAY_RESET)]));
                        writer
                            .write_message(&RtmpMessage::command(5, 7, &reset))
                            .await
                            .unwrap();
                        Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null)
                            .with_arg(AmfValue::object([("code", NS_PLAY_START)]))
                    }
                    _ => Command::new(CMD_RESULT, tid, AmfValue::Null),
                };
                writer
                    .write_message(&RtmpMessage::command(3, 0, &reply))
                    .await
                    .unwrap();
            }
            seen
        });

        (port, task)
    }

    #[test]
    fn test_app_of() {
        assert_eq!(app_of("rtmp://127.0.0.1/live"), "live");
        assert_eq!(app_of("rtmp://host:1935/a/b?token=1"), "a/b");
        assert_eq!(app_of("not a url"), "");
    }

    #[tokio::test]
    async fn test_publish_sequence() {
        let (port, backend) = mock_backend(false).await;

        let mut client = BackendClient::connect("127.0.0.1", port, "rtmp://127.0.0.1/live", 4096)
            .await
            .unwrap();
        client.publish("livestream").await.unwrap();
        assert_eq!(client.stream_id(), 7);
        drop(client);

        let seen = backend.await.unwrap();
        let names: Vec<_> = seen.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["connect", "releaseStream", "FCPublish", "createStream", "publish"]
        );
        assert_eq!(
            seen[0].command_object.get_str("tcUrl"),
            Some("rtmp://127.0.0.1/live")
        );
        assert_eq!(seen[0].command_object.get_str("app"), Some("live"));
        assert_eq!(seen[4].args, vec![AmfValue::from("livestream"), AmfValue::from("live")]);
        let tids: Vec<_> = seen.iter().map(|c| c.transaction_id).collect();
        assert_eq!(tids, [1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn test_play_skips_reset() {
        let (port, backend) = mock_backend(false).await;

        let mut client = BackendClient::connect("127.0.0.1", port, "rtmp://127.0.0.1/live", 128)
            .await
            .unwrap();
        client.play("livestream").await.unwrap();
        assert_eq!(client.stream_id(), 7);
        drop(client);

        let names: Vec<_> = backend
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["connect", "createStream", "play"]);
    }

    #[tokio::test]
    async fn test_rejected_publish() {
        let (port, _backend) = mock_backend(true).await;

        let mut client = BackendClient::connect("127.0.0.1", port, "rtmp://127.0.0.1/live", 4096)
            .await
            .unwrap();
        let err = client.publish("livestream").await.unwrap_err();
        assert!(matches!(err.root(), Error::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dial_failure_is_staged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = BackendClient::connect("127.0.0.1", port, "rtmp://127.0.0.1/live", 4096)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().starts_with("dial backend"));
    }

    #[tokio::test]
    async fn test_read_message_skips_control() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            server_handshake(&mut stream).await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = ChunkReader::new(r);
            let mut writer = ChunkWriter::new(w);
            let (_, cmd) = read_command(&mut reader, &mut writer).await.unwrap();
            let reply = Command::new(CMD_RESULT, cmd.transaction_id, AmfValue::Null);
            writer.write_message(&RtmpMessage::set_chunk_size(1024)).await.unwrap();
            writer.set_chunk_size(1024).unwrap();
            writer
                .write_message(&RtmpMessage::command(3, 0, &reply))
                .await
                .unwrap();
            let video = RtmpMessage::new(6, msg_type::VIDEO, 1, 40, vec![0x17; 2000].into());
            writer.write_message(&video).await.unwrap();
            // Hold the socket open until the client is done.
            let _ = reader.read_message().await;
        });

        let mut client = BackendClient::connect("127.0.0.1", port, "rtmp://127.0.0.1/live", 4096)
            .await
            .unwrap();
        let message = client.read_message().await.unwrap();
        assert_eq!(message.type_id, msg_type::VIDEO);
        assert_eq!(message.payload.len(), 2000);
        assert_eq!(message.timestamp, 40);
    }
}
