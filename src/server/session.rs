//! One proxied RTMP connection
//!
//! ```text
//!  client                    proxy                         backend
//!    |-- handshake --------->|                                |
//!    |-- connect ----------->|                                |
//!    |<- _result ------------|                                |
//!    |-- createStream ------>|                                |
//!    |-- publish / play ---->|-- pick(tcUrl/stream) --------->|
//!    |                       |-- connect..publish / play ---->|
//!    |<- onStatus -----------|<- onStatus --------------------|
//!    |<========== messages relayed, stream ids rewritten =====>|
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::amf::AmfValue;
use crate::client::BackendClient;
use crate::error::{Error, HandshakeError, Result, ResultExt};
use crate::protocol::chunk::read_command;
use crate::protocol::constants::{
    csid, msg_type, CLIENT_STREAM_ID, CMD_CONNECT, CMD_CREATE_STREAM, CMD_ON_FC_PUBLISH,
    CMD_ON_STATUS, CMD_PLAY, CMD_PUBLISH, CMD_RESULT, NC_CONNECT_SUCCESS, NS_PLAY_START,
    NS_PUBLISH_START,
};
use crate::protocol::handshake::server_handshake;
use crate::protocol::{ChunkReader, ChunkWriter, Command, RtmpMessage};
use crate::registry::BackendRegistry;
use crate::server::config::RtmpConfig;
use crate::stream_url::rtmp_stream_url;

/// Client id reported in the publish onStatus, as SRS does
const CLIENT_ID: &str = "ASAICiss";

/// What the client asked for once identified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Publisher,
    Player,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientRole::Publisher => write!(f, "publisher"),
            ClientRole::Player => write!(f, "player"),
        }
    }
}

/// Result of the connect and identify exchange
#[derive(Debug, Clone)]
pub struct Identity {
    pub tc_url: String,
    pub stream_name: String,
    pub role: ClientRole,
}

/// A single client connection
pub struct RtmpSession {
    id: u64,
    peer: SocketAddr,
    config: Arc<RtmpConfig>,
    registry: Arc<BackendRegistry>,
}

impl RtmpSession {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        config: Arc<RtmpConfig>,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            id,
            peer,
            config,
            registry,
        }
    }

    /// Serve the connection until either side closes or `cancel` fires
    pub async fn run(self, mut stream: TcpStream, cancel: CancellationToken) -> Result<()> {
        tokio::time::timeout(self.config.handshake_timeout, server_handshake(&mut stream))
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .stage("client handshake")?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = ChunkReader::new(read_half);
        let mut writer = ChunkWriter::new(write_half);

        let identity = tokio::time::timeout(
            self.config.identify_timeout,
            identify(&mut reader, &mut writer, &self.config, self.id),
        )
        .await
        .map_err(|_| Error::ProtocolViolation("client did not publish or play in time".into()))?
        .stage("identify client")?;

        tracing::info!(
            session_id = self.id,
            peer = %self.peer,
            tc_url = %identity.tc_url,
            stream = %identity.stream_name,
            role = %identity.role,
            "RTMP client identified"
        );

        let backend = tokio::time::timeout(self.config.backend_timeout, self.open_backend(&identity))
            .await
            .map_err(|_| Error::BackendUnavailable("backend setup timed out".into()))??;

        start_client(&mut writer, identity.role, &identity.stream_name)
            .await
            .stage("start client")?;

        let (backend_reader, backend_writer, backend_stream_id) = backend.into_parts();
        tracing::debug!(
            session_id = self.id,
            backend_stream_id,
            "RTMP relay started"
        );

        relay(
            reader,
            writer,
            backend_reader,
            backend_writer,
            backend_stream_id,
            cancel,
        )
        .await
    }

    async fn open_backend(&self, identity: &Identity) -> Result<BackendClient> {
        let stream_url = rtmp_stream_url(&identity.tc_url, &identity.stream_name)?;
        let backend = self.registry.pick(&stream_url).await?;
        let port = backend.rtmp_port()?;

        tracing::info!(
            session_id = self.id,
            stream = %stream_url,
            backend = %backend.ip,
            port,
            "RTMP backend selected"
        );

        let mut client = BackendClient::connect(
            &backend.ip,
            port,
            &identity.tc_url,
            self.config.chunk_size,
        )
        .await?;
        match identity.role {
            ClientRole::Publisher => client.publish(&identity.stream_name).await?,
            ClientRole::Player => client.play(&identity.stream_name).await?,
        }
        Ok(client)
    }
}

/// Answer `connect` and the calls leading up to publish or play
pub async fn identify<R, W>(
    reader: &mut ChunkReader<R>,
    writer: &mut ChunkWriter<W>,
    config: &RtmpConfig,
    session_id: u64,
) -> Result<Identity>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (_, connect) = read_command(reader, writer).await?;
    if connect.name != CMD_CONNECT {
        return Err(Error::ProtocolViolation(format!(
            "expected connect, got {}",
            connect.name
        )));
    }
    let tc_url = connect
        .command_object
        .get_str("tcUrl")
        .ok_or_else(|| Error::ProtocolViolation("connect without tcUrl".into()))?
        .to_string();
    tracing::debug!(session_id, tc_url = %tc_url, "RTMP connect");

    writer
        .write_message(&RtmpMessage::window_ack_size(config.window_ack_size))
        .await?;
    writer
        .write_message(&RtmpMessage::set_peer_bandwidth(config.peer_bandwidth))
        .await?;
    writer
        .write_message(&RtmpMessage::set_chunk_size(config.chunk_size))
        .await?;
    writer.set_chunk_size(config.chunk_size)?;
    writer
        .write_message(&RtmpMessage::command(
            csid::COMMAND,
            0,
            &connect_result(connect.transaction_id, session_id),
        ))
        .await?;

    let mut stream_id = 0;
    loop {
        let (_, command) = read_command(reader, writer).await?;
        let tid = command.transaction_id;

        let role = match command.name.as_str() {
            CMD_CREATE_STREAM => {
                stream_id = CLIENT_STREAM_ID;
                let reply =
                    Command::new(CMD_RESULT, tid, AmfValue::Null).with_arg(CLIENT_STREAM_ID);
                writer
                    .write_message(&RtmpMessage::command(csid::COMMAND, 0, &reply))
                    .await?;
                continue;
            }
            CMD_PUBLISH => {
                let info = AmfValue::object([
                    ("code", NS_PUBLISH_START),
                    ("description", "Started publishing stream."),
                ]);
                let reply = Command::new(CMD_ON_FC_PUBLISH, 0.0, AmfValue::Null).with_arg(info);
                writer
                    .write_message(&RtmpMessage::command(csid::COMMAND, stream_id, &reply))
                    .await?;
                ClientRole::Publisher
            }
            CMD_PLAY => ClientRole::Player,
            _ => {
                // releaseStream, FCPublish, getStreamLength and friends
                let reply = Command::new(CMD_RESULT, tid, AmfValue::Null).with_arg(AmfValue::Null);
                writer
                    .write_message(&RtmpMessage::command(csid::COMMAND, stream_id, &reply))
                    .await?;
                continue;
            }
        };

        let stream_name = command
            .stream_name()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::ProtocolViolation(format!("{} without stream name", command.name)))?
            .to_string();

        return Ok(Identity {
            tc_url,
            stream_name,
            role,
        });
    }
}

fn connect_result(transaction_id: f64, session_id: u64) -> Command {
    let properties = AmfValue::object([
        ("fmsVer", AmfValue::from("FMS/3,5,3,888")),
        ("capabilities", AmfValue::Number(127.0)),
        ("mode", AmfValue::Number(1.0)),
    ]);

    let data = AmfValue::ecma_array([
        ("version", "3,5,3,888".to_string()),
        ("srs_version", crate::VERSION.to_string()),
        ("srs_id", session_id.to_string()),
    ]);
    let info = AmfValue::object([
        ("level", AmfValue::from("status")),
        ("code", AmfValue::from(NC_CONNECT_SUCCESS)),
        ("description", AmfValue::from("Connection succeeded")),
        ("objectEncoding", AmfValue::Number(0.0)),
        ("data", data),
    ]);

    Command::new(CMD_RESULT, transaction_id, properties).with_arg(info)
}

/// Tell the client its publish or play has started on the backend
async fn start_client<W>(writer: &mut ChunkWriter<W>, role: ClientRole, stream: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let info = match role {
        ClientRole::Publisher => AmfValue::object([
            ("level", "status"),
            ("code", NS_PUBLISH_START),
            ("description", "Started publishing stream."),
            ("clientid", CLIENT_ID),
        ]),
        ClientRole::Player => {
            writer
                .write_message(&RtmpMessage::stream_begin(CLIENT_STREAM_ID))
                .await?;
            AmfValue::object([
                ("level", "status"),
                ("code", NS_PLAY_START),
                ("description", "Started playing stream."),
                ("details", stream),
                ("clientid", CLIENT_ID),
            ])
        }
    };

    let status = Command::new(CMD_ON_STATUS, 0.0, AmfValue::Null).with_arg(info);
    writer
        .write_message(&RtmpMessage::command(
            csid::STREAM_COMMAND,
            CLIENT_STREAM_ID,
            &status,
        ))
        .await
}

/// Relay whole messages both ways until one side closes
///
/// Each hop keeps its own chunk size and acknowledgement window; protocol
/// control is consumed per hop and never forwarded.
pub async fn relay<CR, CW, BR, BW>(
    mut client_reader: ChunkReader<CR>,
    client_writer: ChunkWriter<CW>,
    mut backend_reader: ChunkReader<BR>,
    backend_writer: ChunkWriter<BW>,
    backend_stream_id: u32,
    cancel: CancellationToken,
) -> Result<()>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let client_writer = Mutex::new(client_writer);
    let backend_writer = Mutex::new(backend_writer);

    let upstream = forward(
        &mut client_reader,
        &client_writer,
        &backend_writer,
        CLIENT_STREAM_ID,
        backend_stream_id,
    );
    let downstream = forward(
        &mut backend_reader,
        &backend_writer,
        &client_writer,
        backend_stream_id,
        CLIENT_STREAM_ID,
    );

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        r = upstream => r.stage("client to backend"),
        r = downstream => r.stage("backend to client"),
    };

    let _ = backend_writer.lock().await.shutdown().await;
    let _ = client_writer.lock().await.shutdown().await;
    result
}

async fn forward<R, A, W>(
    reader: &mut ChunkReader<R>,
    ack_to: &Mutex<ChunkWriter<A>>,
    out: &Mutex<ChunkWriter<W>>,
    from_stream_id: u32,
    to_stream_id: u32,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    A: AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut message = reader.read_message().await?;
        if let Some(sequence) = reader.take_ack() {
            ack_to
                .lock()
                .await
                .write_message(&RtmpMessage::acknowledgement(sequence))
                .await?;
        }
        if reader.apply_control(&message)? {
            continue;
        }

        rewrite_stream_id(&mut message, from_stream_id, to_stream_id);
        out.lock().await.write_message(&message).await?;
    }
}

/// Map a message from one hop's stream id onto the other's
///
/// Stream 0 is the connection's control stream and stays as is. User
/// control events 0-4 carry a stream id in their body, which is mapped too.
pub fn rewrite_stream_id(message: &mut RtmpMessage, from: u32, to: u32) {
    if message.stream_id == from {
        message.stream_id = to;
    }

    if message.type_id == msg_type::USER_CONTROL && message.payload.len() >= 6 {
        let mut body = &message.payload[..];
        let event = body.get_u16();
        let stream_id = body.get_u32();
        if event <= 4 && stream_id == from {
            let mut payload = BytesMut::from(&message.payload[..]);
            payload[2..6].copy_from_slice(&to.to_be_bytes());
            message.payload = payload.freeze();
        }
    }
}
