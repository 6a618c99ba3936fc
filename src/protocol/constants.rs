//! RTMP protocol constants

/// Size of C1/S1/C2/S2
pub const HANDSHAKE_SIZE: usize = 1536;

/// Plain RTMP
pub const RTMP_VERSION: u8 = 3;

/// Chunk size every peer starts with
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size the proxy announces on each hop
pub const PROXY_CHUNK_SIZE: u32 = 60000;

/// Largest chunk size the protocol allows (31 bits)
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// Reassembly limit for a single message
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Timestamps at or above this go into the extended field
pub const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

pub const WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Message type ids
pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACKNOWLEDGEMENT: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF3: u8 = 15;
    pub const COMMAND_AMF3: u8 = 17;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
    pub const AGGREGATE: u8 = 22;
}

/// Chunk stream ids the proxy writes on
pub mod csid {
    pub const PROTOCOL_CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const STREAM_COMMAND: u32 = 5;
}

/// User control event types
pub mod user_control {
    pub const STREAM_BEGIN: u16 = 0;
}

/// Stream id the proxy hands to its own clients in `createStream`
pub const CLIENT_STREAM_ID: u32 = 1;

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_PLAY: &str = "play";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_ON_FC_PUBLISH: &str = "onFCPublish";

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const NS_PLAY_START: &str = "NetStream.Play.Start";
pub const NS_PLAY_RESET: &str = "NetStream.Play.Reset";
pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
