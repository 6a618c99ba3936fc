//! Backend media server records
//!
//! A [`BackendServer`] is what an SRS instance reports when it registers
//! itself with the proxy. The JSON field names are the ones SRS sends.

use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::stream_url::parse_listen_endpoint;

/// A registered backend media server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    /// Routing identity and registry key
    #[serde(default)]
    pub ip: String,

    /// Operator-assigned device id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Stable across restarts
    #[serde(rename = "server", default)]
    pub server_id: String,

    /// Changes on every restart
    #[serde(rename = "service", default)]
    pub service_id: String,

    #[serde(default, deserialize_with = "string_or_number")]
    pub pid: String,

    #[serde(default)]
    pub rtmp: Vec<String>,
    #[serde(default)]
    pub http: Vec<String>,
    #[serde(default)]
    pub api: Vec<String>,
    #[serde(default)]
    pub srt: Vec<String>,
    #[serde(default)]
    pub rtc: Vec<String>,

    /// Last registration time, set by the registry
    #[serde(skip, default = "Instant::now")]
    pub updated_at: Instant,
}

impl BackendServer {
    /// Create a server record with the mandatory identity fields
    pub fn new(
        ip: impl Into<String>,
        server_id: impl Into<String>,
        service_id: impl Into<String>,
        pid: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            device_id: None,
            server_id: server_id.into(),
            service_id: service_id.into(),
            pid: pid.into(),
            rtmp: Vec::new(),
            http: Vec::new(),
            api: Vec::new(),
            srt: Vec::new(),
            rtc: Vec::new(),
            updated_at: Instant::now(),
        }
    }

    /// Identity used for logging and dedup: `server:service:pid`
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.server_id, self.service_id, self.pid)
    }

    /// Reject registrations that cannot be routed to
    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("ip", self.ip.is_empty()),
            ("server", self.server_id.is_empty()),
            ("service", self.service_id.is_empty()),
            ("pid", self.pid.is_empty()),
            ("rtmp", self.rtmp.is_empty()),
        ]
        .into_iter()
        .find(|(_, empty)| *empty);

        match missing {
            Some((field, _)) => Err(Error::Parse(format!("registration requires {field}"))),
            None => Ok(()),
        }
    }

    /// Port of the first RTMP listen endpoint
    pub fn rtmp_port(&self) -> Result<u16> {
        self.first_port(&self.rtmp, "rtmp")
    }

    /// Port of the first HTTP stream listen endpoint
    pub fn http_port(&self) -> Result<u16> {
        self.first_port(&self.http, "http stream")
    }

    /// Port of the first HTTP API listen endpoint
    pub fn api_port(&self) -> Result<u16> {
        self.first_port(&self.api, "http api")
    }

    /// Port of the first SRT listen endpoint
    pub fn srt_port(&self) -> Result<u16> {
        self.first_port(&self.srt, "srt")
    }

    /// Port of the first WebRTC UDP listen endpoint
    pub fn rtc_port(&self) -> Result<u16> {
        self.first_port(&self.rtc, "rtc")
    }

    /// Ports of every WebRTC UDP listen endpoint
    pub fn rtc_ports(&self) -> Result<Vec<u16>> {
        self.rtc
            .iter()
            .map(|ep| {
                parse_listen_endpoint(ep)
                    .map(|e| e.port)
                    .map_err(|_| Error::Configuration(format!("backend {} rtc endpoint {ep}", self)))
            })
            .collect()
    }

    fn first_port(&self, endpoints: &[String], what: &str) -> Result<u16> {
        let endpoint = endpoints
            .first()
            .ok_or_else(|| Error::Configuration(format!("backend {} has no {what} server", self)))?;
        parse_listen_endpoint(endpoint)
            .map(|e| e.port)
            .map_err(|_| Error::Configuration(format!("backend {} {what} endpoint {endpoint}", self)))
    }
}

impl fmt::Display for BackendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SRS ip={}, id={}", self.ip, self.id())?;
        if let Some(device) = &self.device_id {
            write!(f, ", device={device}")?;
        }
        Ok(())
    }
}

/// Short unique token for generated server ids
pub(crate) fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{:x}", nanos ^ ((std::process::id() as u64) << 32))
}

/// SRS sends `pid` as a string, older builds as a number
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pid {
        Text(String),
        Number(u64),
    }

    Ok(match Pid::deserialize(deserializer)? {
        Pid::Text(s) => s,
        Pid::Number(n) => n.to_string(),
    })
}
