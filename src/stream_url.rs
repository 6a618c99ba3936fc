//! Stream URL resolution
//!
//! Every inbound session, whatever its protocol, is reduced to one canonical
//! identifier `vhost/app/stream` before a backend is chosen. Hosts that are
//! bare names or IPv4 literals collapse into the default vhost, so
//! `rtmp://10.0.0.1/live/s1` and `srt://srs/live/s1` name the same stream.

use std::net::Ipv4Addr;

use url::Url;

use crate::error::{Error, Result};

/// Vhost used when the request host does not name a real domain
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// Path prefix of the WHIP signaling endpoint
pub const WHIP_PATH: &str = "/rtc/v1/whip/";

/// Path prefix of the WHEP signaling endpoint
pub const WHEP_PATH: &str = "/rtc/v1/whep/";

/// Media suffixes stripped from HTTP stream paths
const MEDIA_EXTENSIONS: &[&str] = &[".flv", ".m3u8", ".ts", ".aac", ".mp3"];

/// Map a URL to its canonical `vhost/app/stream` form
///
/// The port is ignored. A hostname without a dot, or one that is an IPv4
/// literal, resolves to [`DEFAULT_VHOST`].
pub fn resolve(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| Error::Parse(format!("url {url}: {e}")))?;
    let host = parsed.host_str().unwrap_or_default();

    let default_vhost = !host.contains('.') || host.parse::<Ipv4Addr>().is_ok();
    let vhost = if default_vhost { DEFAULT_VHOST } else { host };

    Ok(format!("{}{}", vhost, parsed.path()))
}

/// A parsed listen endpoint such as `udp://0.0.0.0:8000`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    pub protocol: String,
    pub ip: String,
    pub port: u16,
}

/// Parse `port`, `ip:port` or `proto://ip:port`
///
/// Protocol defaults to `tcp` and ip to the empty string (any address).
pub fn parse_listen_endpoint(endpoint: &str) -> Result<ListenEndpoint> {
    let (protocol, rest) = match endpoint.split_once("://") {
        Some((proto, rest)) => (proto.to_string(), rest),
        None => ("tcp".to_string(), endpoint),
    };

    let (ip, port) = match rest.rsplit_once(':') {
        Some((ip, port)) => (ip.trim_start_matches('[').trim_end_matches(']'), port),
        None => ("", rest),
    };

    let port = port
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("invalid listen endpoint {endpoint}")))?;

    Ok(ListenEndpoint {
        protocol,
        ip: ip.to_string(),
        port,
    })
}

/// Split an SRT stream-id of the form `#!::r=live/stream,h=host`
///
/// Returns `(host, resource)`. A missing host becomes `localhost`; keys
/// other than `h` and `r` are ignored.
pub fn parse_srt_stream_id(stream_id: &str) -> Result<(String, String)> {
    let body = stream_id
        .strip_prefix("#!::")
        .ok_or_else(|| Error::Parse(format!("invalid SRT stream id {stream_id}")))?;

    let mut host = String::new();
    let mut resource = String::new();
    for pair in body.split(',') {
        match pair.split_once('=') {
            Some(("h", v)) => host = v.to_string(),
            Some(("r", v)) => resource = v.to_string(),
            _ => {}
        }
    }

    if host.is_empty() {
        host = "localhost".to_string();
    }
    Ok((host, resource))
}

/// Canonical stream URL for an SRT stream-id
pub fn srt_stream_url(stream_id: &str) -> Result<String> {
    let (host, resource) = parse_srt_stream_id(stream_id)?;
    let resource = resource.trim_start_matches('/');
    resolve(&format!("srt://{host}/{resource}"))
}

/// Canonical stream URL for an RTMP `tcUrl` plus stream name
///
/// Any query string on the stream name (auth tokens and the like) is dropped.
pub fn rtmp_stream_url(tc_url: &str, stream_name: &str) -> Result<String> {
    let stream = stream_name.split('?').next().unwrap_or_default();
    let tc_url = tc_url.split('?').next().unwrap_or_default();
    resolve(&format!("{}/{}", tc_url.trim_end_matches('/'), stream))
}

/// Build the full URL of an HTTP request in `scheme://host/app/stream` form
///
/// WHIP and WHEP carry the stream in the `app` and `stream` query
/// parameters; other requests use their path with any media suffix removed.
pub fn request_stream_url(scheme: &str, host: &str, path: &str, query: Option<&str>) -> String {
    let stream_path = if path.starts_with(WHIP_PATH) || path.starts_with(WHEP_PATH) {
        let mut app = String::new();
        let mut stream = String::new();
        for (k, v) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match k.as_ref() {
                "app" => app = v.into_owned(),
                "stream" => stream = v.into_owned(),
                _ => {}
            }
        }
        format!("/{app}/{stream}")
    } else {
        let mut p = path.to_string();
        if let Some(ext) = MEDIA_EXTENSIONS.iter().find(|ext| p.ends_with(*ext)) {
            p.truncate(p.len() - ext.len());
        }
        p
    };

    let host = if host.is_empty() { "localhost" } else { host };
    format!("{scheme}://{host}{stream_path}")
}
