//! Proxy configuration
//!
//! Every option is a command line flag backed by a `PROXY_*` environment
//! variable, so the proxy runs unchanged from a container env file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;

use crate::error::{Error, Result};
use crate::registry::{BackendServer, RegistryConfig};
use crate::server::RtmpConfig;
use crate::srt::SrtConfig;
use crate::stream_url::parse_listen_endpoint;

/// Interval at which the default backend re-registers itself
pub const DEFAULT_BACKEND_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug, Clone)]
#[command(name = "srs-proxy", version, about = "Stream-aware reverse proxy for SRS media servers")]
pub struct ProxyConfig {
    /// HTTP API listen endpoint (WHIP/WHEP and versions)
    #[arg(long, env = "PROXY_HTTP_API", default_value = "11985")]
    pub http_api: String,

    /// HTTP stream listen endpoint (HTTP-FLV, HTTP-TS and HLS)
    #[arg(long, env = "PROXY_HTTP_SERVER", default_value = "18080")]
    pub http_server: String,

    /// System API listen endpoint (backend registration)
    #[arg(long, env = "PROXY_SYSTEM_API", default_value = "12025")]
    pub system_api: String,

    /// RTMP listen endpoint
    #[arg(long, env = "PROXY_RTMP_SERVER", default_value = "11935")]
    pub rtmp_server: String,

    /// WebRTC UDP listen endpoint
    #[arg(long, env = "PROXY_WEBRTC_SERVER", default_value = "18000")]
    pub webrtc_server: String,

    /// SRT UDP listen endpoint
    #[arg(long, env = "PROXY_SRT_SERVER", default_value = "20080")]
    pub srt_server: String,

    /// Time given to servers to finish after a quit signal
    #[arg(long, env = "PROXY_GRACE_QUIT_TIMEOUT", default_value = "20s", value_parser = parse_duration)]
    pub grace_quit_timeout: Duration,

    /// Hard deadline after a quit signal
    #[arg(long, env = "PROXY_FORCE_QUIT_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub force_quit_timeout: Duration,

    /// A backend is alive if it registered within this window
    #[arg(long, env = "PROXY_BACKEND_ALIVE", default_value = "300s", value_parser = parse_duration)]
    pub backend_alive: Duration,

    /// Idle time after which a stream forgets its backend
    #[arg(long, env = "PROXY_STREAM_PIN_TTL", default_value = "600s", value_parser = parse_duration)]
    pub stream_pin_ttl: Duration,

    /// Idle time after which SRT and WebRTC sessions are dropped
    #[arg(long, env = "PROXY_SESSION_IDLE_TIMEOUT", default_value = "120s", value_parser = parse_duration)]
    pub session_idle_timeout: Duration,

    /// Register a static backend at startup (on/off)
    #[arg(
        long,
        env = "PROXY_DEFAULT_BACKEND_ENABLED",
        default_value = "off",
        value_parser = parse_switch,
        action = clap::ArgAction::Set
    )]
    pub default_backend_enabled: bool,

    #[arg(long, env = "PROXY_DEFAULT_BACKEND_IP", default_value = "127.0.0.1")]
    pub default_backend_ip: String,

    #[arg(long, env = "PROXY_DEFAULT_BACKEND_RTMP", default_value = "1935")]
    pub default_backend_rtmp: String,

    #[arg(long, env = "PROXY_DEFAULT_BACKEND_HTTP", default_value = "8080")]
    pub default_backend_http: String,

    #[arg(long, env = "PROXY_DEFAULT_BACKEND_API", default_value = "1985")]
    pub default_backend_api: String,

    #[arg(long, env = "PROXY_DEFAULT_BACKEND_SRT", default_value = "10080")]
    pub default_backend_srt: String,

    #[arg(long, env = "PROXY_DEFAULT_BACKEND_RTC", default_value = "8000")]
    pub default_backend_rtc: String,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json
    #[arg(long, env = "PROXY_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::parse_from(["srs-proxy"])
    }
}

impl ProxyConfig {
    /// Check every listen endpoint and the default backend
    pub fn validate(&self) -> Result<()> {
        for (name, endpoint) in self.listen_endpoints() {
            listen_addr(endpoint).map_err(|e| Error::Configuration(format!("{name}: {e}")))?;
        }

        if self.default_backend_enabled {
            if self.default_backend_ip.is_empty() {
                return Err(Error::Configuration("empty default backend ip".into()));
            }
            if self.default_backend_rtmp.is_empty() {
                return Err(Error::Configuration("empty default backend rtmp".into()));
            }
        }

        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            return Err(Error::Configuration(format!(
                "log format {} is neither pretty nor json",
                self.log_format
            )));
        }
        Ok(())
    }

    pub fn http_api_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.http_api)
    }

    pub fn http_server_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.http_server)
    }

    pub fn system_api_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.system_api)
    }

    pub fn rtmp_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.rtmp_server)
    }

    pub fn webrtc_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.webrtc_server)
    }

    pub fn srt_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.srt_server)
    }

    /// The static debugging backend, when enabled
    ///
    /// Optional endpoints left empty are not advertised.
    pub fn default_backend(&self) -> Option<BackendServer> {
        if !self.default_backend_enabled {
            return None;
        }

        let pid = std::process::id().to_string();
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut server = BackendServer::new(
            self.default_backend_ip.clone(),
            format!("default-{pid}"),
            format!("{started:x}"),
            pid,
        );

        let optional = |value: &str| {
            if value.is_empty() {
                Vec::new()
            } else {
                vec![value.to_string()]
            }
        };
        server.rtmp = optional(&self.default_backend_rtmp);
        server.http = optional(&self.default_backend_http);
        server.api = optional(&self.default_backend_api);
        server.srt = optional(&self.default_backend_srt);
        server.rtc = optional(&self.default_backend_rtc);
        Some(server)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .alive_window(self.backend_alive)
            .pin_ttl(self.stream_pin_ttl)
    }

    pub fn rtmp_config(&self) -> Result<RtmpConfig> {
        Ok(RtmpConfig::with_addr(self.rtmp_addr()?))
    }

    pub fn srt_config(&self) -> SrtConfig {
        SrtConfig {
            idle_timeout: self.session_idle_timeout,
            ..Default::default()
        }
    }

    pub fn with_http_api(mut self, endpoint: impl Into<String>) -> Self {
        self.http_api = endpoint.into();
        self
    }

    pub fn with_http_server(mut self, endpoint: impl Into<String>) -> Self {
        self.http_server = endpoint.into();
        self
    }

    pub fn with_system_api(mut self, endpoint: impl Into<String>) -> Self {
        self.system_api = endpoint.into();
        self
    }

    pub fn with_rtmp_server(mut self, endpoint: impl Into<String>) -> Self {
        self.rtmp_server = endpoint.into();
        self
    }

    pub fn with_webrtc_server(mut self, endpoint: impl Into<String>) -> Self {
        self.webrtc_server = endpoint.into();
        self
    }

    pub fn with_srt_server(mut self, endpoint: impl Into<String>) -> Self {
        self.srt_server = endpoint.into();
        self
    }

    /// Enable the static backend at `ip` with RTMP on `rtmp`
    pub fn with_default_backend(mut self, ip: impl Into<String>, rtmp: impl Into<String>) -> Self {
        self.default_backend_enabled = true;
        self.default_backend_ip = ip.into();
        self.default_backend_rtmp = rtmp.into();
        self
    }

    fn listen_endpoints(&self) -> [(&'static str, &str); 6] {
        [
            ("http api", &self.http_api),
            ("http server", &self.http_server),
            ("system api", &self.system_api),
            ("rtmp server", &self.rtmp_server),
            ("webrtc server", &self.webrtc_server),
            ("srt server", &self.srt_server),
        ]
    }
}

/// Socket address of a listen endpoint; an empty ip binds every interface
pub fn listen_addr(endpoint: &str) -> Result<SocketAddr> {
    let parsed = parse_listen_endpoint(endpoint)?;
    let ip = if parsed.ip.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        parsed
            .ip
            .parse()
            .map_err(|_| Error::Configuration(format!("listen ip {} in {endpoint}", parsed.ip)))?
    };
    Ok(SocketAddr::new(ip, parsed.port))
}

/// Parse `500ms`, `30s`, `5m`, `1h` or a bare number of seconds
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "" | "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(format!("invalid duration unit {unit:?} in {value:?}")),
    }
}

/// Parse an on/off switch
pub fn parse_switch(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" | "" => Ok(false),
        other => Err(format!("expected on or off, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.http_api_addr().unwrap().port(), 11985);
        assert_eq!(config.http_server_addr().unwrap().port(), 18080);
        assert_eq!(config.system_api_addr().unwrap().port(), 12025);
        assert_eq!(config.rtmp_addr().unwrap().port(), 11935);
        assert_eq!(config.webrtc_addr().unwrap().port(), 18000);
        assert_eq!(config.srt_addr().unwrap().port(), 20080);
        assert_eq!(config.grace_quit_timeout, Duration::from_secs(20));
        assert_eq!(config.force_quit_timeout, Duration::from_secs(30));
        assert!(!config.default_backend_enabled);
        assert!(config.default_backend().is_none());
        assert_eq!(config.log_format, "pretty");
        config.validate().unwrap();
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = ProxyConfig::parse_from([
            "srs-proxy",
            "--rtmp-server",
            "127.0.0.1:1936",
            "--backend-alive",
            "90s",
            "--default-backend-enabled",
            "on",
            "--default-backend-srt",
            "",
        ]);
        assert_eq!(config.rtmp_addr().unwrap(), "127.0.0.1:1936".parse().unwrap());
        assert_eq!(config.registry_config().alive_window, Duration::from_secs(90));

        let backend = config.default_backend().unwrap();
        assert_eq!(backend.ip, "127.0.0.1");
        assert_eq!(backend.rtmp, vec!["1935"]);
        assert_eq!(backend.rtc, vec!["8000"]);
        assert!(backend.srt.is_empty());
        backend.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = ProxyConfig::default().with_srt_server("udp://0.0.0.0:notaport");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = ProxyConfig::default().with_http_api("not-an-ip:8080");
        assert!(config.validate().is_err());

        let config = ProxyConfig::default().with_http_server("abc");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http server"));
    }

    #[test]
    fn test_validate_default_backend() {
        let config = ProxyConfig::default().with_default_backend("", "1935");
        assert!(config.validate().is_err());

        let config = ProxyConfig::default().with_default_backend("10.0.0.1", "");
        assert!(config.validate().is_err());

        let config = ProxyConfig::default().with_default_backend("10.0.0.1", "1935");
        config.validate().unwrap();
    }

    #[test]
    fn test_listen_addr_forms() {
        assert_eq!(listen_addr("1935").unwrap(), "0.0.0.0:1935".parse().unwrap());
        assert_eq!(
            listen_addr("udp://127.0.0.1:8000").unwrap(),
            "127.0.0.1:8000".parse().unwrap()
        );
        assert_eq!(listen_addr("[::1]:9000").unwrap(), "[::1]:9000".parse().unwrap());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_parse_switch() {
        assert!(parse_switch("on").unwrap());
        assert!(parse_switch("ON").unwrap());
        assert!(!parse_switch("off").unwrap());
        assert!(parse_switch("maybe").is_err());
    }
}
