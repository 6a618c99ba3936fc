//! SDP text helpers for WHIP/WHEP answers

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

type Pattern = LazyLock<std::result::Result<Regex, regex::Error>>;

static ICE_UFRAG: Pattern = LazyLock::new(|| Regex::new(r"a=ice-ufrag:([^\s]+)"));
static ICE_PWD: Pattern = LazyLock::new(|| Regex::new(r"a=ice-pwd:([^\s]+)"));

/// ICE credentials of one side of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Extract `ice-ufrag` and `ice-pwd` from an SDP
///
/// Both are required; media routing depends on the ufrag.
pub fn parse_ice_credentials(sdp: &str) -> Result<IceCredentials> {
    Ok(IceCredentials {
        ufrag: attribute(&ICE_UFRAG, sdp, "ice-ufrag")?.to_string(),
        pwd: attribute(&ICE_PWD, sdp, "ice-pwd")?.to_string(),
    })
}

fn attribute<'a>(pattern: &Pattern, sdp: &'a str, name: &str) -> Result<&'a str> {
    let regex = match &**pattern {
        Ok(regex) => regex,
        Err(e) => return Err(Error::Parse(format!("{name} pattern: {e}"))),
    };
    regex
        .captures(sdp)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| Error::ProtocolViolation(format!("SDP has no {name}")))
}

/// Point host candidates at the proxy
///
/// Every ` {port} typ host` for a backend media port becomes
/// ` {public_port} typ host`; nothing else in the SDP changes.
pub fn rewrite_candidates(sdp: &str, backend_ports: &[u16], public_port: u16) -> String {
    let to = format!(" {public_port} typ host");
    backend_ports.iter().fold(sdp.to_string(), |answer, port| {
        answer.replace(&format!(" {port} typ host"), &to)
    })
}

/// ICE username a client presents in STUN binding requests
///
/// STUN usernames are `{callee ufrag}:{caller ufrag}`: the answer's ufrag
/// first, the offer's second.
pub fn ice_username(answer_ufrag: &str, offer_ufrag: &str) -> String {
    format!("{answer_ufrag}:{offer_ufrag}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=SRS/6.0.0 1 2 IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:b4k9x2\r\n\
        a=ice-pwd:q8f3z0m1w7e6r5t4y3u2i1o0\r\n\
        a=candidate:0 1 udp 2130706431 10.0.0.5 8000 typ host generation 0\r\n\
        a=candidate:1 1 udp 2130706431 10.0.0.5 18000 typ host generation 0\r\n";

    #[test]
    fn test_patterns_compile() {
        assert!(ICE_UFRAG.is_ok());
        assert!(ICE_PWD.is_ok());
    }

    #[test]
    fn test_parse_ice_credentials() {
        let creds = parse_ice_credentials(ANSWER).unwrap();
        assert_eq!(creds.ufrag, "b4k9x2");
        assert_eq!(creds.pwd, "q8f3z0m1w7e6r5t4y3u2i1o0");
    }

    #[test]
    fn test_missing_credentials_is_error() {
        let err = parse_ice_credentials("v=0\r\na=ice-ufrag:abc\r\n").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(m) if m.contains("ice-pwd")));
        assert!(parse_ice_credentials("v=0\r\n").is_err());
    }

    #[test]
    fn test_rewrite_only_touches_matching_port() {
        let rewritten = rewrite_candidates(ANSWER, &[8000], 9000);
        assert!(rewritten.contains("10.0.0.5 9000 typ host"));
        // 18000 contains "8000" but not " 8000 typ host".
        assert!(rewritten.contains("10.0.0.5 18000 typ host"));
        assert_eq!(
            rewritten.replace(" 9000 typ host", " 8000 typ host"),
            ANSWER
        );
    }

    #[test]
    fn test_rewrite_multiple_ports() {
        let rewritten = rewrite_candidates(ANSWER, &[8000, 18000], 9000);
        assert_eq!(rewritten.matches(" 9000 typ host").count(), 2);
    }

    #[test]
    fn test_ice_username_order() {
        assert_eq!(ice_username("answer", "offer"), "answer:offer");
    }
}
