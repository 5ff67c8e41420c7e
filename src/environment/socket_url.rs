use std::fmt;

use url::Url;

use super::{DeploymentProfile, SocketScheme, WebSocketConfig, SOCKET_PATH};

/// Returned when every candidate is rejected.
pub const LAST_RESORT_SOCKET_URL: &str = "ws://localhost:5000/ws";

/// Literals that show up when a URL was built from unset values.
const PLACEHOLDER_LITERALS: [&str; 3] = ["undefined", "null", "NaN"];

/// Alternate ports tried on the same host before falling back to loopback.
const ALTERNATE_PORTS: [u16; 3] = [5000, 3000, 8080];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    PlaceholderLiteral(&'static str),
    Unparseable(String),
    UnsupportedScheme(String),
    MissingHost,
}

impl fmt::Display for UrlRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlaceholderLiteral(lit) => write!(f, "contains placeholder literal {lit:?}"),
            Self::Unparseable(e) => write!(f, "not a URL: {e}"),
            Self::UnsupportedScheme(s) => write!(f, "scheme {s:?} is not ws or wss"),
            Self::MissingHost => f.write_str("missing host"),
        }
    }
}

/// Check that a realtime-channel URL is usable by clients.
pub fn validate_socket_url(candidate: &str) -> Result<(), UrlRejection> {
    if let Some(lit) = PLACEHOLDER_LITERALS
        .into_iter()
        .find(|lit| candidate.contains(lit))
    {
        return Err(UrlRejection::PlaceholderLiteral(lit));
    }

    let url = Url::parse(candidate).map_err(|e| UrlRejection::Unparseable(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(UrlRejection::UnsupportedScheme(url.scheme().to_string()));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() && host != "undefined" && host != "null" => Ok(()),
        _ => Err(UrlRejection::MissingHost),
    }
}

/// Whether a host could appear in a URL the validator accepts.
pub(super) fn host_usable(host: &str) -> bool {
    !host.trim().is_empty() && !PLACEHOLDER_LITERALS.iter().any(|lit| host.contains(lit))
}

fn parse_socket_config(candidate: &str) -> Option<WebSocketConfig> {
    let url = Url::parse(candidate).ok()?;
    let protocol = match url.scheme() {
        "ws" => SocketScheme::Ws,
        "wss" => SocketScheme::Wss,
        _ => return None,
    };
    Some(WebSocketConfig {
        port: url.port_or_known_default()?,
        host: url.host_str()?.to_string(),
        protocol,
    })
}

/// Replace an endpoint the validator rejects with the first valid fallback
/// candidate, so `profile.websocket` is always usable as-is.
pub(super) fn repair_websocket(profile: &mut DeploymentProfile) {
    let primary = profile.websocket.url();
    let Err(reason) = validate_socket_url(&primary) else {
        return;
    };

    let replacement = fallback_socket_urls(profile)
        .iter()
        .filter(|candidate| validate_socket_url(candidate).is_ok())
        .find_map(|candidate| parse_socket_config(candidate))
        .unwrap_or_else(|| WebSocketConfig {
            port: 5000,
            host: "localhost".to_string(),
            protocol: SocketScheme::Ws,
        });
    log::warn!(
        "WebSocket endpoint {primary} rejected ({reason}), using {}",
        replacement.url()
    );
    profile.websocket = replacement;
}

/// Candidate URLs in decreasing specificity: the same host on the scheme's
/// default port, the same host on well-known alternates, then loopback.
pub fn fallback_socket_urls(profile: &DeploymentProfile) -> Vec<String> {
    let ws = &profile.websocket;
    let mut candidates = Vec::new();

    if host_usable(&ws.host) {
        let ports = std::iter::once(ws.protocol.default_port()).chain(ALTERNATE_PORTS);
        for port in ports {
            candidates.push(
                WebSocketConfig {
                    port,
                    host: ws.host.clone(),
                    protocol: ws.protocol,
                }
                .url(),
            );
        }
    }

    for host in ["localhost", "127.0.0.1"] {
        candidates.push(format!(
            "{}://{}:{}{}",
            SocketScheme::Ws.as_str(),
            host,
            profile.default_port,
            SOCKET_PATH
        ));
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
    candidates
}

/// The profile's socket URL if it validates, otherwise the first valid
/// fallback candidate.
pub fn resolve_socket_url(profile: &DeploymentProfile) -> String {
    let primary = profile.websocket.url();
    let reason = match validate_socket_url(&primary) {
        Ok(()) => return primary,
        Err(reason) => reason,
    };

    log::warn!("WebSocket URL {primary} rejected: {reason}");
    for candidate in fallback_socket_urls(profile) {
        if validate_socket_url(&candidate).is_ok() {
            log::warn!("Using fallback WebSocket URL {candidate}");
            return candidate;
        }
    }

    log::warn!("No fallback WebSocket URL validated, using {LAST_RESORT_SOCKET_URL}");
    LAST_RESORT_SOCKET_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::environment::{detect, DetectionInput};

    fn dev_profile() -> DeploymentProfile {
        detect(
            &DetectionInput::from_pairs(Vec::<(String, String)>::new(), "/srv/app"),
            &AppConfig::default(),
        )
    }

    #[test]
    fn rejects_placeholder_literals() {
        for bad in [
            "ws://undefined:5000/ws",
            "ws://localhost:NaN/ws",
            "wss://null/ws",
            "ws://host:5000/undefined",
        ] {
            assert!(
                matches!(
                    validate_socket_url(bad),
                    Err(UrlRejection::PlaceholderLiteral(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(matches!(
            validate_socket_url("http://localhost:5000/ws"),
            Err(UrlRejection::UnsupportedScheme(_))
        ));
        assert!(matches!(
            validate_socket_url("localhost:5000"),
            Err(UrlRejection::UnsupportedScheme(_)) | Err(UrlRejection::Unparseable(_))
        ));
        assert!(validate_socket_url("ws://:5000/ws").is_err());
    }

    #[test]
    fn accepts_well_formed_urls() {
        assert_eq!(validate_socket_url("ws://localhost:5000/ws"), Ok(()));
        assert_eq!(validate_socket_url("wss://panel.example.org/ws"), Ok(()));
        assert_eq!(validate_socket_url("ws://10.0.0.4:3000/socket"), Ok(()));
    }

    #[test]
    fn broken_host_falls_back_to_loopback() {
        let mut profile = dev_profile();
        profile.websocket.host = "undefined".to_string();
        let candidates = fallback_socket_urls(&profile);
        assert_eq!(candidates[0], "ws://localhost:5000/ws");
        assert_eq!(resolve_socket_url(&profile), "ws://localhost:5000/ws");
    }

    #[test]
    fn fallback_tries_same_host_first() {
        let mut profile = dev_profile();
        profile.websocket = WebSocketConfig {
            port: 9999,
            host: "panel.internal".to_string(),
            protocol: SocketScheme::Wss,
        };
        let candidates = fallback_socket_urls(&profile);
        assert_eq!(candidates[0], "wss://panel.internal/ws");
        assert_eq!(candidates[1], "wss://panel.internal:5000/ws");
        assert_eq!(candidates.last().unwrap(), "ws://127.0.0.1:5000/ws");
    }

    #[test]
    fn rejected_endpoint_is_replaced_with_loopback() {
        let mut profile = dev_profile();
        profile.websocket = WebSocketConfig {
            port: 443,
            host: "nullsoft.example".to_string(),
            protocol: SocketScheme::Wss,
        };
        repair_websocket(&mut profile);
        assert_eq!(
            profile.websocket,
            WebSocketConfig {
                port: 5000,
                host: "localhost".to_string(),
                protocol: SocketScheme::Ws,
            }
        );
        assert_eq!(profile.websocket.url(), LAST_RESORT_SOCKET_URL);
    }

    #[test]
    fn usable_endpoint_is_kept_by_repair() {
        let mut profile = dev_profile();
        let before = profile.websocket.clone();
        repair_websocket(&mut profile);
        assert_eq!(profile.websocket, before);
    }

    #[test]
    fn valid_profile_url_is_returned_untouched() {
        let profile = dev_profile();
        assert_eq!(resolve_socket_url(&profile), "ws://localhost:5000/ws");
    }
}
