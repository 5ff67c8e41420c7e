use std::fmt;

use serde::Serialize;
use url::Url;

/// A single CORS origin rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginRule {
    /// Literal origin, e.g. `https://panel.example.org`.
    Exact(String),
    /// Any http(s) origin whose host is a subdomain of this suffix,
    /// e.g. `replit.dev` matches `https://abc.replit.dev`.
    WildcardDomain(String),
}

impl OriginRule {
    pub fn exact(origin: impl Into<String>) -> Self {
        Self::Exact(origin.into())
    }

    pub fn wildcard(suffix: &str) -> Self {
        Self::WildcardDomain(suffix.trim_start_matches("*.").trim_start_matches('.').to_string())
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Exact(expected) => expected.eq_ignore_ascii_case(origin.trim_end_matches('/')),
            Self::WildcardDomain(suffix) => {
                let Ok(url) = Url::parse(origin) else {
                    return false;
                };
                if !matches!(url.scheme(), "http" | "https") {
                    return false;
                }
                let Some(host) = url.host_str() else {
                    return false;
                };
                let host = host.to_ascii_lowercase();
                host.len() > suffix.len()
                    && host.ends_with(&suffix.to_ascii_lowercase())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            }
        }
    }
}

impl fmt::Display for OriginRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(origin) => f.write_str(origin),
            Self::WildcardDomain(suffix) => write!(f, "*.{suffix}"),
        }
    }
}

impl Serialize for OriginRule {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorsConfig {
    pub origin: Vec<OriginRule>,
    pub credentials: bool,
}

impl CorsConfig {
    /// Whether any rule admits the given request origin.
    pub fn allows(&self, origin: &str) -> bool {
        self.origin.iter().any(|rule| rule.matches(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_rule_ignores_case_and_trailing_slash() {
        let rule = OriginRule::exact("https://panel.example.org");
        assert!(rule.matches("https://Panel.Example.org/"));
        assert!(!rule.matches("http://panel.example.org"));
    }

    #[test]
    fn wildcard_matches_subdomains_only() {
        let rule = OriginRule::wildcard("*.replit.dev");
        assert_eq!(rule.to_string(), "*.replit.dev");
        assert!(rule.matches("https://abc-123.replit.dev"));
        assert!(rule.matches("http://a.b.replit.dev:8080"));
        assert!(!rule.matches("https://replit.dev"));
        assert!(!rule.matches("https://evilreplit.dev"));
        assert!(!rule.matches("wss://abc.replit.dev"));
        assert!(!rule.matches("not a url"));
    }

    #[test]
    fn config_allows_when_any_rule_matches() {
        let cors = CorsConfig {
            origin: vec![
                OriginRule::exact("http://localhost:5173"),
                OriginRule::wildcard("repl.co"),
            ],
            credentials: true,
        };
        assert!(cors.allows("https://x.repl.co"));
        assert!(cors.allows("http://localhost:5173"));
        assert!(!cors.allows("http://localhost:4000"));
    }
}
