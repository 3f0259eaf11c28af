use serde::{Deserialize, Serialize};

/// Lifecycle state of an upstream SOCKS5 proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamState {
    /// Healthy and eligible for selection
    #[default]
    Available,
    /// Failed liveness checks or too many consecutive transport errors
    Unavailable,
    /// In rate-limit backoff after returning 429
    Resting,
}

impl UpstreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamState::Available => "available",
            UpstreamState::Unavailable => "unavailable",
            UpstreamState::Resting => "resting",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, UpstreamState::Available)
    }
}

impl std::fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One SOCKS5 upstream endpoint, identified by `(host, port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Identity key, also the dial address
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str_and_display() {
        assert_eq!(UpstreamState::Available.as_str(), "available");
        assert_eq!(UpstreamState::Unavailable.as_str(), "unavailable");
        assert_eq!(UpstreamState::Resting.to_string(), "resting");
    }

    #[test]
    fn test_state_is_available() {
        assert!(UpstreamState::Available.is_available());
        assert!(!UpstreamState::Unavailable.is_available());
        assert!(!UpstreamState::Resting.is_available());
    }

    #[test]
    fn test_upstream_key() {
        let upstream = Upstream::new("10.0.0.1", 1080);
        assert_eq!(upstream.key(), "10.0.0.1:1080");
        assert_eq!(upstream.to_string(), "10.0.0.1:1080");
    }

    #[test]
    fn test_state_serde_lowercase() {
        let json = serde_json::to_string(&UpstreamState::Resting).unwrap();
        assert_eq!(json, "\"resting\"");
    }
}
