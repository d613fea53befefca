//! Requests, rate limit keys and key extraction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// An incoming unit of work to be admitted or rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Caller's user identity
    pub user_id: String,
    /// Caller's network address, if known
    #[serde(default)]
    pub remote_addr: Option<IpAddr>,
    /// Caller-assigned request identifier
    pub request_id: u64,
}

impl Request {
    /// Create a request identified only by user.
    pub fn new(user_id: impl Into<String>, request_id: u64) -> Self {
        Self {
            user_id: user_id.into(),
            remote_addr: None,
            request_id,
        }
    }

    /// Attach the caller's network address.
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

/// The identity under which a bucket is tracked.
///
/// Two requests with equal keys share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateLimitKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RateLimitKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Maps a request to its rate limit key.
///
/// Implementations must be total and free of side effects.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, request: &Request) -> RateLimitKey;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Request) -> RateLimitKey + Send + Sync,
{
    fn extract(&self, request: &Request) -> RateLimitKey {
        self(request)
    }
}

/// Built-in key policies selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One bucket per user id
    #[default]
    UserId,
    /// One bucket per remote address
    RemoteAddr,
    /// One bucket per (user id, remote address) pair
    Composite,
}

/// A [`KeyStrategy`] with an optional constant key for requests that lack
/// the selected identity.
#[derive(Debug, Clone, Default)]
pub struct StrategyExtractor {
    strategy: KeyStrategy,
    anonymous_key: Option<String>,
}

impl StrategyExtractor {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            strategy,
            anonymous_key: None,
        }
    }

    /// Use `key` whenever the selected identity is empty or absent.
    pub fn with_anonymous_key(mut self, key: impl Into<String>) -> Self {
        self.anonymous_key = Some(key.into());
        self
    }

    fn or_anonymous(&self, identity: Option<String>) -> RateLimitKey {
        match (identity, &self.anonymous_key) {
            (Some(id), _) if !id.is_empty() => RateLimitKey(id),
            (_, Some(anonymous)) => RateLimitKey(anonymous.clone()),
            (id, None) => RateLimitKey(id.unwrap_or_default()),
        }
    }
}

impl From<KeyStrategy> for StrategyExtractor {
    fn from(strategy: KeyStrategy) -> Self {
        Self::new(strategy)
    }
}

impl KeyExtractor for StrategyExtractor {
    fn extract(&self, request: &Request) -> RateLimitKey {
        match self.strategy {
            KeyStrategy::UserId => self.or_anonymous(Some(request.user_id.clone())),
            KeyStrategy::RemoteAddr => {
                self.or_anonymous(request.remote_addr.map(|addr| addr.to_string()))
            }
            KeyStrategy::Composite => {
                if request.user_id.is_empty() && request.remote_addr.is_none() {
                    return self.or_anonymous(None);
                }
                let addr = request
                    .remote_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_default();
                RateLimitKey(format!("user_id={},remote_addr={}", request.user_id, addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request_from(user: &str, addr: Option<[u8; 4]>) -> Request {
        let request = Request::new(user, 1);
        match addr {
            Some(octets) => request.with_remote_addr(IpAddr::V4(Ipv4Addr::from(octets))),
            None => request,
        }
    }

    #[test]
    fn test_user_id_strategy_is_default() {
        let extractor = StrategyExtractor::default();
        let key = extractor.extract(&request_from("usr_1", Some([10, 0, 0, 1])));
        assert_eq!(key.as_str(), "usr_1");
    }

    #[test]
    fn test_remote_addr_strategy() {
        let extractor = StrategyExtractor::new(KeyStrategy::RemoteAddr);
        let a = extractor.extract(&request_from("usr_1", Some([10, 0, 0, 1])));
        let b = extractor.extract(&request_from("usr_2", Some([10, 0, 0, 1])));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "10.0.0.1");
    }

    #[test]
    fn test_composite_strategy() {
        let extractor = StrategyExtractor::new(KeyStrategy::Composite);
        let key = extractor.extract(&request_from("usr_1", Some([192, 168, 1, 1])));
        assert_eq!(key.as_str(), "user_id=usr_1,remote_addr=192.168.1.1");

        let other = extractor.extract(&request_from("usr_1", Some([192, 168, 1, 2])));
        assert_ne!(key, other);
    }

    #[test]
    fn test_missing_identity_without_fallback() {
        let extractor = StrategyExtractor::new(KeyStrategy::RemoteAddr);
        let key = extractor.extract(&request_from("usr_1", None));
        assert_eq!(key.as_str(), "");
    }

    #[test]
    fn test_missing_identity_with_anonymous_key() {
        let extractor =
            StrategyExtractor::new(KeyStrategy::RemoteAddr).with_anonymous_key("anonymous");
        assert_eq!(extractor.extract(&request_from("usr_1", None)).as_str(), "anonymous");

        let by_user = StrategyExtractor::new(KeyStrategy::UserId).with_anonymous_key("anonymous");
        assert_eq!(by_user.extract(&request_from("", None)).as_str(), "anonymous");
        assert_eq!(by_user.extract(&request_from("usr_2", None)).as_str(), "usr_2");
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |request: &Request| RateLimitKey::new(format!("tenant:{}", request.user_id));
        let key = extractor.extract(&request_from("acme", None));
        assert_eq!(key.to_string(), "tenant:acme");
    }
}
