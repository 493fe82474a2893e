//! Client identifier resolution.
//!
//! The identifier partitions every counter, so it is always a string: a request with neither a
//! forwarded header nor a known peer resolves to the empty string and shares one bucket with all
//! such requests.

use http::Request;
use std::fmt;
use std::net::SocketAddr;

/// Header carrying the original client address behind a proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Resolved client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap an identifier as is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the degenerate blank identifier.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Resolve from a request's `X-Forwarded-For` header and the peer address stashed in its
    /// extensions by the server (as `SocketAddr`).
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let forwarded = req.headers().get(FORWARDED_FOR).and_then(|v| v.to_str().ok());
        let peer = req.extensions().get::<SocketAddr>().copied();
        Self(resolve_client_id(forwarded, peer))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

/// Pick the client identifier: the first entry of the forwarded header when it is non-blank,
/// otherwise the peer IP, otherwise the empty string.
pub fn resolve_client_id(forwarded: Option<&str>, peer: Option<SocketAddr>) -> String {
    let first = forwarded.and_then(|raw| raw.split(',').next()).map(str::trim).unwrap_or("");
    if !first.is_empty() {
        return first.to_string();
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}
