//! Upstream groups and the peers the health checker probes.
//!
//! The checker never owns routing state. It reaches peers through the
//! [`UpstreamPeers`] trait, which both routing domains implement.

mod peers;

pub use peers::{
    Http, HttpPeers, Peer, PeerList, PeerRecord, RoutingDomain, Stream, StreamPeers, Tier,
    UpstreamPeers,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing domain an upstream group belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    #[default]
    Http,
    Stream,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Http => "http",
            Module::Stream => "stream",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one probed peer inside one upstream group.
///
/// `server` is the address as configured, `name` the resolved address
/// text. Several peers may share a `server` when it resolves to more
/// than one address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub module: Module,
    pub upstream: String,
    pub server: String,
    pub name: String,
}

impl PeerIdentity {
    pub fn new(
        module: Module,
        upstream: impl Into<String>,
        server: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            module,
            upstream: upstream.into(),
            server: server.into(),
            name: name.into(),
        }
    }

    /// Key under which the peer's records are stored, `name/server`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.server)
    }

    /// True for the placeholder address of a server that failed to resolve.
    pub fn is_unresolved(&self) -> bool {
        self.name.starts_with("0.0.0.0")
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} addr={}",
            self.module, self.upstream, self.server, self.name
        )
    }
}
