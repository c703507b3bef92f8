//! Peer lists shared between routing and health checking.

use crate::upstream::Module;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Which list of an upstream group a peer sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Backup,
}

/// A peer as seen by the health checker.
pub trait PeerRecord: Send + Sync {
    /// Address as configured.
    fn server(&self) -> &str;

    /// Resolved address text.
    fn name(&self) -> &str;

    /// Resolved socket address, `None` for unresolved servers.
    fn sockaddr(&self) -> Option<SocketAddr>;

    fn is_down(&self) -> bool;

    /// Set the routing down flag, returning true if it changed.
    fn set_down(&self, down: bool) -> bool;
}

/// An upstream group whose peers can be visited and flagged.
pub trait UpstreamPeers: Send + Sync + 'static {
    type Peer: PeerRecord;

    fn module(&self) -> Module;

    fn name(&self) -> &str;

    /// Visit primary peers, then backup peers, under the group's read lock.
    fn visit(&self, f: &mut dyn FnMut(Tier, &Self::Peer));

    /// Flag every peer matching `server` and `name`.
    ///
    /// Returns `None` when no peer matched, otherwise whether any flag changed.
    fn set_down(&self, server: &str, name: &str, down: bool) -> Option<bool> {
        let mut result = None;
        self.visit(&mut |_, peer| {
            if peer.server() == server && peer.name() == name {
                let changed = peer.set_down(down);
                result = Some(result.unwrap_or(false) || changed);
            }
        });
        result
    }

    /// Flag every peer whose name or server starts with `host`.
    fn set_down_matching(&self, host: &str, down: bool) -> usize {
        let mut changed = 0;
        self.visit(&mut |_, peer| {
            if (peer.name().starts_with(host) || peer.server().starts_with(host))
                && peer.set_down(down)
            {
                changed += 1;
            }
        });
        changed
    }
}

/// Marker trait for a routing domain.
pub trait RoutingDomain: Send + Sync + 'static {
    const MODULE: Module;
}

/// HTTP routing domain.
#[derive(Debug)]
pub struct Http;

/// Stream (L4) routing domain.
#[derive(Debug)]
pub struct Stream;

impl RoutingDomain for Http {
    const MODULE: Module = Module::Http;
}

impl RoutingDomain for Stream {
    const MODULE: Module = Module::Stream;
}

/// A single peer entry with its own lock on the down flag.
#[derive(Debug)]
pub struct Peer {
    server: String,
    name: String,
    sockaddr: Option<SocketAddr>,
    down: RwLock<bool>,
}

impl Peer {
    pub fn new(server: impl Into<String>, name: impl Into<String>, sockaddr: Option<SocketAddr>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            sockaddr,
            down: RwLock::new(false),
        }
    }

    /// A peer for an already resolved address.
    pub fn from_addr(server: impl Into<String>, addr: SocketAddr) -> Self {
        Self::new(server, addr.to_string(), Some(addr))
    }

    /// Resolve a configured server into one peer per address.
    ///
    /// A server that does not resolve yields a single placeholder peer
    /// named `0.0.0.0:<port>`, which the checker always reports down.
    pub fn resolve(server: &str) -> Vec<Peer> {
        if let Ok(addr) = server.parse::<SocketAddr>() {
            return vec![Peer::from_addr(server, addr)];
        }

        match server.to_socket_addrs() {
            Ok(addrs) => {
                let mut seen = HashSet::new();
                let peers: Vec<Peer> = addrs
                    .filter(|addr| seen.insert(*addr))
                    .map(|addr| Peer::from_addr(server, addr))
                    .collect();
                if !peers.is_empty() {
                    debug!(server = %server, addresses = peers.len(), "resolved server");
                    return peers;
                }
                warn!(server = %server, "server resolved to no addresses");
            }
            Err(e) => {
                warn!(server = %server, error = %e, "failed to resolve server");
            }
        }

        let port = server
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .unwrap_or(0);
        vec![Peer::new(server, format!("0.0.0.0:{port}"), None)]
    }
}

impl PeerRecord for Peer {
    fn server(&self) -> &str {
        &self.server
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sockaddr(&self) -> Option<SocketAddr> {
        self.sockaddr
    }

    fn is_down(&self) -> bool {
        *self.down.read()
    }

    fn set_down(&self, down: bool) -> bool {
        let mut flag = self.down.write();
        let changed = *flag != down;
        *flag = down;
        changed
    }
}

#[derive(Debug, Default)]
struct Tiers {
    primary: Vec<Peer>,
    backup: Vec<Peer>,
}

/// Primary and backup peers of one upstream group in a routing domain.
#[derive(Debug)]
pub struct PeerList<D: RoutingDomain> {
    name: String,
    tiers: RwLock<Tiers>,
    _domain: PhantomData<fn() -> D>,
}

/// Peer list of an HTTP upstream group.
pub type HttpPeers = PeerList<Http>;

/// Peer list of a stream upstream group.
pub type StreamPeers = PeerList<Stream>;

impl<D: RoutingDomain> PeerList<D> {
    pub fn new(name: impl Into<String>, primary: Vec<Peer>, backup: Vec<Peer>) -> Self {
        Self {
            name: name.into(),
            tiers: RwLock::new(Tiers { primary, backup }),
            _domain: PhantomData,
        }
    }

    /// Swap in a new set of peers, carrying over the down flag of peers
    /// that are still present.
    pub fn replace(&self, primary: Vec<Peer>, backup: Vec<Peer>) {
        let mut tiers = self.tiers.write();
        let carry = |old: &[Peer], new: &[Peer]| {
            for peer in new {
                if let Some(prev) = old
                    .iter()
                    .find(|p| p.server == peer.server && p.name == peer.name)
                {
                    peer.set_down(prev.is_down());
                }
            }
        };
        carry(&tiers.primary, &primary);
        carry(&tiers.backup, &backup);
        *tiers = Tiers { primary, backup };
    }

    pub fn len(&self) -> usize {
        let tiers = self.tiers.read();
        tiers.primary.len() + tiers.backup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: RoutingDomain> UpstreamPeers for PeerList<D> {
    type Peer = Peer;

    fn module(&self) -> Module {
        D::MODULE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn visit(&self, f: &mut dyn FnMut(Tier, &Peer)) {
        let tiers = self.tiers.read();
        for peer in &tiers.primary {
            f(Tier::Primary, peer);
        }
        for peer in &tiers.backup {
            f(Tier::Backup, peer);
        }
    }
}
