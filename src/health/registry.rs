//! Upstream groups built from configuration.
//!
//! A [`Registry`] is immutable once built and swapped as a whole on
//! reload. Groups that survive a reload keep their zone and peer list, so
//! health records and routing flags carry over.

use crate::config::{Config, UpstreamConfig};
use crate::health::persist::SnapshotStore;
use crate::store::{SharedZone, StoreError};
use crate::upstream::{
    HttpPeers, Module, Peer, PeerList, RoutingDomain, StreamPeers, UpstreamPeers,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Peer list seen through its capability interface.
pub type DynPeers = dyn UpstreamPeers<Peer = Peer>;

/// One checked upstream group.
#[derive(Debug)]
pub struct Upstream<P: UpstreamPeers> {
    peers: Arc<P>,
    zone: Arc<SharedZone>,
    persistent: bool,
}

impl<P: UpstreamPeers> Upstream<P> {
    pub fn new(peers: Arc<P>, zone: Arc<SharedZone>, persistent: bool) -> Self {
        Self {
            peers,
            zone,
            persistent,
        }
    }

    pub fn peers(&self) -> &Arc<P> {
        &self.peers
    }

    pub fn zone(&self) -> &Arc<SharedZone> {
        &self.zone
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn name(&self) -> &str {
        self.zone.upstream()
    }
}

/// Zone and peers of one group, independent of its routing domain.
#[derive(Clone)]
pub struct UpstreamEntry {
    pub zone: Arc<SharedZone>,
    pub peers: Arc<DynPeers>,
}

/// All checked upstream groups of both routing domains.
#[derive(Debug, Default)]
pub struct Registry {
    http: Vec<Arc<Upstream<HttpPeers>>>,
    stream: Vec<Arc<Upstream<StreamPeers>>>,
    snapshots: Option<SnapshotStore>,
}

impl Registry {
    /// Build groups from `config`, reusing the zones and peer lists of
    /// `previous` for groups with the same module and name.
    pub fn from_config(config: &Config, previous: Option<&Registry>) -> Result<Self, StoreError> {
        let http = build_domain(config, previous.map(|r| r.http.as_slice()).unwrap_or_default())?;
        let stream =
            build_domain(config, previous.map(|r| r.stream.as_slice()).unwrap_or_default())?;

        info!(
            http = http.len(),
            stream = stream.len(),
            reused = previous.is_some(),
            "upstream registry built"
        );

        Ok(Self {
            http,
            stream,
            snapshots: config.global.persist_dir.clone().map(SnapshotStore::new),
        })
    }

    pub fn http(&self) -> &[Arc<Upstream<HttpPeers>>] {
        &self.http
    }

    pub fn stream(&self) -> &[Arc<Upstream<StreamPeers>>] {
        &self.stream
    }

    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    pub fn len(&self) -> usize {
        self.http.len() + self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every group of `module`, in configuration order.
    pub fn entries(&self, module: Module) -> Vec<UpstreamEntry> {
        fn erase<P>(list: &[Arc<Upstream<P>>]) -> Vec<UpstreamEntry>
        where
            P: UpstreamPeers<Peer = Peer>,
        {
            list.iter()
                .map(|up| UpstreamEntry {
                    zone: Arc::clone(&up.zone),
                    peers: Arc::clone(&up.peers) as Arc<DynPeers>,
                })
                .collect()
        }

        match module {
            Module::Http => erase(&self.http),
            Module::Stream => erase(&self.stream),
        }
    }

    pub fn find(&self, module: Module, name: &str) -> Option<UpstreamEntry> {
        self.entries(module)
            .into_iter()
            .find(|entry| entry.zone.upstream() == name)
    }

    pub fn zone(&self, module: Module, name: &str) -> Option<Arc<SharedZone>> {
        match module {
            Module::Http => find_zone(&self.http, name),
            Module::Stream => find_zone(&self.stream, name),
        }
    }
}

fn find_zone<P: UpstreamPeers>(list: &[Arc<Upstream<P>>], name: &str) -> Option<Arc<SharedZone>> {
    list.iter()
        .find(|up| up.name() == name)
        .map(|up| Arc::clone(&up.zone))
}

fn build_domain<D: RoutingDomain>(
    config: &Config,
    previous: &[Arc<Upstream<PeerList<D>>>],
) -> Result<Vec<Arc<Upstream<PeerList<D>>>>, StoreError> {
    config
        .upstreams
        .iter()
        .filter(|up| up.module == D::MODULE)
        .map(|up| build_upstream(config, up, previous).map(Arc::new))
        .collect()
}

fn build_upstream<D: RoutingDomain>(
    config: &Config,
    upstream: &UpstreamConfig,
    previous: &[Arc<Upstream<PeerList<D>>>],
) -> Result<Upstream<PeerList<D>>, StoreError> {
    let options = upstream.check_options(&config.healthcheck);
    let (primary, backup) = resolve_servers(upstream);

    if let Some(prev) = previous.iter().find(|p| p.name() == upstream.name) {
        {
            let mut state = prev.zone.lock();
            state.set_options(options)?;
            // A reload resets options to the file; the next round reapplies
            // any persisted snapshot.
            state.loaded = None;
        }
        prev.peers.replace(primary, backup);
        debug!(module = %D::MODULE, upstream = %upstream.name, "reused upstream zone");
        return Ok(Upstream::new(
            Arc::clone(&prev.peers),
            Arc::clone(&prev.zone),
            upstream.check.persistent,
        ));
    }

    let zone = SharedZone::new(D::MODULE, &upstream.name, options, config.global.zone_size)?;
    Ok(Upstream::new(
        Arc::new(PeerList::new(&upstream.name, primary, backup)),
        Arc::new(zone),
        upstream.check.persistent,
    ))
}

fn resolve_servers(upstream: &UpstreamConfig) -> (Vec<Peer>, Vec<Peer>) {
    let mut primary = Vec::new();
    let mut backup = Vec::new();
    for server in &upstream.servers {
        let peers = Peer::resolve(&server.server);
        if server.backup {
            backup.extend(peers);
        } else {
            primary.extend(peers);
        }
    }
    (primary, backup)
}
