//! Per-worker refresh loop that starts check rounds.
//!
//! Each worker owns upstream `i` of a routing domain when
//! `i % workers == worker`. On every tick the owner decides whether a new
//! round is due, loads persisted options, opens one session per peer and
//! spawns a completion task that runs once the last session has finished.

use crate::health::persist::SnapshotStore;
use crate::health::registry::{Registry, Upstream};
use crate::health::round::RoundTracker;
use crate::health::session::{SessionContext, open_session};
use crate::metrics::MetricsCollector;
use crate::store::{HealthRecordStore, SharedZone};
use crate::upstream::{HttpPeers, PeerRecord, StreamPeers, UpstreamPeers};
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Minimum time between two rounds of one upstream unless its options
/// changed in between.
pub const ROUND_SPACING: Duration = Duration::from_secs(5);

struct Slot<P: UpstreamPeers> {
    upstream: Arc<Upstream<P>>,
    store: Arc<HealthRecordStore>,
    round: Option<Arc<RoundTracker>>,
}

impl<P: UpstreamPeers> Slot<P> {
    fn new(upstream: Arc<Upstream<P>>) -> Self {
        let store = Arc::new(HealthRecordStore::attach(Arc::clone(upstream.zone())));
        Self {
            upstream,
            store,
            round: None,
        }
    }
}

/// Everything a round needs besides its slot.
struct RoundEnv<'a> {
    snapshots: Option<&'a SnapshotStore>,
    metrics: &'a MetricsCollector,
    shutdown: &'a ShutdownSignal,
}

/// Drives the upstreams owned by one worker.
pub struct RefreshScheduler {
    worker: usize,
    workers: usize,
    tick: Duration,
    registry: Arc<ArcSwap<Registry>>,
    metrics: MetricsCollector,
    shutdown: ShutdownSignal,
    current: Option<Arc<Registry>>,
    http: Vec<Slot<HttpPeers>>,
    stream: Vec<Slot<StreamPeers>>,
}

impl RefreshScheduler {
    pub fn new(
        worker: usize,
        workers: usize,
        tick: Duration,
        registry: Arc<ArcSwap<Registry>>,
        metrics: MetricsCollector,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            worker,
            workers: workers.max(1),
            tick,
            registry,
            metrics,
            shutdown,
            current: None,
            http: Vec::new(),
            stream: Vec::new(),
        }
    }

    /// Number of upstreams this worker currently owns.
    pub fn owned(&self) -> usize {
        self.http.len() + self.stream.len()
    }

    /// Tick until shutdown.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();
        if self.shutdown.is_shutdown() {
            return;
        }

        info!(worker = self.worker, tick = ?self.tick, "refresh scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = shutdown.recv() => break,
            }
        }
        info!(worker = self.worker, "refresh scheduler stopped");
    }

    /// One scheduler pass. Must be called inside a tokio runtime.
    pub fn tick(&mut self) {
        self.sync();
        let Some(registry) = self.current.clone() else {
            return;
        };

        let env = RoundEnv {
            snapshots: registry.snapshots(),
            metrics: &self.metrics,
            shutdown: &self.shutdown,
        };
        let now = tokio::time::Instant::now();

        for slot in &mut self.http {
            refresh(slot, &env);
            slot.store.local().reap_idle(now);
        }
        for slot in &mut self.stream {
            refresh(slot, &env);
            slot.store.local().reap_idle(now);
        }
    }

    /// Wait for the completion of every round in flight.
    pub async fn settle(&self) {
        let rounds: Vec<_> = self
            .http
            .iter()
            .filter_map(|slot| slot.round.clone())
            .chain(self.stream.iter().filter_map(|slot| slot.round.clone()))
            .collect();
        join_all(rounds.iter().map(|round| round.wait_finished())).await;
    }

    /// Follow registry swaps, keeping stores of surviving zones.
    fn sync(&mut self) {
        let registry = self.registry.load_full();
        if self
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &registry))
        {
            return;
        }

        let reload = self.current.is_some();
        self.http = sync_slots(
            std::mem::take(&mut self.http),
            registry.http(),
            self.worker,
            self.workers,
        );
        self.stream = sync_slots(
            std::mem::take(&mut self.stream),
            registry.stream(),
            self.worker,
            self.workers,
        );
        debug!(worker = self.worker, owned = self.owned(), reload, "scheduler synced with registry");
        self.current = Some(registry);
    }
}

fn sync_slots<P: UpstreamPeers>(
    mut old: Vec<Slot<P>>,
    upstreams: &[Arc<Upstream<P>>],
    worker: usize,
    workers: usize,
) -> Vec<Slot<P>> {
    upstreams
        .iter()
        .enumerate()
        .filter(|(i, _)| i % workers == worker)
        .map(|(_, upstream)| {
            match old
                .iter()
                .position(|slot| Arc::ptr_eq(slot.upstream.zone(), upstream.zone()))
            {
                Some(pos) => {
                    let mut slot = old.swap_remove(pos);
                    slot.store.reattach();
                    slot.upstream = Arc::clone(upstream);
                    slot
                }
                None => Slot::new(Arc::clone(upstream)),
            }
        })
        .collect()
}

fn refresh<P: UpstreamPeers>(slot: &mut Slot<P>, env: &RoundEnv<'_>) {
    let zone = Arc::clone(slot.upstream.zone());
    let now = Instant::now();

    {
        let mut state = zone.lock();
        if state.options().check_type.is_none() {
            return;
        }
        if slot.round.as_ref().is_some_and(|round| round.in_flight()) {
            state.last_round = Some(now);
            return;
        }
        if !state.dirty && state.last_round.is_some_and(|last| last + ROUND_SPACING > now) {
            return;
        }
    }

    let snapshots = env.snapshots.filter(|_| slot.upstream.persistent());
    if let Some(snapshots) = snapshots {
        load_snapshot(&zone, snapshots);
    }

    let options = {
        let mut state = zone.lock();
        let options = Arc::clone(state.options());
        if options.off || options.interval.is_zero() {
            // Skipped without a round, so nothing is saved.
            state.dirty = false;
            debug!(module = %zone.module(), upstream = %zone.upstream(), "health checks off");
            return;
        }
        state.last_round = Some(now);
        options
    };

    let tracker = RoundTracker::new();
    let ctx = SessionContext {
        peers: Arc::clone(slot.upstream.peers()),
        options,
        shutdown: env.shutdown.clone(),
        metrics: env.metrics.clone(),
    };

    let mut sessions = Vec::new();
    ctx.peers.visit(&mut |_, peer| {
        match open_session(&ctx, &slot.store, peer, Some(tracker.ticket())) {
            Ok(Some(session)) => sessions.push(session),
            Ok(None) => {}
            Err(e) => error!(
                module = %zone.module(),
                upstream = %zone.upstream(),
                server = %peer.server(),
                error = %e,
                "failed to open health check session"
            ),
        }
    });

    let removed = slot.store.gc(now);
    debug!(
        module = %zone.module(),
        upstream = %zone.upstream(),
        sessions = sessions.len(),
        removed,
        "health check round started"
    );

    for session in sessions {
        tokio::spawn(session.run());
    }

    let completion = Arc::clone(&tracker);
    let snapshots = snapshots.cloned();
    let metrics = env.metrics.clone();
    tokio::spawn(async move {
        completion.wait_idle().await;
        complete_round(&zone, snapshots.as_ref(), &metrics);
        completion.mark_finished();
    });
    slot.round = Some(tracker);
}

/// Apply the persisted snapshot if it is newer than the last one applied.
fn load_snapshot(zone: &SharedZone, snapshots: &SnapshotStore) {
    let (module, upstream) = (zone.module(), zone.upstream());
    let loaded = zone.lock().loaded;

    let modified = match snapshots.modified(module, upstream) {
        Ok(Some(modified)) => modified,
        Ok(None) => return,
        Err(e) => {
            warn!(module = %module, upstream = %upstream, error = %e, "failed to stat options snapshot");
            return;
        }
    };
    if loaded.is_some_and(|loaded| modified <= loaded) {
        return;
    }

    let (persisted, modified) = match snapshots.load(module, upstream) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return,
        Err(e) => {
            warn!(module = %module, upstream = %upstream, error = %e, "failed to load options snapshot");
            return;
        }
    };

    let mut state = zone.lock();
    let mut options = (**state.options()).clone();
    persisted.apply(&mut options);
    match state.set_options(options) {
        Ok(()) => {
            state.loaded = Some(modified);
            info!(module = %module, upstream = %upstream, "applied persisted check options");
        }
        Err(e) => error!(module = %module, upstream = %upstream, error = %e, "persisted options do not fit zone"),
    }
}

/// Round completion: save dirty options of persistent upstreams, otherwise
/// just clear the dirty flag.
fn complete_round(zone: &SharedZone, snapshots: Option<&SnapshotStore>, metrics: &MetricsCollector) {
    let pending = {
        let mut state = zone.lock();
        match snapshots {
            Some(_) if state.dirty => Some(Arc::clone(state.options())),
            _ => {
                state.dirty = false;
                None
            }
        }
    };

    if let (Some(options), Some(snapshots)) = (pending, snapshots) {
        match snapshots.save(zone.module(), zone.upstream(), &options) {
            Ok(modified) => {
                let mut state = zone.lock();
                state.loaded = Some(modified);
                // Options changed again while saving stay dirty.
                if Arc::ptr_eq(state.options(), &options) {
                    state.dirty = false;
                }
            }
            Err(e) => error!(
                module = %zone.module(),
                upstream = %zone.upstream(),
                error = %e,
                "failed to save options snapshot"
            ),
        }
    }

    let records = zone.lock().len();
    metrics.record_round(zone.module(), zone.upstream(), records);
    debug!(module = %zone.module(), upstream = %zone.upstream(), records, "health check round completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, UpstreamCheckConfig, UpstreamConfig};
    use crate::store::CheckType;
    use crate::upstream::{Module, PeerIdentity};
    use tokio::net::TcpListener;

    fn config(servers: Vec<String>, check: UpstreamCheckConfig) -> Config {
        Config {
            upstreams: vec![
                UpstreamConfig {
                    name: "api".to_string(),
                    module: Module::Http,
                    servers: servers
                        .into_iter()
                        .map(|server| ServerConfig {
                            server,
                            backup: false,
                        })
                        .collect(),
                    check,
                },
                UpstreamConfig {
                    name: "db".to_string(),
                    module: Module::Stream,
                    servers: vec![ServerConfig {
                        server: "127.0.0.1:9".to_string(),
                        backup: false,
                    }],
                    check: UpstreamCheckConfig::default(),
                },
            ],
            ..Default::default()
        }
    }

    fn tcp_check() -> UpstreamCheckConfig {
        UpstreamCheckConfig {
            check_type: Some(CheckType::Tcp),
            interval: Some(Duration::from_secs(1)),
            timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        }
    }

    fn scheduler(config: &Config, worker: usize, workers: usize) -> RefreshScheduler {
        let registry = Registry::from_config(config, None).unwrap();
        RefreshScheduler::new(
            worker,
            workers,
            Duration::from_millis(50),
            Arc::new(ArcSwap::from_pointee(registry)),
            MetricsCollector::new(),
            ShutdownSignal::new(),
        )
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_round_probes_every_peer() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let config = config(vec![addr.clone()], tcp_check());
        let mut sched = scheduler(&config, 0, 1);
        sched.tick();
        assert_eq!(sched.owned(), 2);
        sched.settle().await;

        let zone = sched.registry.load().zone(Module::Http, "api").unwrap();
        let identity = PeerIdentity::new(Module::Http, "api", addr.clone(), addr);
        let stat = zone.stat(&identity.key()).unwrap();
        assert_eq!(stat.rise_total, 1);
        assert!(zone.lock().last_round.is_some());

        // Unchecked upstreams never get records.
        let db = sched.registry.load().zone(Module::Stream, "db").unwrap();
        assert!(db.lock().is_empty());
    }

    #[tokio::test]
    async fn test_round_spacing_unless_dirty() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let config = config(vec![addr.clone()], tcp_check());
        let mut sched = scheduler(&config, 0, 1);
        let zone = sched.registry.load().zone(Module::Http, "api").unwrap();
        let identity = PeerIdentity::new(Module::Http, "api", addr.clone(), addr);

        sched.tick();
        sched.settle().await;
        let first = zone.lock().last_round;

        sched.tick();
        sched.settle().await;
        assert_eq!(zone.lock().last_round, first);

        zone.lock().dirty = true;
        sched.tick();
        sched.settle().await;
        assert_ne!(zone.lock().last_round, first);
        assert!(!zone.lock().dirty);
        // The peer itself is still inside its interval.
        assert_eq!(zone.stat(&identity.key()).unwrap().rise_total, 1);
    }

    #[tokio::test]
    async fn test_off_skips_round_and_clears_dirty() {
        let mut check = tcp_check();
        check.off = true;
        let config = config(vec!["127.0.0.1:9".to_string()], check);
        let mut sched = scheduler(&config, 0, 1);
        let zone = sched.registry.load().zone(Module::Http, "api").unwrap();
        zone.lock().dirty = true;

        sched.tick();
        sched.settle().await;

        let state = zone.lock();
        assert!(!state.dirty);
        assert!(state.last_round.is_none());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_off_skip_does_not_save_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut check = tcp_check();
        check.interval = Some(Duration::ZERO);
        check.persistent = true;
        let mut config = config(vec!["127.0.0.1:9".to_string()], check);
        config.global.persist_dir = Some(dir.path().to_path_buf());

        let mut sched = scheduler(&config, 0, 1);
        let zone = sched.registry.load().zone(Module::Http, "api").unwrap();
        zone.lock().dirty = true;

        sched.tick();
        sched.settle().await;

        let snapshots = SnapshotStore::new(dir.path());
        assert!(!snapshots.path(Module::Http, "api").exists());
        assert!(!zone.lock().dirty);
        assert!(zone.lock().loaded.is_none());
    }

    #[tokio::test]
    async fn test_ownership_is_sharded() {
        let config = config(vec!["127.0.0.1:9".to_string()], tcp_check());

        let mut first = scheduler(&config, 0, 2);
        first.tick();
        let mut second = scheduler(&config, 1, 2);
        second.tick();

        // One http and one stream upstream, both index 0 in their domain.
        assert_eq!(first.owned(), 2);
        assert_eq!(second.owned(), 0);
    }

    #[tokio::test]
    async fn test_reload_keeps_records() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let config = config(vec![addr.clone()], tcp_check());
        let mut sched = scheduler(&config, 0, 1);
        sched.tick();
        sched.settle().await;

        let previous = sched.registry.load_full();
        let reloaded = Registry::from_config(&config, Some(&*previous)).unwrap();
        sched.registry.store(Arc::new(reloaded));
        sched.tick();

        let zone = sched.registry.load().zone(Module::Http, "api").unwrap();
        let identity = PeerIdentity::new(Module::Http, "api", addr.clone(), addr);
        assert_eq!(zone.stat(&identity.key()).unwrap().rise_total, 1);
        assert_eq!(sched.http[0].store.generation(), 2);
    }
}
