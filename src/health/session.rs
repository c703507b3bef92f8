//! One probe cycle against one peer.
//!
//! A [`CheckSession`] owns the peer's local state for its lifetime and
//! walks the connection through [`CheckState`]: connect, send, receive.
//! Every error ends in a single `fail()`; nothing propagates to the
//! scheduler beyond the returned [`SessionOutcome`].

use crate::health::round::SessionTicket;
use crate::metrics::{HealthCheckResult, MetricsCollector};
use crate::probe::{
    Phase, ProbeContext, ProbeError, ProbeTransport, Progress, ProtocolHandler, TransportError,
};
use crate::store::{
    CheckOptions, HealthRecordStore, LocalConnectionState, RecordHandle, StoreError,
};
use crate::upstream::{PeerIdentity, PeerRecord, UpstreamPeers};
use crate::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a session stands in its probe cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    None,
    Connecting,
    Connected,
    Sending,
    Sent,
    Receiving,
    Done,
    Aborted,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Healthy,
    Unhealthy,
    /// Marked down without probing (disabled or unresolved).
    ForcedDown,
    /// Not probed this round.
    Skipped,
    Aborted,
}

/// Shared inputs of every session in a round.
pub struct SessionContext<P: UpstreamPeers> {
    pub peers: Arc<P>,
    pub options: Arc<CheckOptions>,
    pub shutdown: ShutdownSignal,
    pub metrics: MetricsCollector,
}

impl<P: UpstreamPeers> Clone for SessionContext<P> {
    fn clone(&self) -> Self {
        Self {
            peers: Arc::clone(&self.peers),
            options: Arc::clone(&self.options),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Address a peer is probed at, after the port override.
pub fn probe_address(peer: &impl PeerRecord, port: Option<u16>) -> Option<SocketAddr> {
    peer.sockaddr().map(|mut addr| {
        if let Some(port) = port {
            addr.set_port(port);
        }
        addr
    })
}

/// Prepare a session for `peer`.
///
/// Returns `Ok(None)` for excluded peers, which keep their record alive
/// but see no I/O, and for peers whose local state is already in use.
pub fn open_session<P: UpstreamPeers>(
    ctx: &SessionContext<P>,
    store: &HealthRecordStore,
    peer: &P::Peer,
    ticket: Option<SessionTicket>,
) -> Result<Option<CheckSession<P>>, StoreError> {
    let identity = PeerIdentity::new(
        ctx.peers.module(),
        ctx.peers.name(),
        peer.server(),
        peer.name(),
    );

    if ctx.options.is_host_excluded(peer.name()) || ctx.options.is_host_excluded(peer.server()) {
        debug!(peer = %identity, "peer excluded from health checks");
        // A disabled host stays down even outside the checker's authority.
        if ctx.options.is_host_disabled(peer.name()) || ctx.options.is_host_disabled(peer.server()) {
            peer.set_down(true);
        }
        store.touch(&identity);
        return Ok(None);
    }

    let sockaddr = probe_address(peer, ctx.options.port);
    let (record, slot) = store.get(&identity, sockaddr, ctx.options.buffer_size)?;
    let down = peer.is_down();
    record.update(|rec| rec.down = down);

    match slot.try_lock_owned() {
        Ok(local) => Ok(Some(CheckSession::new(
            ctx.clone(),
            identity,
            record,
            local,
            ticket,
        ))),
        Err(_) => {
            debug!(peer = %identity, "previous session still running");
            Ok(None)
        }
    }
}

pub struct CheckSession<P: UpstreamPeers> {
    ctx: SessionContext<P>,
    identity: PeerIdentity,
    record: RecordHandle,
    local: OwnedMutexGuard<LocalConnectionState>,
    state: CheckState,
    deadline: Instant,
    _ticket: Option<SessionTicket>,
}

impl<P: UpstreamPeers> CheckSession<P> {
    pub fn new(
        ctx: SessionContext<P>,
        identity: PeerIdentity,
        record: RecordHandle,
        mut local: OwnedMutexGuard<LocalConnectionState>,
        ticket: Option<SessionTicket>,
    ) -> Self {
        // Leaving idle: the keep-alive timer stops and the buffer starts empty.
        local.expiry = None;
        local.buffer.clear();
        Self {
            ctx,
            identity,
            record,
            local,
            state: CheckState::None,
            deadline: Instant::now(),
            _ticket: ticket,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    /// Run the cycle to completion.
    pub async fn run(mut self) -> SessionOutcome {
        let outcome = match self.preflight() {
            Some(outcome) => outcome,
            None => self.probe().await,
        };
        self.finish(outcome)
    }

    fn preflight(&mut self) -> Option<SessionOutcome> {
        if self.ctx.shutdown.is_shutdown() {
            self.local.close();
            return Some(SessionOutcome::Aborted);
        }

        if self.identity.is_unresolved() {
            self.force_down(true);
            return Some(SessionOutcome::ForcedDown);
        }

        let options = Arc::clone(&self.ctx.options);
        let (name, server) = (&self.identity.name, &self.identity.server);
        if options.disabled || options.is_host_disabled(name) || options.is_host_disabled(server) {
            self.local.close();
            self.force_down(false);
            return Some(SessionOutcome::ForcedDown);
        }

        let now = std::time::Instant::now();
        let recent = self
            .record
            .update(|rec| rec.checked.is_some_and(|at| at + options.interval > now));
        match recent {
            Some(false) => None,
            Some(true) => {
                debug!(peer = %self.identity, "checked recently, skipping probe");
                Some(SessionOutcome::Skipped)
            }
            None => Some(SessionOutcome::Skipped),
        }
    }

    async fn probe(&mut self) -> SessionOutcome {
        let Some(check_type) = self.ctx.options.check_type else {
            return SessionOutcome::Skipped;
        };
        let mut handler = match ProtocolHandler::new(check_type, &self.ctx.options) {
            Ok(handler) => handler,
            Err(e) => return self.fail(e),
        };

        let mut shutdown = self.ctx.shutdown.subscribe();
        if self.ctx.shutdown.is_shutdown() {
            return self.abort();
        }

        let result = tokio::select! {
            result = self.drive(&mut handler) => Some(result),
            _ = shutdown.recv() => None,
        };

        match result {
            Some(Ok(())) => self.success(),
            Some(Err(e)) => self.fail(e),
            None => self.abort(),
        }
    }

    async fn drive(&mut self, handler: &mut ProtocolHandler) -> Result<(), ProbeError> {
        while !matches!(self.state, CheckState::Done | CheckState::Aborted) {
            self.step(handler).await?;
        }
        Ok(())
    }

    async fn step(&mut self, handler: &mut ProtocolHandler) -> Result<(), ProbeError> {
        match self.state {
            CheckState::None => {
                self.begin();
                Ok(())
            }
            CheckState::Connecting => self.connect().await,
            CheckState::Connected => {
                self.enter(CheckState::Sending);
                Ok(())
            }
            CheckState::Sending => self.send(handler).await,
            CheckState::Sent => {
                self.local.buffer.clear();
                self.enter(CheckState::Receiving);
                Ok(())
            }
            CheckState::Receiving => self.receive(handler).await,
            CheckState::Done | CheckState::Aborted => Ok(()),
        }
    }

    /// Move to `state` with a fresh phase deadline.
    fn enter(&mut self, state: CheckState) {
        self.deadline = Instant::now() + self.ctx.options.timeout;
        self.state = state;
    }

    fn begin(&mut self) {
        let reusable = self
            .local
            .connection
            .as_ref()
            .is_some_and(ProbeTransport::is_reusable);
        if reusable {
            debug!(peer = %self.identity, "reusing keep-alive connection");
            self.state = CheckState::Connected;
        } else {
            self.local.close();
            self.enter(CheckState::Connecting);
        }
    }

    async fn connect(&mut self) -> Result<(), ProbeError> {
        let addr = self.local.sockaddr.ok_or(ProbeError::Unresolved)?;
        let transport = ProbeTransport::connect(addr, self.deadline).await?;
        debug!(peer = %self.identity, local = ?transport.local_addr(), "connected");
        self.local.connection = Some(transport);
        self.state = CheckState::Connected;
        Ok(())
    }

    async fn send(&mut self, handler: &mut ProtocolHandler) -> Result<(), ProbeError> {
        loop {
            match self.with_probe(|ctx| handler.on_send(ctx))? {
                Progress::Again => self.wait(Interest::WRITABLE, Phase::Send).await?,
                Progress::Ok | Progress::Declined => {
                    self.state = CheckState::Sent;
                    return Ok(());
                }
            }
        }
    }

    async fn receive(&mut self, handler: &mut ProtocolHandler) -> Result<(), ProbeError> {
        loop {
            match self.with_probe(|ctx| handler.on_recv(ctx))? {
                Progress::Again => self.wait(Interest::READABLE, Phase::Receive).await?,
                Progress::Ok | Progress::Declined => {
                    self.state = CheckState::Done;
                    return Ok(());
                }
            }
        }
    }

    fn with_probe<R>(
        &mut self,
        f: impl FnOnce(&mut ProbeContext<'_>) -> Result<R, ProbeError>,
    ) -> Result<R, ProbeError> {
        let local = &mut *self.local;
        let transport = local.connection.as_mut().ok_or(TransportError::Closed)?;
        let sockaddr = transport.peer_addr();
        let mut ctx = ProbeContext {
            transport,
            buffer: &mut local.buffer,
            buffer_size: local.buffer_size,
            options: &self.ctx.options,
            identity: &self.identity,
            sockaddr,
        };
        f(&mut ctx)
    }

    async fn wait(&self, interest: Interest, phase: Phase) -> Result<(), ProbeError> {
        let transport = self
            .local
            .connection
            .as_ref()
            .ok_or(TransportError::Closed)?;
        transport.ready(interest, self.deadline, phase).await?;
        Ok(())
    }

    fn fail(&mut self, err: ProbeError) -> SessionOutcome {
        let state = self.state;
        self.local.close();

        let threshold = self.ctx.options.fall;
        let counters = self.record.update(|rec| {
            rec.fall_total += 1;
            rec.fall += 1;
            let crossed = rec.fall >= threshold;
            if crossed {
                rec.rise = 0;
                rec.down = true;
            }
            (rec.fall, crossed)
        });

        warn!(
            peer = %self.identity,
            state = ?state,
            error = %err,
            fall = counters.map(|(fall, _)| fall),
            "health check failed"
        );
        self.ctx
            .metrics
            .record_probe(&self.identity, HealthCheckResult::Failure);

        if counters.is_some_and(|(_, crossed)| crossed) {
            self.mark_host(true, true);
        }
        SessionOutcome::Unhealthy
    }

    fn success(&mut self) -> SessionOutcome {
        let errored = self
            .local
            .connection
            .as_ref()
            .is_some_and(ProbeTransport::has_error);
        if errored {
            return self.fail(ProbeError::protocol("connection error flagged during probe"));
        }

        if let Some(conn) = self.local.connection.as_mut() {
            conn.record_request();
        }
        self.set_keepalive();

        let threshold = self.ctx.options.rise;
        let counters = self.record.update(|rec| {
            rec.rise_total += 1;
            rec.rise += 1;
            let crossed = rec.rise >= threshold || rec.fall_total == 0;
            if crossed {
                rec.fall = 0;
                rec.down = false;
            }
            (rec.rise, crossed)
        });

        debug!(
            peer = %self.identity,
            rise = counters.map(|(rise, _)| rise),
            "health check passed"
        );
        self.ctx
            .metrics
            .record_probe(&self.identity, HealthCheckResult::Success);

        if counters.is_some_and(|(_, crossed)| crossed) {
            self.mark_host(false, true);
        }
        SessionOutcome::Healthy
    }

    fn abort(&mut self) -> SessionOutcome {
        self.local.close();
        self.state = CheckState::Aborted;
        debug!(peer = %self.identity, "health check aborted");
        SessionOutcome::Aborted
    }

    fn set_keepalive(&mut self) {
        let Some(conn) = self.local.connection.as_ref() else {
            return;
        };
        let keep = !conn.saw_eof()
            && !conn.has_error()
            && conn.requests() < self.ctx.options.keepalive
            && !self.ctx.shutdown.is_shutdown();

        if keep {
            self.local.expiry = Some(Instant::now() + self.ctx.options.interval * 4);
        } else {
            self.local.close();
        }
    }

    fn force_down(&mut self, log: bool) {
        self.record.update(|rec| rec.down = true);
        self.mark_host(true, log);
    }

    /// Flip the routing flag of the peer, logging real transitions.
    fn mark_host(&self, down: bool, log: bool) {
        let changed = self
            .ctx
            .peers
            .set_down(&self.identity.server, &self.identity.name, down)
            .unwrap_or(false);
        if changed && log {
            if down {
                warn!(peer = %self.identity, "peer is down");
            } else {
                info!(peer = %self.identity, "peer is up");
            }
        }
        self.ctx.metrics.set_peer_down(&self.identity, down);
    }

    fn finish(&mut self, outcome: SessionOutcome) -> SessionOutcome {
        // Only cycles that reached the peer count as a check.
        if matches!(outcome, SessionOutcome::Healthy | SessionOutcome::Unhealthy) {
            let interval = self.ctx.options.interval;
            let now = std::time::Instant::now();
            self.record.update(|rec| {
                if rec.checked.is_none_or(|at| at + interval <= now) {
                    rec.checked = Some(now);
                }
            });
        }
        if outcome != SessionOutcome::Aborted {
            self.state = CheckState::Done;
        }
        debug!(peer = %self.identity, outcome = ?outcome, "health check completed");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CheckType, DEFAULT_ZONE_SIZE, SharedZone};
    use crate::upstream::{HttpPeers, Module, Peer};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Fixture {
        ctx: SessionContext<HttpPeers>,
        store: HealthRecordStore,
    }

    fn fixture(addr: SocketAddr, options: CheckOptions) -> Fixture {
        let peers = Arc::new(HttpPeers::new(
            "api",
            vec![Peer::from_addr(addr.to_string(), addr)],
            vec![],
        ));
        let zone = SharedZone::new(Module::Http, "api", options.clone(), DEFAULT_ZONE_SIZE).unwrap();
        Fixture {
            ctx: SessionContext {
                peers,
                options: Arc::new(options),
                shutdown: ShutdownSignal::new(),
                metrics: MetricsCollector::new(),
            },
            store: HealthRecordStore::attach(Arc::new(zone)),
        }
    }

    fn tcp_options() -> CheckOptions {
        CheckOptions {
            check_type: Some(CheckType::Tcp),
            interval: Duration::ZERO,
            timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn run_once(fx: &Fixture) -> SessionOutcome {
        let mut outcome = SessionOutcome::Skipped;
        let mut sessions = Vec::new();
        fx.ctx.peers.visit(&mut |_, peer| {
            if let Some(session) = open_session(&fx.ctx, &fx.store, peer, None).unwrap() {
                sessions.push(session);
            }
        });
        for session in sessions {
            outcome = session.run().await;
        }
        outcome
    }

    fn identity(addr: SocketAddr) -> PeerIdentity {
        PeerIdentity::new(Module::Http, "api", addr.to_string(), addr.to_string())
    }

    fn host_down(fx: &Fixture) -> bool {
        let mut down = false;
        fx.ctx.peers.visit(&mut |_, peer| down = peer.is_down());
        down
    }

    #[tokio::test]
    async fn test_tcp_connect_only_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let fx = fixture(addr, tcp_options());
        assert_eq!(run_once(&fx).await, SessionOutcome::Healthy);

        let stat = fx.store.stat(&identity(addr)).unwrap();
        assert_eq!(stat.rise_total, 1);
        assert!(!stat.down);
        assert!(stat.checked.is_some());
    }

    #[tokio::test]
    async fn test_refused_connection_marks_down() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let fx = fixture(addr, tcp_options());
        assert_eq!(run_once(&fx).await, SessionOutcome::Unhealthy);

        let stat = fx.store.stat(&identity(addr)).unwrap();
        assert_eq!(stat.fall, 1);
        assert_eq!(stat.fall_total, 1);
        assert!(stat.down);
        assert!(host_down(&fx));
    }

    #[tokio::test]
    async fn test_disabled_upstream_forces_down_without_io() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut options = tcp_options();
        options.disabled = true;

        let fx = fixture(addr, options);
        assert_eq!(run_once(&fx).await, SessionOutcome::ForcedDown);

        let stat = fx.store.stat(&identity(addr)).unwrap();
        assert_eq!(stat.fall_total, 0);
        assert!(stat.down);
        assert!(host_down(&fx));
    }

    #[tokio::test]
    async fn test_unresolved_peer_is_forced_down() {
        let peers = Arc::new(HttpPeers::new(
            "api",
            Peer::resolve("no-such-host.invalid:80"),
            vec![],
        ));
        let zone = SharedZone::new(Module::Http, "api", tcp_options(), DEFAULT_ZONE_SIZE).unwrap();
        let fx = Fixture {
            ctx: SessionContext {
                peers,
                options: Arc::new(tcp_options()),
                shutdown: ShutdownSignal::new(),
                metrics: MetricsCollector::new(),
            },
            store: HealthRecordStore::attach(Arc::new(zone)),
        };

        assert_eq!(run_once(&fx).await, SessionOutcome::ForcedDown);
        assert!(host_down(&fx));
    }

    #[tokio::test]
    async fn test_interval_suppresses_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut options = tcp_options();
        options.interval = Duration::from_secs(60);
        let fx = fixture(addr, options);

        assert_eq!(run_once(&fx).await, SessionOutcome::Healthy);
        assert_eq!(run_once(&fx).await, SessionOutcome::Skipped);
        assert_eq!(fx.store.stat(&identity(addr)).unwrap().rise_total, 1);
    }

    #[tokio::test]
    async fn test_keepalive_connection_is_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let _ = stream.write_all(b"PONG\r\n").await;
                    }
                });
            }
        });

        let mut options = tcp_options();
        options.keepalive = 3;
        options.request.body = "PING\r\n".to_string();
        options.expected.body = "PONG".to_string();
        let fx = fixture(addr, options);

        for _ in 0..3 {
            assert_eq!(run_once(&fx).await, SessionOutcome::Healthy);
        }
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Third request used up the budget, so the fourth opens a new connection.
        assert_eq!(run_once(&fx).await, SessionOutcome::Healthy);
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut options = tcp_options();
        options.timeout = Duration::from_secs(5);
        options.expected.body = "never".to_string();
        let fx = fixture(addr, options);

        let shutdown = fx.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.shutdown();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), run_once(&fx))
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Aborted);

        let stat = fx.store.stat(&identity(addr)).unwrap();
        assert_eq!(stat.fall_total, 0);
        assert_eq!(stat.rise_total, 0);
        assert!(stat.checked.is_none());
    }

    #[tokio::test]
    async fn test_disabled_excluded_host_stays_down_without_record() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut options = tcp_options();
        options.excluded_hosts = vec!["127.0.0.1".to_string()];
        options.disabled_hosts = vec!["127.0.0.1".to_string()];

        let fx = fixture(addr, options);
        assert_eq!(run_once(&fx).await, SessionOutcome::Skipped);
        assert!(host_down(&fx));
        assert!(fx.store.stat(&identity(addr)).is_err());
    }

    #[tokio::test]
    async fn test_forced_down_does_not_count_as_checked() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut options = tcp_options();
        options.interval = Duration::from_secs(60);
        options.disabled_hosts = vec!["127.0.0.1".to_string()];

        let fx = fixture(addr, options);
        assert_eq!(run_once(&fx).await, SessionOutcome::ForcedDown);
        assert!(fx.store.stat(&identity(addr)).unwrap().checked.is_none());
    }

    #[tokio::test]
    async fn test_busy_local_state_is_skipped() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let fx = fixture(addr, tcp_options());

        let (_, slot) = fx.store.get(&identity(addr), Some(addr), 4096).unwrap();
        let _held = slot.lock().await;

        let mut opened = 0;
        fx.ctx.peers.visit(&mut |_, peer| {
            if open_session(&fx.ctx, &fx.store, peer, None).unwrap().is_some() {
                opened += 1;
            }
        });
        assert_eq!(opened, 0);
    }
}
