//! Worker-local connection state.

use crate::probe::ProbeTransport;
use crate::upstream::PeerIdentity;
use bytes::BytesMut;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Probe connection and scratch buffer of one peer on one worker.
#[derive(Debug)]
pub struct LocalConnectionState {
    pub owner: PeerIdentity,
    pub sockaddr: Option<SocketAddr>,
    pub connection: Option<ProbeTransport>,
    pub buffer: BytesMut,
    pub buffer_size: usize,
    /// Deadline for an idle keep-alive connection.
    pub expiry: Option<Instant>,
    generation: u64,
}

impl LocalConnectionState {
    pub fn new(
        owner: PeerIdentity,
        sockaddr: Option<SocketAddr>,
        buffer_size: usize,
        generation: u64,
    ) -> Self {
        Self {
            owner,
            sockaddr,
            connection: None,
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
            expiry: None,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop the probe connection, if any.
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            debug!(peer = %self.owner, local = ?conn.local_addr(), "closing probe connection");
        }
        self.expiry = None;
    }

    /// True if this state can serve a probe to `sockaddr` with `buffer_size`.
    fn fits(&self, sockaddr: Option<SocketAddr>, buffer_size: usize, generation: u64) -> bool {
        self.generation == generation && self.sockaddr == sockaddr && self.buffer_size == buffer_size
    }
}

/// Handle to one peer's local state, held by at most one session.
pub type LocalSlot = Arc<Mutex<LocalConnectionState>>;

/// Local states of one worker, keyed like the shared records.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<String, LocalSlot>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the slot for `identity`, creating a fresh one when missing
    /// or when the existing one no longer fits the probe target.
    ///
    /// A slot in use by a session is returned as is.
    pub(crate) fn get_or_create(
        &self,
        identity: &PeerIdentity,
        sockaddr: Option<SocketAddr>,
        buffer_size: usize,
        generation: u64,
    ) -> LocalSlot {
        let key = identity.key();
        if let Some(slot) = self.entries.get(&key) {
            let reusable = match slot.try_lock() {
                Ok(state) => state.fits(sockaddr, buffer_size, generation),
                Err(_) => true,
            };
            if reusable {
                return Arc::clone(slot.value());
            }
        }

        let slot = Arc::new(Mutex::new(LocalConnectionState::new(
            identity.clone(),
            sockaddr,
            buffer_size,
            generation,
        )));
        self.entries.insert(key, Arc::clone(&slot));
        slot
    }

    pub fn get(&self, key: &str) -> Option<LocalSlot> {
        self.entries.get(key).map(|slot| Arc::clone(slot.value()))
    }

    pub fn remove(&self, key: &str) -> Option<LocalSlot> {
        self.entries.remove(key).map(|(_, slot)| slot)
    }

    /// Keep only the entries for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|key, _| keep(key));
    }

    /// Close idle connections whose keep-alive expired before `now`.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let mut closed = 0;
        for entry in self.entries.iter() {
            // Busy slots belong to a running session.
            let Ok(mut state) = entry.value().try_lock() else {
                continue;
            };
            if state.connection.is_some() && state.expiry.is_some_and(|at| at <= now) {
                state.close();
                closed += 1;
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Module;

    fn identity() -> PeerIdentity {
        PeerIdentity::new(Module::Http, "api", "127.0.0.1:80", "127.0.0.1:80")
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_matching_slot() {
        let store = LocalStore::new();
        let addr = Some("127.0.0.1:80".parse().unwrap());

        let a = store.get_or_create(&identity(), addr, 1024, 1);
        let b = store.get_or_create(&identity(), addr, 1024, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_replaces_stale_slot() {
        let store = LocalStore::new();
        let addr = Some("127.0.0.1:80".parse().unwrap());
        let other = Some("127.0.0.1:81".parse().unwrap());

        let a = store.get_or_create(&identity(), addr, 1024, 1);
        let b = store.get_or_create(&identity(), other, 1024, 1);
        assert!(!Arc::ptr_eq(&a, &b));

        let c = store.get_or_create(&identity(), other, 1024, 2);
        assert!(!Arc::ptr_eq(&b, &c));
        assert_eq!(c.lock().await.generation(), 2);
    }

    #[tokio::test]
    async fn test_busy_slot_is_returned_as_is() {
        let store = LocalStore::new();
        let addr = Some("127.0.0.1:80".parse().unwrap());

        let a = store.get_or_create(&identity(), addr, 1024, 1);
        let _guard = a.lock().await;
        let b = store.get_or_create(&identity(), addr, 2048, 2);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_retain_and_remove() {
        let store = LocalStore::new();
        store.get_or_create(&identity(), None, 64, 1);
        assert!(store.get(&identity().key()).is_some());

        store.retain(|_| false);
        assert!(store.is_empty());
        assert!(store.remove(&identity().key()).is_none());
    }
}
