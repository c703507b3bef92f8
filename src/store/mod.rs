//! Health record storage.
//!
//! Each upstream group has one [`SharedZone`] holding the counters every
//! worker sees, and each worker keeps a [`LocalStore`] with its own probe
//! connections. [`HealthRecordStore`] ties one worker's local store to a
//! zone.

mod local;
mod options;
mod zone;

pub use local::{LocalConnectionState, LocalSlot, LocalStore};
pub use options::{
    CheckOptions, CheckType, DEFAULT_BUFFER_SIZE, ExpectedResponse, MIN_INTERVAL, MIN_TIMEOUT,
    OptionsUpdate, RequestTemplate,
};
pub use zone::{DEFAULT_ZONE_SIZE, HealthStat, SharedHealthRecord, SharedZone, ZoneState};

use crate::upstream::PeerIdentity;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Errors from the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared zone exhausted: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("no health record for {0}")]
    NotFound(String),
}

/// Handle to one shared record, valid while the record exists.
#[derive(Debug, Clone)]
pub struct RecordHandle {
    zone: Arc<SharedZone>,
    key: String,
}

impl RecordHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run `f` on the record under the zone lock.
    ///
    /// Returns `None` if the record has been removed.
    pub fn update<R>(&self, f: impl FnOnce(&mut SharedHealthRecord) -> R) -> Option<R> {
        self.zone.lock().record_mut(&self.key).map(f)
    }

    pub fn stat(&self) -> Option<HealthStat> {
        self.zone.stat(&self.key)
    }
}

/// One worker's view of a group's health records.
#[derive(Debug)]
pub struct HealthRecordStore {
    zone: Arc<SharedZone>,
    local: LocalStore,
    generation: AtomicU64,
}

impl HealthRecordStore {
    /// Attach a worker to `zone`.
    pub fn attach(zone: Arc<SharedZone>) -> Self {
        let generation = zone.attach();
        Self {
            zone,
            local: LocalStore::new(),
            generation: AtomicU64::new(generation),
        }
    }

    /// Re-attach after a reload. Local states of the old generation are
    /// replaced the next time they are requested.
    pub fn reattach(&self) -> u64 {
        let generation = self.zone.attach();
        self.generation.store(generation, Ordering::Release);
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn zone(&self) -> &Arc<SharedZone> {
        &self.zone
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Get or create both records of a peer and mark the shared one touched.
    pub fn get(
        &self,
        identity: &PeerIdentity,
        sockaddr: Option<SocketAddr>,
        buffer_size: usize,
    ) -> Result<(RecordHandle, LocalSlot), StoreError> {
        let now = Instant::now();
        let generation = self.generation();
        let key = identity.key();

        let mut state = self.zone.lock();
        match state.record_mut(&key) {
            Some(rec) => rec.touched = now,
            None => {
                state.insert_record(identity, now)?;
                debug!(peer = %identity, "created health record");
            }
        }
        let slot = self
            .local
            .get_or_create(identity, sockaddr, buffer_size, generation);
        drop(state);

        Ok((
            RecordHandle {
                zone: Arc::clone(&self.zone),
                key,
            },
            slot,
        ))
    }

    /// Refresh the touched time of an existing record without creating one.
    pub fn touch(&self, identity: &PeerIdentity) -> bool {
        let mut state = self.zone.lock();
        match state.record_mut(&identity.key()) {
            Some(rec) => {
                rec.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn stat(&self, identity: &PeerIdentity) -> Result<HealthStat, StoreError> {
        self.zone
            .stat(&identity.key())
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    /// Mark the peer's record as checked now.
    pub fn mark_checked(&self, identity: &PeerIdentity) -> Result<(), StoreError> {
        let mut state = self.zone.lock();
        let rec = state
            .record_mut(&identity.key())
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))?;
        rec.checked = Some(Instant::now());
        Ok(())
    }

    /// Delete both records stored under `key`.
    pub fn delete(&self, key: &str) {
        let mut state = self.zone.lock();
        state.remove_record(key);
        self.local.remove(key);
    }

    /// Remove records not touched since `touched_before`, along with local
    /// states that no longer have a shared record.
    pub fn gc(&self, touched_before: Instant) -> usize {
        let removed = self.zone.gc(touched_before);
        for key in &removed {
            debug!(key = %key, upstream = %self.zone.upstream(), "removed stale health record");
        }

        let state = self.zone.lock();
        self.local.retain(|key| state.record(key).is_some());
        removed.len()
    }
}
