//! Shared health zone of one upstream group.
//!
//! Every worker attached to a group sees the same zone. All reads and
//! writes of records and options happen under the zone mutex, and no
//! socket or file I/O is done while it is held.

use crate::store::{CheckOptions, StoreError};
use crate::upstream::{Module, PeerIdentity};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

/// Default byte budget of a zone.
pub const DEFAULT_ZONE_SIZE: usize = 1024 * 1024;

/// Counters and flags of one peer, visible to all workers.
#[derive(Debug, Clone)]
pub struct SharedHealthRecord {
    pub identity: PeerIdentity,
    /// Consecutive failures since the last success.
    pub fall: u32,
    /// Consecutive successes since the last failure.
    pub rise: u32,
    pub fall_total: u64,
    pub rise_total: u64,
    pub down: bool,
    pub touched: Instant,
    pub checked: Option<Instant>,
}

impl SharedHealthRecord {
    fn new(identity: PeerIdentity, now: Instant) -> Self {
        Self {
            identity,
            fall: 0,
            rise: 0,
            fall_total: 0,
            rise_total: 0,
            down: false,
            touched: now,
            checked: None,
        }
    }

    fn charge(key: &str) -> usize {
        mem::size_of::<Self>() + 2 * key.len()
    }
}

/// Snapshot of a record's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStat {
    pub fall: u32,
    pub rise: u32,
    pub fall_total: u64,
    pub rise_total: u64,
    pub down: bool,
    pub touched: Instant,
    pub checked: Option<Instant>,
}

impl From<&SharedHealthRecord> for HealthStat {
    fn from(rec: &SharedHealthRecord) -> Self {
        Self {
            fall: rec.fall,
            rise: rec.rise,
            fall_total: rec.fall_total,
            rise_total: rec.rise_total,
            down: rec.down,
            touched: rec.touched,
            checked: rec.checked,
        }
    }
}

/// State guarded by the zone mutex.
#[derive(Debug)]
pub struct ZoneState {
    records: HashMap<String, SharedHealthRecord>,
    options: Arc<CheckOptions>,
    used: usize,
    capacity: usize,
    /// Options changed since the last completed round.
    pub dirty: bool,
    /// Start of the last round, or the last tick that found one in flight.
    pub last_round: Option<Instant>,
    /// Modification time of the last persisted snapshot applied.
    pub loaded: Option<SystemTime>,
}

impl ZoneState {
    pub fn options(&self) -> &Arc<CheckOptions> {
        &self.options
    }

    /// Replace the options, charging the difference against the budget.
    pub fn set_options(&mut self, options: CheckOptions) -> Result<(), StoreError> {
        let old = self.options.footprint();
        let new = options.footprint();
        if self.used - old + new > self.capacity {
            return Err(StoreError::OutOfMemory {
                requested: new,
                available: self.capacity - (self.used - old),
            });
        }
        self.used = self.used - old + new;
        self.options = Arc::new(options);
        Ok(())
    }

    pub fn record(&self, key: &str) -> Option<&SharedHealthRecord> {
        self.records.get(key)
    }

    pub fn record_mut(&mut self, key: &str) -> Option<&mut SharedHealthRecord> {
        self.records.get_mut(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &SharedHealthRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn insert_record(
        &mut self,
        identity: &PeerIdentity,
        now: Instant,
    ) -> Result<&mut SharedHealthRecord, StoreError> {
        let key = identity.key();
        if !self.records.contains_key(&key) {
            let charge = SharedHealthRecord::charge(&key);
            if self.used + charge > self.capacity {
                return Err(StoreError::OutOfMemory {
                    requested: charge,
                    available: self.capacity.saturating_sub(self.used),
                });
            }
            self.used += charge;
        }
        Ok(self
            .records
            .entry(key)
            .or_insert_with(|| SharedHealthRecord::new(identity.clone(), now)))
    }

    pub(crate) fn remove_record(&mut self, key: &str) -> Option<SharedHealthRecord> {
        let rec = self.records.remove(key)?;
        self.used -= SharedHealthRecord::charge(key);
        Some(rec)
    }

    fn first_stale(&self, touched_before: Instant) -> Option<String> {
        self.records
            .iter()
            .find(|(_, rec)| rec.touched < touched_before)
            .map(|(key, _)| key.clone())
    }
}

/// Shared health zone of one upstream group.
#[derive(Debug)]
pub struct SharedZone {
    module: Module,
    upstream: String,
    generation: AtomicU64,
    state: Mutex<ZoneState>,
}

impl SharedZone {
    /// Create a zone holding `options`, with a budget of `capacity` bytes.
    pub fn new(
        module: Module,
        upstream: impl Into<String>,
        options: CheckOptions,
        capacity: usize,
    ) -> Result<Self, StoreError> {
        let used = options.footprint();
        if used > capacity {
            return Err(StoreError::OutOfMemory {
                requested: used,
                available: capacity,
            });
        }
        Ok(Self {
            module,
            upstream: upstream.into(),
            generation: AtomicU64::new(0),
            state: Mutex::new(ZoneState {
                records: HashMap::new(),
                options: Arc::new(options),
                used,
                capacity,
                dirty: false,
                last_round: None,
                loaded: None,
            }),
        })
    }

    pub fn module(&self) -> Module {
        self.module
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Register a new attachment and return its generation tag.
    pub fn attach(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn lock(&self) -> MutexGuard<'_, ZoneState> {
        self.state.lock()
    }

    /// Snapshot of the current options.
    pub fn options(&self) -> Arc<CheckOptions> {
        Arc::clone(&self.state.lock().options)
    }

    pub fn stat(&self, key: &str) -> Option<HealthStat> {
        self.state.lock().records.get(key).map(HealthStat::from)
    }

    /// Mark every up record of the peer `name` as checked now.
    ///
    /// Records are keyed `name/server`, so one name may cover several
    /// configured servers.
    pub fn mark_checked(&self, name: &str) -> usize {
        let prefix = format!("{name}/");
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut marked = 0;
        for (key, rec) in state.records.iter_mut() {
            if !rec.down && key.starts_with(&prefix) {
                rec.checked = Some(now);
                marked += 1;
            }
        }
        marked
    }

    /// Remove one record, returning whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove_record(key).is_some()
    }

    /// Remove every record last touched before `touched_before`.
    ///
    /// The lock is taken once per removal so a long sweep never blocks
    /// other workers for its whole duration.
    pub fn gc(&self, touched_before: Instant) -> Vec<String> {
        let mut removed = Vec::new();
        loop {
            let stale = self.state.lock().first_stale(touched_before);
            let Some(key) = stale else {
                break;
            };
            self.delete(&key);
            removed.push(key);
        }
        removed
    }
}
