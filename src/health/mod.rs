//! Active health checking of upstream peers.

mod api;
mod persist;
mod registry;
mod round;
mod scheduler;
mod session;

pub use api::{AdminError, AdminOutcome, HealthCheckApi, PeerStatus};
pub use persist::{PersistError, PersistedOptions, SnapshotStore};
pub use registry::{DynPeers, Registry, Upstream, UpstreamEntry};
pub use round::{RoundTracker, SessionTicket};
pub use scheduler::{ROUND_SPACING, RefreshScheduler};
pub use session::{
    CheckSession, CheckState, SessionContext, SessionOutcome, open_session, probe_address,
};
