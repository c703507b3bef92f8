//! Administrative interface: option updates, overrides and status queries.
//!
//! Every option change happens under the zone lock and marks the zone
//! dirty, so the next round starts without waiting for the round spacing
//! and, for persistent upstreams, saves a snapshot when it completes.

use crate::health::registry::{Registry, UpstreamEntry};
use crate::probe::Pattern;
use crate::store::{CheckOptions, HealthStat, OptionsUpdate, StoreError};
use crate::upstream::{Module, PeerIdentity, PeerRecord, Tier, UpstreamPeers};
use arc_swap::ArcSwap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Result of an administrative change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOutcome {
    Updated,
    /// The change was a no-op.
    Declined,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("upstream not found: [{module}] {upstream}")]
    NotFound { module: Module, upstream: String },

    #[error(transparent)]
    OutOfMemory(#[from] StoreError),

    #[error("invalid response pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Health of one peer as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub server: String,
    pub name: String,
    pub tier: Tier,
    /// Routing flag of the peer.
    pub down: bool,
    /// Counters, `None` until the peer has been seen by a round.
    pub stat: Option<HealthStat>,
}

/// Handle for administrative operations on the live registry.
#[derive(Clone)]
pub struct HealthCheckApi {
    registry: Arc<ArcSwap<Registry>>,
}

impl HealthCheckApi {
    pub fn new(registry: Arc<ArcSwap<Registry>>) -> Self {
        Self { registry }
    }

    fn entry(&self, module: Module, upstream: &str) -> Result<UpstreamEntry, AdminError> {
        self.registry
            .load()
            .find(module, upstream)
            .ok_or_else(|| AdminError::NotFound {
                module,
                upstream: upstream.to_string(),
            })
    }

    /// Apply a partial update to the options of one upstream.
    pub fn update_options(
        &self,
        module: Module,
        upstream: &str,
        update: &OptionsUpdate,
    ) -> Result<AdminOutcome, AdminError> {
        let entry = self.entry(module, upstream)?;
        if update.is_empty() {
            return Ok(AdminOutcome::Declined);
        }
        if let Some(pattern) = &update.response_body {
            Pattern::optional(pattern)?;
        }

        let changed = modify_options(&entry, |options| update.apply(options))?;
        if changed {
            info!(module = %module, upstream = %upstream, update = ?update, "check options updated");
            Ok(AdminOutcome::Updated)
        } else {
            Ok(AdminOutcome::Declined)
        }
    }

    /// Force every peer of an upstream down, or lift that override.
    pub fn set_disabled(
        &self,
        module: Module,
        upstream: &str,
        disabled: bool,
    ) -> Result<AdminOutcome, AdminError> {
        let update = OptionsUpdate {
            disabled: Some(disabled),
            ..Default::default()
        };
        self.update_options(module, upstream, &update)
    }

    /// Disable or re-enable one host prefix.
    ///
    /// `None` or an empty upstream name applies the change to every
    /// upstream of `module`. The host is recorded in `disabled_hosts`
    /// either way; hosts outside the checker's authority (excluded hosts)
    /// also have their routing flag set directly.
    pub fn set_host_disabled(
        &self,
        module: Module,
        upstream: Option<&str>,
        host: &str,
        disabled: bool,
    ) -> Result<AdminOutcome, AdminError> {
        let entries = match upstream.filter(|name| !name.is_empty()) {
            Some(name) => vec![self.entry(module, name)?],
            None => self.registry.load().entries(module),
        };

        let mut outcome = AdminOutcome::Declined;
        for entry in &entries {
            let options = entry.zone.options();
            let flipped = options.is_host_excluded(host)
                && entry.peers.set_down_matching(host, disabled) > 0;
            let listed = modify_options(entry, |options| toggle_host(options, host, disabled))?;
            let changed = flipped || listed;

            if changed {
                info!(
                    module = %module,
                    upstream = %entry.zone.upstream(),
                    host = %host,
                    disabled,
                    "host override changed"
                );
                outcome = AdminOutcome::Updated;
            }
        }
        Ok(outcome)
    }

    /// Counters and routing flags of every peer of an upstream.
    pub fn query_status(&self, module: Module, upstream: &str) -> Result<Vec<PeerStatus>, AdminError> {
        let entry = self.entry(module, upstream)?;
        let mut status = Vec::new();
        entry.peers.visit(&mut |tier, peer| {
            let identity = PeerIdentity::new(module, upstream, peer.server(), peer.name());
            status.push(PeerStatus {
                server: peer.server().to_string(),
                name: peer.name().to_string(),
                tier,
                down: peer.is_down(),
                stat: entry.zone.stat(&identity.key()),
            });
        });
        Ok(status)
    }

    pub fn query_options(&self, module: Module, upstream: &str) -> Result<Arc<CheckOptions>, AdminError> {
        Ok(self.entry(module, upstream)?.zone.options())
    }

    /// Record that real traffic reached peer `name`, which then counts as
    /// checked for the current interval. Only honoured for passive upstreams.
    pub fn mark_checked(&self, module: Module, upstream: &str, name: &str) -> Result<usize, AdminError> {
        let entry = self.entry(module, upstream)?;
        if !entry.zone.options().passive {
            return Ok(0);
        }
        Ok(entry.zone.mark_checked(name))
    }
}

/// Run `f` on a copy of the options and store it if anything changed.
fn modify_options(
    entry: &UpstreamEntry,
    f: impl FnOnce(&mut CheckOptions) -> bool,
) -> Result<bool, StoreError> {
    let mut state = entry.zone.lock();
    let mut options = CheckOptions::clone(state.options());
    if !f(&mut options) {
        return Ok(false);
    }
    state.set_options(options)?;
    state.dirty = true;
    Ok(true)
}

fn toggle_host(options: &mut CheckOptions, host: &str, disabled: bool) -> bool {
    let listed = options.disabled_hosts.iter().position(|h| h == host);
    match (listed, disabled) {
        (None, true) => {
            options.disabled_hosts.push(host.to_string());
            true
        }
        (Some(pos), false) => {
            options.disabled_hosts.remove(pos);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, UpstreamCheckConfig, UpstreamConfig};
    use crate::store::CheckType;
    use std::time::Duration;

    fn api() -> HealthCheckApi {
        let upstream = |name: &str, servers: &[&str]| UpstreamConfig {
            name: name.to_string(),
            module: Module::Http,
            servers: servers
                .iter()
                .map(|s| ServerConfig {
                    server: s.to_string(),
                    backup: false,
                })
                .collect(),
            check: UpstreamCheckConfig {
                check_type: Some(CheckType::Http),
                excluded_hosts: vec!["127.0.0.9".to_string()],
                ..Default::default()
            },
        };
        let config = Config {
            upstreams: vec![
                upstream("api", &["127.0.0.1:80", "127.0.0.9:80"]),
                upstream("web", &["127.0.0.2:80"]),
            ],
            ..Default::default()
        };
        let registry = Registry::from_config(&config, None).unwrap();
        HealthCheckApi::new(Arc::new(ArcSwap::from_pointee(registry)))
    }

    fn dirty(api: &HealthCheckApi, upstream: &str) -> bool {
        api.registry
            .load()
            .zone(Module::Http, upstream)
            .unwrap()
            .lock()
            .dirty
    }

    #[test]
    fn test_empty_update_is_declined() {
        let api = api();
        let outcome = api
            .update_options(Module::Http, "api", &OptionsUpdate::default())
            .unwrap();
        assert_eq!(outcome, AdminOutcome::Declined);
        assert!(!dirty(&api, "api"));
    }

    #[test]
    fn test_update_clamps_and_marks_dirty() {
        let api = api();
        let update = OptionsUpdate {
            fall: Some(0),
            interval: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        assert_eq!(
            api.update_options(Module::Http, "api", &update).unwrap(),
            AdminOutcome::Updated
        );

        let options = api.query_options(Module::Http, "api").unwrap();
        assert_eq!(options.fall, 1);
        assert_eq!(options.interval, Duration::from_secs(1));
        assert!(dirty(&api, "api"));

        // Same values again change nothing.
        assert_eq!(
            api.update_options(Module::Http, "api", &update).unwrap(),
            AdminOutcome::Declined
        );
    }

    #[test]
    fn test_update_rejects_bad_pattern() {
        let api = api();
        let update = OptionsUpdate {
            response_body: Some("([".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            api.update_options(Module::Http, "api", &update),
            Err(AdminError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_unknown_upstream() {
        let api = api();
        assert!(matches!(
            api.set_disabled(Module::Http, "nope", true),
            Err(AdminError::NotFound { .. })
        ));
        assert!(api.query_status(Module::Stream, "api").is_err());
    }

    #[test]
    fn test_set_disabled_is_idempotent() {
        let api = api();
        assert_eq!(
            api.set_disabled(Module::Http, "api", true).unwrap(),
            AdminOutcome::Updated
        );
        assert_eq!(
            api.set_disabled(Module::Http, "api", true).unwrap(),
            AdminOutcome::Declined
        );
        assert!(api.query_options(Module::Http, "api").unwrap().disabled);
    }

    #[test]
    fn test_host_disabled_in_every_upstream() {
        let api = api();
        let outcome = api
            .set_host_disabled(Module::Http, None, "127.0.0.", true)
            .unwrap();
        assert_eq!(outcome, AdminOutcome::Updated);
        for name in ["api", "web"] {
            let options = api.query_options(Module::Http, name).unwrap();
            assert_eq!(options.disabled_hosts, vec!["127.0.0.".to_string()]);
        }

        let outcome = api
            .set_host_disabled(Module::Http, Some("web"), "127.0.0.", false)
            .unwrap();
        assert_eq!(outcome, AdminOutcome::Updated);
        assert!(api.query_options(Module::Http, "web").unwrap().disabled_hosts.is_empty());
        assert!(!api.query_options(Module::Http, "api").unwrap().disabled_hosts.is_empty());
    }

    #[test]
    fn test_excluded_host_flips_routing_flag() {
        let api = api();
        let outcome = api
            .set_host_disabled(Module::Http, Some("api"), "127.0.0.9", true)
            .unwrap();
        assert_eq!(outcome, AdminOutcome::Updated);
        assert_eq!(
            api.query_options(Module::Http, "api").unwrap().disabled_hosts,
            vec!["127.0.0.9".to_string()]
        );
        assert!(dirty(&api, "api"));

        let status = api.query_status(Module::Http, "api").unwrap();
        let excluded = status.iter().find(|s| s.name == "127.0.0.9:80").unwrap();
        assert!(excluded.down);
        assert!(excluded.stat.is_none());

        assert_eq!(
            api.set_host_disabled(Module::Http, Some("api"), "127.0.0.9", true)
                .unwrap(),
            AdminOutcome::Declined
        );

        assert_eq!(
            api.set_host_disabled(Module::Http, Some("api"), "127.0.0.9", false)
                .unwrap(),
            AdminOutcome::Updated
        );
        assert!(api.query_options(Module::Http, "api").unwrap().disabled_hosts.is_empty());
        let status = api.query_status(Module::Http, "api").unwrap();
        assert!(!status.iter().find(|s| s.name == "127.0.0.9:80").unwrap().down);
    }

    #[test]
    fn test_mark_checked_requires_passive() {
        let api = api();
        let entry = api.registry.load().find(Module::Http, "api").unwrap();
        let mut identity = None;
        entry.peers.visit(&mut |_, peer| {
            identity.get_or_insert_with(|| {
                PeerIdentity::new(Module::Http, "api", peer.server(), peer.name())
            });
        });
        let identity = identity.unwrap();
        entry
            .zone
            .lock()
            .insert_record(&identity, std::time::Instant::now())
            .unwrap();

        assert_eq!(api.mark_checked(Module::Http, "api", &identity.name).unwrap(), 0);

        let update = OptionsUpdate {
            passive: Some(true),
            ..Default::default()
        };
        api.update_options(Module::Http, "api", &update).unwrap();
        assert_eq!(api.mark_checked(Module::Http, "api", &identity.name).unwrap(), 1);
        assert!(entry.zone.stat(&identity.key()).unwrap().checked.is_some());
    }
}
