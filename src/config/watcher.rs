//! Configuration file watcher for hot reload.
//!
//! A reload swaps in new upstream lists and check options. Zones of
//! upstreams that survive the reload keep their health records.

use crate::config::{Config, load_config, validate_config};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Editors often write a file in several steps; events inside this window
/// collapse into one reload.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Callback type for config reload.
pub type ReloadCallback = Box<dyn Fn(Config) + Send + Sync>;

/// Configuration file watcher.
pub struct ConfigWatcher {
    config_path: PathBuf,
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    /// Create a new config watcher.
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Run until shutdown, reloading on file changes and on SIGHUP.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher_result: Result<RecommendedWatcher, _> = Watcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        );

        let mut watcher = match watcher_result {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                let _ = shutdown.recv().await;
                return;
            }
        };

        // Watch the parent so that rename-into-place is seen
        let parent = match self.config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Err(e) = watcher.watch(&parent, RecursiveMode::NonRecursive) {
            error!(error = %e, dir = %parent.display(), "failed to watch config directory");
            let _ = shutdown.recv().await;
            return;
        }

        #[cfg(unix)]
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to setup SIGHUP handler");
                None
            }
        };

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        warn!("file watcher channel closed");
                        break;
                    };
                    if !self.should_reload(&event) {
                        continue;
                    }

                    tokio::time::sleep(SETTLE_DELAY).await;
                    let mut coalesced = 0usize;
                    while rx.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    debug!(coalesced, "config file changed");
                    self.try_reload();
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        if let Some(ref mut sig) = sighup {
                            sig.recv().await
                        } else {
                            std::future::pending::<Option<()>>().await
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload();
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Whether the event is a write or create of the watched file.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        is_our_file && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
    }

    /// Load, validate and apply the file. Returns whether it was applied.
    fn try_reload(&self) -> bool {
        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load new config, keeping current");
                return false;
            }
        };

        if let Err(e) = validate_config(&new_config) {
            error!(error = %e, "new config validation failed, keeping current");
            return false;
        }

        let servers: usize = new_config.upstreams.iter().map(|u| u.servers.len()).sum();
        info!(
            upstreams = new_config.upstreams.len(),
            servers,
            "configuration reloaded"
        );
        (self.reload_callback)(new_config);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn watcher_for(path: &str) -> ConfigWatcher {
        ConfigWatcher::new(PathBuf::from(path), Box::new(|_| {}))
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_should_reload_modify() {
        let watcher = watcher_for("/test/config.yaml");
        let ev = event(
            EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Content,
            )),
            "/test/config.yaml",
        );
        assert!(watcher.should_reload(&ev));
    }

    #[test]
    fn test_should_reload_create() {
        let watcher = watcher_for("/test/config.yaml");
        let ev = event(
            EventKind::Create(notify::event::CreateKind::File),
            "/test/config.yaml",
        );
        assert!(watcher.should_reload(&ev));
    }

    #[test]
    fn test_should_reload_wrong_file() {
        let watcher = watcher_for("/test/config.yaml");
        let ev = event(
            EventKind::Modify(notify::event::ModifyKind::Any),
            "/test/other.yaml",
        );
        assert!(!watcher.should_reload(&ev));
    }

    #[test]
    fn test_should_reload_delete_ignored() {
        let watcher = watcher_for("/test/config.yaml");
        let ev = event(
            EventKind::Remove(notify::event::RemoveKind::File),
            "/test/config.yaml",
        );
        assert!(!watcher.should_reload(&ev));
    }

    #[test]
    fn test_try_reload_applies_valid_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "upstreams:\n  - name: api\n    servers:\n      - server: \"127.0.0.1:9000\""
        )
        .unwrap();

        let applied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applied);
        let watcher = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(move |config| {
                assert_eq!(config.upstreams.len(), 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(watcher.try_reload());
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_reload_keeps_current_on_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "upstreams: []").unwrap();

        let watcher = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(|_| panic!("invalid config must not be applied")),
        );
        assert!(!watcher.try_reload());
    }
}
