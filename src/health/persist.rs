//! Durable snapshots of admin-changed check options.
//!
//! One YAML file per upstream at `<dir>/<module>/<upstream>.yaml`. A
//! snapshot is loaded at round start when its mtime is newer than the
//! last one applied, and saved at round completion while options are dirty.

use crate::config::duration::humantime_serde;
use crate::store::{CheckOptions, CheckType, ExpectedResponse, RequestTemplate};
use crate::upstream::Module;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid snapshot {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The subset of [`CheckOptions`] that survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PersistedOptions {
    #[serde(default, rename = "type")]
    pub check_type: Option<CheckType>,
    pub fall: u32,
    pub rise: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub keepalive: u32,
    #[serde(default)]
    pub request: RequestTemplate,
    #[serde(default)]
    pub expected: ExpectedResponse,
    #[serde(default)]
    pub off: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_hosts: Vec<String>,
}

impl PersistedOptions {
    /// Capture `options`. Stream upstreams have no request line or status
    /// codes, so those fields are left out.
    pub fn capture(module: Module, options: &CheckOptions) -> Self {
        let mut request = options.request.clone();
        let mut expected = options.expected.clone();
        if module == Module::Stream {
            request = RequestTemplate {
                body: request.body,
                ..Default::default()
            };
            expected.codes.clear();
        }
        Self {
            check_type: options.check_type,
            fall: options.fall,
            rise: options.rise,
            timeout: options.timeout,
            interval: options.interval,
            keepalive: options.keepalive,
            request,
            expected,
            off: options.off,
            disabled: options.disabled,
            disabled_hosts: options.disabled_hosts.clone(),
        }
    }

    /// Overwrite the persisted fields of `options`.
    pub fn apply(&self, options: &mut CheckOptions) {
        options.check_type = self.check_type;
        options.fall = self.fall.max(1);
        options.rise = self.rise.max(1);
        options.timeout = self.timeout;
        options.interval = self.interval;
        options.keepalive = self.keepalive.max(1);
        options.request = self.request.clone();
        options.expected = self.expected.clone();
        options.off = self.off;
        options.disabled = self.disabled;
        options.disabled_hosts = self.disabled_hosts.clone();
    }
}

/// Snapshot files under one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the snapshot of `upstream`.
    pub fn path(&self, module: Module, upstream: &str) -> PathBuf {
        let file: String = upstream
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        self.root
            .join(module.as_str())
            .join(format!("{file}.yaml"))
    }

    /// Modification time of the snapshot, `None` if there is none.
    pub fn modified(&self, module: Module, upstream: &str) -> Result<Option<SystemTime>, PersistError> {
        let path = self.path(module, upstream);
        match fs::metadata(&path) {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|source| PersistError::Io { path, source }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistError::Io { path, source }),
        }
    }

    pub fn load(
        &self,
        module: Module,
        upstream: &str,
    ) -> Result<Option<(PersistedOptions, SystemTime)>, PersistError> {
        let Some(modified) = self.modified(module, upstream)? else {
            return Ok(None);
        };
        let path = self.path(module, upstream);
        let contents = fs::read_to_string(&path).map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?;
        let persisted: PersistedOptions =
            serde_yaml::from_str(&contents).map_err(|source| PersistError::Yaml { path, source })?;
        debug!(module = %module, upstream = %upstream, "loaded options snapshot");
        Ok(Some((persisted, modified)))
    }

    /// Write the snapshot and return the new file's mtime.
    pub fn save(
        &self,
        module: Module,
        upstream: &str,
        options: &CheckOptions,
    ) -> Result<SystemTime, PersistError> {
        let path = self.path(module, upstream);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistError::Io { path, source }
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }

        let snapshot = PersistedOptions::capture(module, options);
        let contents = serde_yaml::to_string(&snapshot).map_err(|source| PersistError::Yaml {
            path: path.clone(),
            source,
        })?;

        // Write beside the target and rename so readers never see a partial file.
        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, contents).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;

        let modified = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(io_err(&path))?;
        info!(module = %module, upstream = %upstream, path = %path.display(), "saved options snapshot");
        Ok(modified)
    }
}
