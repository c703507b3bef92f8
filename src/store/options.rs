//! Per-upstream check options and admin updates to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::mem;
use std::time::Duration;

/// Default receive buffer size for probe responses.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Probe protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Tcp,
    Http,
    Ssl,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Tcp => "tcp",
            CheckType::Http => "http",
            CheckType::Ssl => "ssl",
        }
    }
}

/// Request sent by a probe.
///
/// For HTTP probes `uri` selects the request target; an empty `uri`
/// makes the probe send `body` as raw bytes like a TCP probe.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RequestTemplate {
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub uri: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: String,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            method: default_method(),
            uri: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }
}

/// What a probe response must look like to count as healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExpectedResponse {
    /// Accepted HTTP status codes; empty accepts any.
    #[serde(default)]
    pub codes: Vec<u16>,

    /// Pattern the response body must match; empty skips matching.
    #[serde(default)]
    pub body: String,
}

/// Effective check options of one upstream group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    /// `None` leaves the group unchecked.
    pub check_type: Option<CheckType>,
    pub fall: u32,
    pub rise: u32,
    pub timeout: Duration,
    pub interval: Duration,
    pub keepalive: u32,
    pub request: RequestTemplate,
    pub expected: ExpectedResponse,
    /// Probe port overriding the peer's own port.
    pub port: Option<u16>,
    pub passive: bool,
    pub off: bool,
    pub disabled: bool,
    /// Host prefixes disabled for every upstream.
    pub global_disabled_hosts: Vec<String>,
    pub disabled_hosts: Vec<String>,
    pub excluded_hosts: Vec<String>,
    pub buffer_size: usize,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            check_type: None,
            fall: 1,
            rise: 1,
            timeout: Duration::from_millis(1000),
            interval: Duration::from_secs(10),
            keepalive: 1,
            request: RequestTemplate::default(),
            expected: ExpectedResponse::default(),
            port: None,
            passive: false,
            off: false,
            disabled: false,
            global_disabled_hosts: Vec::new(),
            disabled_hosts: Vec::new(),
            excluded_hosts: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl CheckOptions {
    /// True if `host` matches a global or per-upstream disabled prefix.
    pub fn is_host_disabled(&self, host: &str) -> bool {
        matches_prefix(&self.global_disabled_hosts, host) || matches_prefix(&self.disabled_hosts, host)
    }

    pub fn is_host_excluded(&self, host: &str) -> bool {
        matches_prefix(&self.excluded_hosts, host)
    }

    /// Approximate number of zone bytes these options occupy.
    pub fn footprint(&self) -> usize {
        let strings = |list: &[String]| list.iter().map(|s| s.len()).sum::<usize>();
        mem::size_of::<Self>()
            + self.request.method.len()
            + self.request.uri.len()
            + self.request.body.len()
            + self
                .request
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self.expected.codes.len() * mem::size_of::<u16>()
            + self.expected.body.len()
            + strings(&self.global_disabled_hosts)
            + strings(&self.disabled_hosts)
            + strings(&self.excluded_hosts)
    }
}

fn matches_prefix(list: &[String], host: &str) -> bool {
    list.iter().any(|prefix| host.starts_with(prefix.as_str()))
}

/// A set of option fields to change; unset fields stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsUpdate {
    pub check_type: Option<CheckType>,
    pub fall: Option<u32>,
    pub rise: Option<u32>,
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
    pub keepalive: Option<u32>,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
    pub response_codes: Option<Vec<u16>>,
    pub response_body: Option<String>,
    /// `Some(0)` clears the port override.
    pub port: Option<u16>,
    pub passive: Option<bool>,
    pub off: Option<bool>,
    pub disabled: Option<bool>,
}

/// Lower bound applied to admin supplied timeouts.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Lower bound applied to admin supplied intervals.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

impl OptionsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the update to `options`, clamping numeric fields.
    ///
    /// Returns true if any field took a new value.
    pub fn apply(&self, options: &mut CheckOptions) -> bool {
        let before = options.clone();

        if let Some(check_type) = self.check_type {
            options.check_type = Some(check_type);
        }
        if let Some(fall) = self.fall {
            options.fall = fall.max(1);
        }
        if let Some(rise) = self.rise {
            options.rise = rise.max(1);
        }
        if let Some(timeout) = self.timeout {
            options.timeout = timeout.max(MIN_TIMEOUT);
        }
        if let Some(interval) = self.interval {
            options.interval = interval.max(MIN_INTERVAL);
        }
        if let Some(keepalive) = self.keepalive {
            options.keepalive = keepalive.max(1);
        }
        if let Some(method) = &self.method {
            options.request.method = method.clone();
        }
        if let Some(uri) = &self.uri {
            options.request.uri = uri.clone();
        }
        if let Some(headers) = &self.headers {
            options.request.headers = headers.clone();
        }
        if let Some(body) = &self.body {
            options.request.body = body.clone();
        }
        if let Some(codes) = &self.response_codes {
            options.expected.codes = codes.clone();
        }
        if let Some(pattern) = &self.response_body {
            options.expected.body = pattern.clone();
        }
        if let Some(port) = self.port {
            options.port = (port != 0).then_some(port);
        }
        if let Some(passive) = self.passive {
            options.passive = passive;
        }
        if let Some(off) = self.off {
            options.off = off;
        }
        if let Some(disabled) = self.disabled {
            options.disabled = disabled;
        }

        *options != before
    }
}

fn default_method() -> String {
    "GET".to_string()
}
