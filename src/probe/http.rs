//! HTTP probe.

use crate::probe::{
    IoStatus, Parsed, Pattern, ProbeContext, ProbeError, Progress, ResponseParser, TcpHandler,
};
use crate::store::CheckOptions;
use crate::upstream::PeerIdentity;
use std::net::SocketAddr;
use tracing::debug;

const USER_AGENT: &str = concat!("dynhc/", env!("CARGO_PKG_VERSION"));

/// Widest Host header derived from a resolved peer address.
pub const WIDEST_DERIVED_HOST: &str = "[ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff]:65535";

/// Build the request text for one probe.
///
/// The connection is kept open only while more requests fit in the
/// keep-alive budget. A configured `Host` header wins over the one
/// derived from the peer.
pub fn build_request(
    options: &CheckOptions,
    identity: &PeerIdentity,
    sockaddr: SocketAddr,
    requests: u32,
) -> String {
    let name = identity
        .name
        .rsplit_once(':')
        .map_or(identity.name.as_str(), |(host, _)| host);
    render_request(options, &format!("{name}:{}", sockaddr.port()), requests)
}

/// Render the request with `derived_host` as the Host header used when
/// none is configured.
pub fn render_request(options: &CheckOptions, derived_host: &str, requests: u32) -> String {
    let request = &options.request;
    let keep_alive = options.keepalive > requests.saturating_add(1);

    let mut out = String::with_capacity(128 + request.body.len());
    out.push_str(&format!("{} {} HTTP/1.1\r\n", request.method, request.uri));
    out.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
    out.push_str(if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    });

    let mut host = derived_host;
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host") {
            host = value.as_str();
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Host: {host}\r\n"));

    if request.body.is_empty() {
        out.push_str("\r\n");
    } else {
        out.push_str(&format!("Content-Length: {}\r\n\r\n", request.body.len()));
        out.push_str(&request.body);
    }
    out
}

#[derive(Debug)]
pub struct HttpHandler {
    raw: TcpHandler,
    parser: ResponseParser,
    pattern: Option<Pattern>,
    codes: Vec<u16>,
}

impl HttpHandler {
    pub fn new(options: &CheckOptions) -> Result<Self, ProbeError> {
        Ok(Self {
            raw: TcpHandler::new(options)?,
            parser: ResponseParser::new(options.buffer_size),
            pattern: Pattern::optional(&options.expected.body)?,
            codes: options.expected.codes.clone(),
        })
    }

    /// Send the request. Without a URI the body goes out as raw bytes.
    pub fn on_send(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        if ctx.buffer.is_empty() && !ctx.options.request.uri.is_empty() {
            let request = build_request(
                ctx.options,
                ctx.identity,
                ctx.sockaddr,
                ctx.transport.requests(),
            );
            ctx.load_request(request.as_bytes())?;
        }
        self.raw.on_send(ctx)
    }

    pub fn on_recv(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        loop {
            if self.parser.parse(ctx.buffer, ctx.transport.saw_eof())? == Parsed::Complete {
                return self.verdict(ctx.identity);
            }
            if ctx.receive(self.parser.read_limit())? == IoStatus::WouldBlock {
                return Ok(Progress::Again);
            }
        }
    }

    fn verdict(&self, identity: &PeerIdentity) -> Result<Progress, ProbeError> {
        let status = self.parser.status().unwrap_or_default();
        debug!(
            peer = %identity,
            status,
            body_len = self.parser.body().len(),
            "received http response"
        );

        if !self.codes.is_empty() && !self.codes.contains(&status) {
            return Err(ProbeError::UnexpectedStatus(status));
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(self.parser.body()) {
                return Err(ProbeError::PatternNotFound(pattern.as_str().to_string()));
            }
        }
        Ok(Progress::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Module;
    use std::collections::BTreeMap;

    fn identity() -> PeerIdentity {
        PeerIdentity::new(Module::Http, "api", "api.local:8080", "10.0.0.7:8080")
    }

    fn options(uri: &str) -> CheckOptions {
        let mut opts = CheckOptions::default();
        opts.request.uri = uri.to_string();
        opts
    }

    #[test]
    fn test_request_defaults() {
        let opts = options("/health");
        let req = build_request(&opts, &identity(), "10.0.0.7:8080".parse().unwrap(), 0);

        assert!(req.starts_with("GET /health HTTP/1.1\r\n"));
        assert!(req.contains(&format!("User-Agent: {USER_AGENT}\r\n")));
        assert!(req.contains("Connection: close\r\n"));
        assert!(req.contains("Host: 10.0.0.7:8080\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
        assert!(!req.contains("Content-Length"));
    }

    #[test]
    fn test_request_keepalive_budget() {
        let mut opts = options("/");
        opts.keepalive = 3;
        let addr = "10.0.0.7:8080".parse().unwrap();

        assert!(build_request(&opts, &identity(), addr, 0).contains("Connection: keep-alive\r\n"));
        assert!(build_request(&opts, &identity(), addr, 1).contains("Connection: keep-alive\r\n"));
        assert!(build_request(&opts, &identity(), addr, 2).contains("Connection: close\r\n"));
    }

    #[test]
    fn test_request_uses_configured_host_and_port_override() {
        let mut opts = options("/status");
        opts.request.method = "HEAD".to_string();
        opts.request.headers = BTreeMap::from([
            ("host".to_string(), "status.example".to_string()),
            ("X-Probe".to_string(), "1".to_string()),
        ]);
        let req = build_request(&opts, &identity(), "10.0.0.7:9000".parse().unwrap(), 0);

        assert!(req.starts_with("HEAD /status HTTP/1.1\r\n"));
        assert!(req.contains("X-Probe: 1\r\n"));
        assert!(req.contains("Host: status.example\r\n"));
        assert!(!req.contains("10.0.0.7"));
    }

    #[test]
    fn test_derived_host_uses_probe_port() {
        let opts = options("/");
        let req = build_request(&opts, &identity(), "10.0.0.7:9000".parse().unwrap(), 0);
        assert!(req.contains("Host: 10.0.0.7:9000\r\n"));
    }

    #[test]
    fn test_request_with_body() {
        let mut opts = options("/echo");
        opts.request.method = "POST".to_string();
        opts.request.body = "ping".to_string();
        let req = build_request(&opts, &identity(), "10.0.0.7:8080".parse().unwrap(), 0);
        assert!(req.ends_with("Content-Length: 4\r\n\r\nping"));
    }

    #[test]
    fn test_verdict_codes_and_pattern() {
        let mut opts = options("/");
        opts.expected.codes = vec![200, 204];
        opts.expected.body = "ok".to_string();
        let mut handler = HttpHandler::new(&opts).unwrap();

        let mut input = bytes::BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]);
        assert_eq!(handler.parser.parse(&mut input, false).unwrap(), Parsed::Complete);
        assert_eq!(handler.verdict(&identity()).unwrap(), Progress::Ok);

        let mut handler = HttpHandler::new(&opts).unwrap();
        let mut input = bytes::BytesMut::from(&b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok"[..]);
        handler.parser.parse(&mut input, false).unwrap();
        assert!(matches!(handler.verdict(&identity()), Err(ProbeError::UnexpectedStatus(201))));

        let mut handler = HttpHandler::new(&opts).unwrap();
        let mut input = bytes::BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nno"[..]);
        handler.parser.parse(&mut input, false).unwrap();
        assert!(matches!(handler.verdict(&identity()), Err(ProbeError::PatternNotFound(_))));
    }
}
