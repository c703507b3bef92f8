//! Probe protocols.
//!
//! A [`ProtocolHandler`] drives the send and receive halves of one probe
//! over a [`ProbeTransport`]. Each call does as much non-blocking I/O as
//! it can and reports [`Progress`]; the session waits for readiness on
//! [`Progress::Again`].

mod http;
mod pattern;
mod response;
mod tcp;
mod tls;
mod transport;

pub use http::{HttpHandler, WIDEST_DERIVED_HOST, build_request, render_request};
pub use pattern::Pattern;
pub use response::{Parsed, ResponseParser};
pub use tcp::TcpHandler;
pub use tls::{CLIENT_HELLO_LEN, SERVER_HELLO_MIN, TlsHandler, client_hello};
pub use transport::{IoStatus, Phase, ProbeTransport, TransportError};

use crate::store::{CheckOptions, CheckType};
use crate::upstream::PeerIdentity;
use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;

/// Outcome of one send or receive step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The step completed.
    Ok,
    /// The handler has nothing to do for this step.
    Declined,
    /// More I/O is needed.
    Again,
}

/// Reasons a probe fails.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid response: {0}")]
    Protocol(String),

    #[error("response exceeds buffer of {0} bytes")]
    BufferExhausted(usize),

    #[error("invalid response pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("response does not match '{0}'")]
    PatternNotFound(String),

    #[error("status {0} is not an expected response code")]
    UnexpectedStatus(u16),

    #[error("peer has no resolved address")]
    Unresolved,
}

impl ProbeError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ProbeError::Protocol(msg.into())
    }
}

/// Everything a handler needs for one step.
pub struct ProbeContext<'a> {
    pub transport: &'a mut ProbeTransport,
    pub buffer: &'a mut BytesMut,
    pub buffer_size: usize,
    pub options: &'a CheckOptions,
    pub identity: &'a PeerIdentity,
    pub sockaddr: SocketAddr,
}

impl ProbeContext<'_> {
    /// Read once into the free tail of the buffer, at most `limit` bytes.
    pub(crate) fn receive(&mut self, limit: Option<usize>) -> Result<IoStatus, ProbeError> {
        let free = self.buffer_size.saturating_sub(self.buffer.len());
        let want = limit.map_or(free, |limit| limit.min(free));
        if want == 0 {
            return Err(ProbeError::BufferExhausted(self.buffer_size));
        }

        let start = self.buffer.len();
        self.buffer.resize(start + want, 0);
        let status = self.transport.try_receive(&mut self.buffer[start..]);
        let read = match &status {
            Ok(IoStatus::Done(n)) => *n,
            _ => 0,
        };
        self.buffer.truncate(start + read);
        Ok(status?)
    }

    /// Write as much of `buffer[*sent..]` as the socket accepts.
    pub(crate) fn send_pending(&mut self, sent: &mut usize) -> Result<Progress, ProbeError> {
        while *sent < self.buffer.len() {
            match self.transport.try_send(&self.buffer[*sent..])? {
                IoStatus::Done(n) => *sent += n,
                IoStatus::WouldBlock => return Ok(Progress::Again),
                IoStatus::Closed => return Err(TransportError::Closed.into()),
            }
        }
        Ok(Progress::Ok)
    }

    /// Put `payload` into the empty buffer as the request to send.
    pub(crate) fn load_request(&mut self, payload: &[u8]) -> Result<(), ProbeError> {
        if payload.len() > self.buffer_size {
            return Err(ProbeError::BufferExhausted(self.buffer_size));
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(payload);
        Ok(())
    }
}

/// Protocol-specific probe driver.
#[derive(Debug)]
pub enum ProtocolHandler {
    Tcp(TcpHandler),
    Http(HttpHandler),
    Ssl(TlsHandler),
}

impl ProtocolHandler {
    pub fn new(check_type: CheckType, options: &CheckOptions) -> Result<Self, ProbeError> {
        Ok(match check_type {
            CheckType::Tcp => ProtocolHandler::Tcp(TcpHandler::new(options)?),
            CheckType::Http => ProtocolHandler::Http(HttpHandler::new(options)?),
            CheckType::Ssl => ProtocolHandler::Ssl(TlsHandler::new()),
        })
    }

    pub fn check_type(&self) -> CheckType {
        match self {
            ProtocolHandler::Tcp(_) => CheckType::Tcp,
            ProtocolHandler::Http(_) => CheckType::Http,
            ProtocolHandler::Ssl(_) => CheckType::Ssl,
        }
    }

    pub fn on_send(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        match self {
            ProtocolHandler::Tcp(h) => h.on_send(ctx),
            ProtocolHandler::Http(h) => h.on_send(ctx),
            ProtocolHandler::Ssl(h) => h.on_send(ctx),
        }
    }

    pub fn on_recv(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        match self {
            ProtocolHandler::Tcp(h) => h.on_recv(ctx),
            ProtocolHandler::Http(h) => h.on_recv(ctx),
            ProtocolHandler::Ssl(h) => h.on_recv(ctx),
        }
    }
}
