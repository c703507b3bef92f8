//! Non-blocking probe connection.
//!
//! Reads and writes never wait. Callers that get [`IoStatus::WouldBlock`]
//! wait for readiness with [`ProbeTransport::ready`], bounded by the
//! deadline of the current phase.

use socket2::SockRef;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{Instant, timeout_at};

/// Session phase a transport operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Send,
    Receive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connect => "connect",
            Phase::Send => "send",
            Phase::Receive => "receive",
        })
    }
}

/// Errors from the probe transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} timed out")]
    TimedOut(Phase),

    #[error("connection closed by peer")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result of a single non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Done(usize),
    WouldBlock,
    Closed,
}

/// A TCP connection used for probing one peer.
#[derive(Debug)]
pub struct ProbeTransport {
    stream: TcpStream,
    peer: SocketAddr,
    requests: u32,
    error: bool,
    eof: bool,
}

impl ProbeTransport {
    /// Open a connection to `addr`, giving up at `deadline`.
    pub async fn connect(addr: SocketAddr, deadline: Instant) -> Result<Self, TransportError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;

        let stream = match timeout_at(deadline, socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::TimedOut(Phase::Connect)),
        };

        let transport = Self {
            stream,
            peer: addr,
            requests: 0,
            error: false,
            eof: false,
        };
        transport.verify()?;
        Ok(transport)
    }

    /// Check the socket's pending error.
    pub fn verify(&self) -> Result<(), TransportError> {
        match self.stream.take_error()? {
            Some(source) => Err(TransportError::Connect {
                addr: self.peer,
                source,
            }),
            None => Ok(()),
        }
    }

    /// True if the connection can carry another probe.
    ///
    /// The socket is peeked without consuming data. Unread bytes left over
    /// from an earlier exchange make the connection unusable.
    pub fn is_reusable(&self) -> bool {
        if self.error || self.eof {
            return false;
        }
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        match SockRef::from(&self.stream).peek(&mut probe) {
            Ok(_) => false,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }

    /// Wait until the socket is ready for `interest` or `deadline` passes.
    pub async fn ready(
        &self,
        interest: Interest,
        deadline: Instant,
        phase: Phase,
    ) -> Result<(), TransportError> {
        match timeout_at(deadline, self.stream.ready(interest)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::TimedOut(phase)),
        }
    }

    pub fn try_send(&mut self, buf: &[u8]) -> Result<IoStatus, TransportError> {
        match self.stream.try_write(buf) {
            Ok(0) if !buf.is_empty() => {
                self.eof = true;
                Ok(IoStatus::Closed)
            }
            Ok(n) => Ok(IoStatus::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
            Err(e) => {
                self.error = true;
                Err(TransportError::Io(e))
            }
        }
    }

    pub fn try_receive(&mut self, buf: &mut [u8]) -> Result<IoStatus, TransportError> {
        match self.stream.try_read(buf) {
            Ok(0) => {
                self.eof = true;
                Ok(IoStatus::Closed)
            }
            Ok(n) => Ok(IoStatus::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
            Err(e) => {
                self.error = true;
                Err(TransportError::Io(e))
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    /// Number of probes completed on this connection.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn record_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn mark_error(&mut self) {
        self.error = true;
    }

    /// True once the peer has closed its side.
    pub fn saw_eof(&self) -> bool {
        self.eof
    }
}
