//! TLS probe: send a fixed ClientHello, expect a ServerHello back.
//!
//! No handshake is completed. A peer whose first record is a handshake
//! record carrying a ServerHello counts as healthy.

use crate::probe::{IoStatus, ProbeContext, ProbeError, Progress};
use std::time::{SystemTime, UNIX_EPOCH};

/// Total length of the ClientHello record.
pub const CLIENT_HELLO_LEN: usize = 116;

/// Bytes needed before a ServerHello can be judged: record header,
/// handshake header, version and random.
pub const SERVER_HELLO_MIN: usize = 43;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_SERVER_HELLO: u8 = 0x02;

const TIME_OFFSET: usize = 11;
const RANDOM_OFFSET: usize = 15;
const RANDOM_LEN: usize = 28;
const RANDOM_ALPHABET: &[u8] = b"1234567890abcdefghijklmnopqrstuvwxyz";

#[rustfmt::skip]
const CLIENT_HELLO: [u8; CLIENT_HELLO_LEN] = [
    // record: handshake, TLS 1.0, length 111
    0x16, 0x03, 0x01, 0x00, 0x6f,
    // handshake: client hello, length 107, TLS 1.2
    0x01, 0x00, 0x00, 0x6b, 0x03, 0x03,
    // gmt_unix_time
    0x00, 0x00, 0x00, 0x00,
    // random
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // empty session id
    0x00,
    // cipher suites
    0x00, 0x1a,
    0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9, 0xcc, 0xa8, 0xc0, 0x0a, 0xc0, 0x09, 0xc0, 0x13,
    0xc0, 0x14, 0x00, 0x33, 0x00, 0x39, 0x00, 0x2f, 0x00, 0x35, 0x00, 0x0a,
    // null compression
    0x01, 0x00,
    // extensions
    0x00, 0x28,
    // elliptic curves: secp256r1, secp384r1, secp521r1
    0x00, 0x0a, 0x00, 0x08, 0x00, 0x06, 0x00, 0x17, 0x00, 0x18, 0x00, 0x19,
    // signature algorithms
    0x00, 0x0d, 0x00, 0x18, 0x00, 0x16,
    0x04, 0x01, 0x05, 0x01, 0x06, 0x01, 0x02, 0x01, 0x04, 0x03, 0x05, 0x03,
    0x06, 0x03, 0x02, 0x03, 0x05, 0x02, 0x04, 0x02, 0x02, 0x02,
];

/// Build a ClientHello with the current time and a fresh random.
pub fn client_hello() -> [u8; CLIENT_HELLO_LEN] {
    let mut hello = CLIENT_HELLO;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    hello[TIME_OFFSET..RANDOM_OFFSET].copy_from_slice(&now.to_be_bytes());
    for byte in &mut hello[RANDOM_OFFSET..RANDOM_OFFSET + RANDOM_LEN] {
        *byte = RANDOM_ALPHABET[fastrand::usize(..RANDOM_ALPHABET.len())];
    }
    hello
}

#[derive(Debug, Default)]
pub struct TlsHandler {
    sent: usize,
}

impl TlsHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_send(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        if ctx.buffer.is_empty() {
            ctx.load_request(&client_hello())?;
            self.sent = 0;
        }
        ctx.send_pending(&mut self.sent)
    }

    pub fn on_recv(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        let missing = SERVER_HELLO_MIN.saturating_sub(ctx.buffer.len());
        if missing > 0 {
            let status = ctx.receive(Some(missing))?;
            if ctx.buffer.len() < SERVER_HELLO_MIN {
                return match status {
                    IoStatus::Closed => Err(ProbeError::protocol("connection closed before ServerHello")),
                    IoStatus::Done(_) | IoStatus::WouldBlock => Ok(Progress::Again),
                };
            }
        }
        check_server_hello(ctx.buffer)
    }
}

fn check_server_hello(data: &[u8]) -> Result<Progress, ProbeError> {
    if data[0] != RECORD_HANDSHAKE {
        return Err(ProbeError::protocol(format!(
            "expected handshake record, got content type {:#04x}",
            data[0]
        )));
    }
    if data[5] != HANDSHAKE_SERVER_HELLO {
        return Err(ProbeError::protocol(format!(
            "expected ServerHello, got handshake type {:#04x}",
            data[5]
        )));
    }
    Ok(Progress::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_hello() -> Vec<u8> {
        let mut hello = vec![0x16, 0x03, 0x03, 0x00, 0x4a, 0x02, 0x00, 0x00, 0x46, 0x03, 0x03];
        hello.extend_from_slice(&[0xab; 32]);
        hello
    }

    #[test]
    fn test_client_hello_layout() {
        let hello = client_hello();
        assert_eq!(hello.len(), CLIENT_HELLO_LEN);
        assert_eq!(&hello[..5], &[0x16, 0x03, 0x01, 0x00, 0x6f]);
        assert_eq!(usize::from(hello[4]) + 5, CLIENT_HELLO_LEN);
        assert_eq!(usize::from(hello[8]) + 9, CLIENT_HELLO_LEN);

        // session id, cipher list, compression, extensions
        let sid = RANDOM_OFFSET + RANDOM_LEN;
        assert_eq!(hello[sid], 0);
        let ciphers = usize::from(hello[sid + 2]);
        let comp = sid + 3 + ciphers;
        assert_eq!(&hello[comp..comp + 2], &[0x01, 0x00]);
        let ext_len = usize::from(hello[comp + 3]);
        assert_eq!(comp + 4 + ext_len, CLIENT_HELLO_LEN);
    }

    #[test]
    fn test_client_hello_random_alphabet() {
        let first = client_hello();
        let random = &first[RANDOM_OFFSET..RANDOM_OFFSET + RANDOM_LEN];
        assert!(random.iter().all(|b| RANDOM_ALPHABET.contains(b)));

        let second = client_hello();
        assert_ne!(random, &second[RANDOM_OFFSET..RANDOM_OFFSET + RANDOM_LEN]);
    }

    #[test]
    fn test_server_hello_accepted() {
        let hello = server_hello();
        assert!(hello.len() >= SERVER_HELLO_MIN);
        assert_eq!(check_server_hello(&hello).unwrap(), Progress::Ok);
    }

    #[test]
    fn test_alert_rejected() {
        let mut data = server_hello();
        data[0] = 0x15;
        assert!(check_server_hello(&data).is_err());
    }

    #[test]
    fn test_wrong_handshake_type_rejected() {
        let mut data = server_hello();
        data[5] = 0x01;
        assert!(check_server_hello(&data).is_err());
    }
}
