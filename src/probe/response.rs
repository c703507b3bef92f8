//! Incremental HTTP/1.x response parser.
//!
//! [`ResponseParser::parse`] consumes complete elements from the front of
//! the input buffer and keeps the body in its own buffer, so the input
//! only ever holds an unfinished line or chunk.

use crate::probe::ProbeError;
use bytes::{Buf, BytesMut};

/// Parser progress after consuming the available input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    StatusLine,
    Headers,
    /// Body delimited by Content-Length, or by close when absent.
    Fixed,
    ChunkSize,
    ChunkData(usize),
    ChunkEnd,
    Done,
}

#[derive(Debug)]
pub struct ResponseParser {
    stage: Stage,
    status: Option<u16>,
    content_length: Option<usize>,
    chunked: bool,
    body: BytesMut,
    body_limit: usize,
}

impl ResponseParser {
    pub fn new(body_limit: usize) -> Self {
        Self {
            stage: Stage::StatusLine,
            status: None,
            content_length: None,
            chunked: false,
            body: BytesMut::new(),
            body_limit,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Most bytes worth reading next, when the response length is known.
    pub fn read_limit(&self) -> Option<usize> {
        match (self.stage, self.content_length) {
            (Stage::Fixed, Some(len)) => Some(len - self.body.len()),
            _ => None,
        }
    }

    /// Consume what `input` holds. `eof` tells whether the peer has closed.
    pub fn parse(&mut self, input: &mut BytesMut, eof: bool) -> Result<Parsed, ProbeError> {
        loop {
            match self.stage {
                Stage::StatusLine => match take_line(input) {
                    Some(line) => {
                        self.status = Some(parse_status_line(&line)?);
                        self.stage = Stage::Headers;
                    }
                    None => return need_more(eof, "connection closed in status line"),
                },
                Stage::Headers => match take_line(input) {
                    Some(line) if line.is_empty() => self.stage = self.body_stage()?,
                    Some(line) => self.header(&line)?,
                    None => return need_more(eof, "connection closed in headers"),
                },
                Stage::Fixed => {
                    self.append_body(&input.split())?;
                    if let Some(len) = self.content_length {
                        if self.body.len() > len {
                            return Err(ProbeError::protocol(format!(
                                "body longer than content-length {len}"
                            )));
                        }
                        if self.body.len() == len {
                            self.stage = Stage::Done;
                            continue;
                        }
                    }
                    if !eof {
                        return Ok(Parsed::Incomplete);
                    }
                    return match self.content_length {
                        None => {
                            self.stage = Stage::Done;
                            Ok(Parsed::Complete)
                        }
                        Some(len) => Err(ProbeError::protocol(format!(
                            "connection closed after {} of {len} body bytes",
                            self.body.len()
                        ))),
                    };
                }
                Stage::ChunkSize => {
                    let Some(cr) = input.iter().position(|&b| b == b'\r') else {
                        return need_more(eof, "connection closed in chunk size");
                    };
                    if cr + 1 >= input.len() {
                        return need_more(eof, "connection closed in chunk size");
                    }
                    if input[cr + 1] != b'\n' {
                        return Err(ProbeError::protocol("chunk size not terminated by CRLF"));
                    }
                    let size = parse_chunk_size(&input[..cr])?;
                    input.advance(cr + 2);
                    if size == 0 {
                        self.stage = Stage::Done;
                        continue;
                    }
                    if size > self.body_limit - self.body.len() {
                        return Err(ProbeError::BufferExhausted(self.body_limit));
                    }
                    self.stage = Stage::ChunkData(size);
                }
                Stage::ChunkData(remaining) => {
                    let n = remaining.min(input.len());
                    self.body.extend_from_slice(&input[..n]);
                    input.advance(n);
                    if n < remaining {
                        self.stage = Stage::ChunkData(remaining - n);
                        return need_more(eof, "connection closed in chunk data");
                    }
                    self.stage = Stage::ChunkEnd;
                }
                Stage::ChunkEnd => {
                    if input.len() < 2 {
                        return need_more(eof, "connection closed after chunk data");
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ProbeError::protocol("chunk data not terminated by CRLF"));
                    }
                    input.advance(2);
                    self.stage = Stage::ChunkSize;
                }
                Stage::Done => return Ok(Parsed::Complete),
            }
        }
    }

    fn header(&mut self, line: &[u8]) -> Result<(), ProbeError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ProbeError::protocol("header without colon"))?;
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| ProbeError::protocol("header name is not valid text"))?;
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(ProbeError::protocol(format!("invalid header name '{name}'")));
        }
        let value = String::from_utf8_lossy(&line[colon + 1..]);
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<usize>()
                .map_err(|_| ProbeError::protocol(format!("invalid content-length '{value}'")))?;
            self.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            self.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
        Ok(())
    }

    fn body_stage(&self) -> Result<Stage, ProbeError> {
        if self.status == Some(204) {
            return Ok(Stage::Done);
        }
        if self.chunked {
            if self.content_length.is_some() {
                return Err(ProbeError::protocol(
                    "both content-length and chunked transfer-encoding present",
                ));
            }
            return Ok(Stage::ChunkSize);
        }
        match self.content_length {
            Some(0) => Ok(Stage::Done),
            Some(len) if len > self.body_limit => Err(ProbeError::BufferExhausted(self.body_limit)),
            _ => Ok(Stage::Fixed),
        }
    }

    fn append_body(&mut self, data: &[u8]) -> Result<(), ProbeError> {
        if self.body.len() + data.len() > self.body_limit {
            return Err(ProbeError::BufferExhausted(self.body_limit));
        }
        self.body.extend_from_slice(data);
        Ok(())
    }
}

fn need_more(eof: bool, what: &str) -> Result<Parsed, ProbeError> {
    if eof {
        Err(ProbeError::protocol(what))
    } else {
        Ok(Parsed::Incomplete)
    }
}

/// Split one line off the front of `input`, without its line ending.
fn take_line(input: &mut BytesMut) -> Option<BytesMut> {
    let lf = input.iter().position(|&b| b == b'\n')?;
    let mut line = input.split_to(lf + 1);
    line.truncate(lf);
    if line.last() == Some(&b'\r') {
        line.truncate(lf - 1);
    }
    Some(line)
}

fn parse_status_line(line: &[u8]) -> Result<u16, ProbeError> {
    let invalid = || ProbeError::protocol(format!("invalid status line '{}'", String::from_utf8_lossy(line)));

    let rest = line.strip_prefix(b"HTTP/").ok_or_else(invalid)?;
    let mut parts = rest.splitn(3, |&b| b == b' ');
    let version = parts.next().ok_or_else(invalid)?;
    let valid_version = matches!(version, [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit());
    if !valid_version {
        return Err(invalid());
    }

    match parts.next() {
        Some(code) if code.len() == 3 && code.iter().all(u8::is_ascii_digit) && code[0] != b'0' => {
            Ok(code
                .iter()
                .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0')))
        }
        _ => Err(invalid()),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ProbeError> {
    // Chunk extensions follow a ';'.
    let digits = line.split(|&b| b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| ProbeError::protocol("invalid chunk size"))?
        .trim();
    if digits.is_empty() {
        return Err(ProbeError::protocol("empty chunk size"));
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProbeError::protocol(format!("invalid chunk size '{digits}'")));
    }
    usize::from_str_radix(digits, 16)
        .map_err(|_| ProbeError::protocol(format!("invalid chunk size '{digits}'")))
}
