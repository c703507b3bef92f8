//! Raw TCP probe: optional payload out, optional pattern in.

use crate::probe::{IoStatus, Pattern, ProbeContext, ProbeError, Progress};
use crate::store::CheckOptions;

#[derive(Debug, Default)]
pub struct TcpHandler {
    sent: usize,
    pattern: Option<Pattern>,
}

impl TcpHandler {
    pub fn new(options: &CheckOptions) -> Result<Self, ProbeError> {
        Ok(Self {
            sent: 0,
            pattern: Pattern::optional(&options.expected.body)?,
        })
    }

    /// Send whatever is in the buffer, loading the configured payload
    /// into an empty one first.
    pub fn on_send(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        if ctx.buffer.is_empty() {
            let options = ctx.options;
            if options.request.body.is_empty() {
                return Ok(Progress::Declined);
            }
            ctx.load_request(options.request.body.as_bytes())?;
            self.sent = 0;
        }
        ctx.send_pending(&mut self.sent)
    }

    pub fn on_recv(&mut self, ctx: &mut ProbeContext<'_>) -> Result<Progress, ProbeError> {
        let Some(pattern) = &self.pattern else {
            return Ok(Progress::Declined);
        };

        let status = ctx.receive(None)?;
        if pattern.is_match(ctx.buffer) {
            return Ok(Progress::Ok);
        }
        if ctx.buffer.len() >= ctx.buffer_size {
            return Err(ProbeError::BufferExhausted(ctx.buffer_size));
        }
        match status {
            IoStatus::Closed => Err(ProbeError::PatternNotFound(pattern.as_str().to_string())),
            IoStatus::Done(_) | IoStatus::WouldBlock => Ok(Progress::Again),
        }
    }
}
