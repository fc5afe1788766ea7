use crate::constants::MAX_EVENT_BYTES;
use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

/// Incremental server-sent-events decoder. Network reads can split an event
/// anywhere, so state lives here: complete lines are consumed as they
/// arrive, `data:` payloads accumulate, and an event is emitted only on the
/// blank line that terminates it. `event:`, `id:`, `retry:` and comment
/// lines are consumed and ignored.
#[derive(Debug, Default)]
pub struct SseEventCodec {
    data_lines: Vec<String>,
    /// Bytes buffered across `data_lines`, bounded by `MAX_EVENT_BYTES`.
    buffered: usize,
}

impl SseEventCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one line (already stripped of its terminator). Returns the
    /// finished event payload when the line was an event boundary.
    fn take_line(&mut self, line: &[u8]) -> Option<String> {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            let event = self.data_lines.join("\n");
            self.data_lines.clear();
            self.buffered = 0;
            return Some(event);
        }
        let text = String::from_utf8_lossy(line);
        if let Some(payload) = text.strip_prefix("data:") {
            // The protocol allows exactly one optional space after the colon.
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            self.buffered += payload.len();
            self.data_lines.push(payload.to_string());
        }
        None
    }
}

impl Decoder for SseEventCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_EVENT_BYTES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "SSE line exceeds maximum event size",
                    ));
                }
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            if let Some(event) = self.take_line(&line[..line.len() - 1]) {
                return Ok(Some(event));
            }
            // The single-line ceiling also bounds the sum of buffered
            // data lines; a stream that never sends a blank line must not
            // grow the pending event without limit.
            if self.buffered > MAX_EVENT_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "SSE event exceeds maximum buffered size",
                ));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        // Tail without a final newline still counts as a complete line once
        // the connection closes.
        if !src.is_empty() {
            let tail = src.split_to(src.len());
            if let Some(event) = self.take_line(&tail) {
                return Ok(Some(event));
            }
        }
        // Likewise an event the server never followed with a blank line.
        if !self.data_lines.is_empty() {
            let event = self.data_lines.join("\n");
            self.data_lines.clear();
            return Ok(Some(event));
        }
        Ok(None)
    }
}
