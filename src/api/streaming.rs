//! Streaming primitives for the chat relay.
//!
//! Two halves: an incremental decoder for the provider's server-sent events,
//! and a [`ChatFraming`] strategy that turns each outgoing chat envelope into
//! the bytes written to the client.

use axum::http::StatusCode;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::core::error::{AppError, Result};

/// Wire framing for chat envelopes.
///
/// `index` is the zero-based position of the envelope in the response, so
/// framings that separate rather than terminate messages can tell the first
/// write apart.
pub trait ChatFraming: Send + Sync {
    fn name(&self) -> &'static str;

    /// Content type of the client-facing response.
    fn content_type(&self) -> &'static str;

    fn frame(&self, index: usize, payload: &[u8]) -> Bytes;
}

/// Newline-separated envelopes: nothing before the first, exactly one `\n`
/// before each later one. Payloads are not escaped, so an envelope must not
/// itself contain a raw newline; compact JSON never does.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewlineFraming;

impl ChatFraming for NewlineFraming {
    fn name(&self) -> &'static str {
        "newline"
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn frame(&self, index: usize, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        if index > 0 {
            buf.put_u8(b'\n');
        }
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// `data: <payload>\n\n` per envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventStreamFraming;

impl ChatFraming for EventStreamFraming {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn content_type(&self) -> &'static str {
        "text/event-stream"
    }

    fn frame(&self, _index: usize, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 8);
        buf.put_slice(b"data: ");
        buf.put_slice(payload);
        buf.put_slice(b"\n\n");
        buf.freeze()
    }
}

/// Big-endian `u32` length followed by the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedFraming;

impl ChatFraming for LengthPrefixedFraming {
    fn name(&self) -> &'static str {
        "length"
    }

    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn frame(&self, _index: usize, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 4);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Resolve a framing by its configured name. Unknown names fall back to
/// newline framing.
pub fn framing_from_name(name: &str) -> Arc<dyn ChatFraming> {
    match name.to_ascii_lowercase().as_str() {
        "newline" => Arc::new(NewlineFraming),
        "sse" | "event-stream" => Arc::new(EventStreamFraming),
        "length" | "length-prefixed" => Arc::new(LengthPrefixedFraming),
        other => {
            tracing::warn!(framing = %other, "Unknown chat framing, using newline");
            Arc::new(NewlineFraming)
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

/// Ceiling on a single undelivered event unless set otherwise.
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Incremental server-sent-events decoder.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence or
/// between `\r` and `\n`; only complete lines are interpreted. Bytes held
/// for the event in progress are capped at `max_event_bytes`.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    max_event_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            data: Vec::new(),
            data_len: 0,
            max_event_bytes,
        }
    }

    /// Feed a chunk and return the events it completed.
    ///
    /// Fails once the event still being assembled outgrows the limit; the
    /// decoder holds nothing afterwards.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }

        if self.buffer.len() + self.data_len > self.max_event_bytes {
            self.buffer = Vec::new();
            self.data.clear();
            self.data_len = 0;
            return Err(AppError::upstream(
                StatusCode::BAD_GATEWAY,
                format!("upstream event exceeds {} bytes", self.max_event_bytes),
            ));
        }
        Ok(events)
    }

    /// Flush whatever is left once the upstream body has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.process_line(&line, &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        // comment line
        if line[0] == b':' {
            return;
        }
        if let Some(rest) = line.strip_prefix(b"data:") {
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            self.data_len += rest.len();
            self.data.push(String::from_utf8_lossy(rest).into_owned());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        if self.data.is_empty() {
            return;
        }
        let data = self.data.join("\n");
        self.data.clear();
        self.data_len = 0;
        if data.trim() == "[DONE]" {
            events.push(SseEvent::Done);
        } else {
            events.push(SseEvent::Data(data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_newline_framing() {
        let framing = NewlineFraming;
        assert_eq!(framing.frame(0, b"{\"a\":1}"), Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(
            framing.frame(1, b"{\"a\":2}"),
            Bytes::from_static(b"\n{\"a\":2}")
        );
        assert_eq!(framing.content_type(), "application/octet-stream");
    }

    #[test]
    fn test_event_stream_framing() {
        let framing = EventStreamFraming;
        assert_eq!(
            framing.frame(0, b"{}"),
            Bytes::from_static(b"data: {}\n\n")
        );
        assert_eq!(framing.frame(3, b"{}"), framing.frame(0, b"{}"));
    }

    #[test]
    fn test_length_prefixed_framing() {
        let framing = LengthPrefixedFraming;
        assert_eq!(
            framing.frame(0, b"abc"),
            Bytes::from_static(b"\x00\x00\x00\x03abc")
        );
    }

    #[test]
    fn test_framing_from_name() {
        assert_eq!(framing_from_name("newline").name(), "newline");
        assert_eq!(framing_from_name("SSE").name(), "sse");
        assert_eq!(framing_from_name("length").name(), "length");
        assert_eq!(framing_from_name("bogus").name(), "newline");
    }

    #[test]
    fn test_decoder_single_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"x\":1}\n\ndata: [DONE]\n\n").unwrap();
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"x\":1}".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn test_decoder_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"da").unwrap().is_empty());
        assert!(decoder.push(b"ta: {\"x\"").unwrap().is_empty());
        assert!(decoder.push(b":1}\r").unwrap().is_empty());
        assert!(decoder.push(b"\n").unwrap().is_empty());
        assert_eq!(
            decoder.push(b"\r\n").unwrap(),
            vec![SseEvent::Data("{\"x\":1}".to_string())]
        );
    }

    #[test]
    fn test_decoder_split_utf8() {
        let text = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        // split inside the two-byte 'é'
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&text[..split]).unwrap().is_empty());
        assert_eq!(
            decoder.push(&text[split..]).unwrap(),
            vec![SseEvent::Data("{\"t\":\"héllo\"}".to_string())]
        );
    }

    #[test]
    fn test_decoder_ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\nevent: message\nid: 7\ndata: {}\n\n").unwrap();
        assert_eq!(events, vec![SseEvent::Data("{}".to_string())]);
    }

    #[test]
    fn test_decoder_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"last\":true}").unwrap().is_empty());
        assert_eq!(
            decoder.finish(),
            vec![SseEvent::Data("{\"last\":true}".to_string())]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_decoder_rejects_oversized_event() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push(b"data: 0123456").unwrap().is_empty());
        let err = decoder.push(b"789abcdef").unwrap_err();
        assert!(err.to_string().contains("exceeds 16 bytes"));
        // nothing of the oversized event is kept
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_decoder_limit_is_per_event() {
        let mut decoder = SseDecoder::with_limit(16);
        for _ in 0..8 {
            assert_eq!(
                decoder.push(b"data: 01234567\n\n").unwrap(),
                vec![SseEvent::Data("01234567".to_string())]
            );
        }
    }

    #[test]
    fn test_decoder_counts_unterminated_data_lines() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push(b"data: 0123456789\n").unwrap().is_empty());
        assert!(decoder.push(b"data: 0123456789\n").is_err());
    }
}
