//! Server-Sent Events framing.
//!
//! Both the log stream and the inference stream use the same wire shape:
//! one `retry: <ms>` hint, then `data: <json>\n\n` per event, and a terminal
//! `data: [DONE]\n\n`.

use bytes::Bytes;
use serde::Serialize;

/// Terminal payload that closes a stream.
pub const DONE: &str = "[DONE]";

/// `Content-Type` of every SSE response.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Format a reconnect hint frame.
pub fn retry_frame(retry_ms: u64) -> Bytes {
    Bytes::from(format!("retry: {retry_ms}\n\n"))
}

/// Format a `data:` frame from a raw payload.
///
/// Multi-line payloads are split into one `data:` line per line, as the SSE
/// grammar requires.
pub fn data_frame(payload: &str) -> Bytes {
    let mut out = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        out.push_str("data: ");
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// Format a `data:` frame from a serializable value.
pub fn json_frame<T: Serialize>(value: &T) -> Bytes {
    data_frame(&serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

/// Format the terminal `[DONE]` frame.
pub fn done_frame() -> Bytes {
    data_frame(DONE)
}

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Joined `data:` lines of one event.
    Data(String),
    /// A `retry:` hint in milliseconds.
    Retry(u64),
}

/// Incremental SSE decoder.
///
/// Feed arbitrary byte chunks with [`SseDecoder::push`]; complete events come
/// out in order. Partial lines are buffered until their terminator arrives, so
/// frames split across TCP reads decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw bytes of the unterminated line. Only complete lines are decoded,
    /// so a code point split across reads survives intact.
    pending: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = decode_line(&raw[..raw.len() - 1]);
            self.handle_line(&line, &mut events);
        }
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                events.push(SseEvent::Data(self.data_lines.join("\n")));
                self.data_lines.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse() {
                    events.push(SseEvent::Retry(ms));
                }
            }
            _ => {}
        }
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = decode_line(&rest);
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        if self.data_lines.is_empty() {
            None
        } else {
            let data = self.data_lines.join("\n");
            self.data_lines.clear();
            Some(SseEvent::Data(data))
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames() {
        assert_eq!(retry_frame(3000), Bytes::from("retry: 3000\n\n"));
        assert_eq!(data_frame("{\"a\":1}"), Bytes::from("data: {\"a\":1}\n\n"));
        assert_eq!(done_frame(), Bytes::from("data: [DONE]\n\n"));
        assert_eq!(data_frame("a\nb"), Bytes::from("data: a\ndata: b\n\n"));
    }

    #[test]
    fn test_json_frame() {
        let frame = json_frame(&serde_json::json!({"type": "log"}));
        assert_eq!(frame, Bytes::from("data: {\"type\":\"log\"}\n\n"));
    }

    #[test]
    fn test_decoder_split_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"retry: 100\n\nda").len() == 1);
        assert!(dec.push(b"ta: {\"x\"").is_empty());
        let events = dec.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"x\":1}".into()),
                SseEvent::Data("[DONE]".into())
            ]
        );
    }

    #[test]
    fn test_decoder_crlf_and_comments() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": keep-alive\r\ndata: one\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data("one".into())]);
    }

    #[test]
    fn test_decoder_finish_without_blank_line() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish(), Some(SseEvent::Data("tail".into())));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn test_decoder_code_point_split_across_chunks() {
        let frame = "data: {\"content\":\"héllo 你好\"}\n\n".as_bytes();
        // first byte of the three-byte sequence for 你
        let cut = frame.iter().position(|b| *b == 0xE4).unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.push(&frame[..cut]).is_empty());
        assert_eq!(
            dec.push(&frame[cut..]),
            vec![SseEvent::Data("{\"content\":\"héllo 你好\"}".into())]
        );
    }

    #[test]
    fn test_decoder_code_point_split_in_unterminated_tail() {
        let tail = "data: 你".as_bytes();
        let mut dec = SseDecoder::new();
        assert!(dec.push(&tail[..tail.len() - 1]).is_empty());
        assert!(dec.push(&tail[tail.len() - 1..]).is_empty());
        assert_eq!(dec.finish(), Some(SseEvent::Data("你".into())));
    }
}
