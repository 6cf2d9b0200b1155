use bytes::Bytes;

pub const DONE_MARKER: &str = "[DONE]";

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder. Feed it byte chunks; it yields complete events
/// as blank-line boundaries arrive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                self.flush_event(&mut events);
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            self.consume_field(&line);
        }

        events
    }

    /// Drains any partial trailing line and the pending event at EOF.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_field(&line);
        }
        let mut events = Vec::new();
        self.flush_event(&mut events);
        events
    }

    fn consume_field(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
        } else if line == "event" {
            self.event = None;
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// Strips a `data:` prefix from one raw SSE line and returns the JSON
/// payload, or `None` for blanks, comments, and the `[DONE]` marker.
pub fn sse_payload(line: &[u8]) -> Option<&[u8]> {
    let line = line.trim_ascii();
    if line.is_empty() || line.starts_with(b":") {
        return None;
    }
    let data = line
        .strip_prefix(b"data:")
        .map(|rest| rest.trim_ascii())
        .unwrap_or(line);
    if data.is_empty() || data == DONE_MARKER.as_bytes() {
        return None;
    }
    (data.first() == Some(&b'{') || data.first() == Some(&b'[')).then_some(data)
}

/// Frames a JSON payload as a data-only SSE event.
pub fn sse_data_frame(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

/// Frames a JSON payload as a named SSE event (Claude/responses style).
pub fn sse_named_frame(event: &str, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(payload.len() + event.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events() {
        let mut parser = SseParser::new();
        let events =
            parser.push_str("event: message_start\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "{\"b\":2}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn finish_flushes_partial() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"x\":1}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn payload_extraction() {
        assert_eq!(sse_payload(b"data: {\"a\":1}"), Some(&b"{\"a\":1}"[..]));
        assert_eq!(sse_payload(b"{\"a\":1}"), Some(&b"{\"a\":1}"[..]));
        assert_eq!(sse_payload(b"data: [DONE]"), None);
        assert_eq!(sse_payload(b": keep-alive"), None);
        assert_eq!(sse_payload(b""), None);
        assert_eq!(sse_payload(b"data: not-json"), None);
    }
}
