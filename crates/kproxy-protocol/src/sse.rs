//! Incremental server-sent-events parser.
//!
//! Frames are accumulated across arbitrary chunk boundaries and emitted once
//! the terminating blank line arrives. Comment lines are dropped; multi-line
//! `data:` fields are joined with newlines per the SSE spec.

use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();

        loop {
            let Some((frame_len, sep_len)) = find_frame_boundary(&self.pending) else {
                break;
            };
            let raw: String = self.pending.drain(..frame_len + sep_len).collect();
            if let Some(frame) = parse_frame(&raw[..frame_len]) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush whatever is buffered as a final frame (upstream closed without a
    /// trailing blank line).
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.pending);
        if raw.trim().is_empty() {
            return None;
        }
        parse_frame(&raw)
    }
}

/// Locate the first blank-line separator; returns (frame byte length,
/// separator byte length).
fn find_frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|at| (at, 2));
    let crlf = buffer.find("\r\n\r\n").map(|at| (at, 4));
    match (lf, crlf) {
        (Some((a, al)), Some((b, bl))) => {
            if b < a {
                Some((b, bl))
            } else {
                Some((a, al))
            }
        }
        (some, None) => some,
        (None, some) => some,
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            event = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if line == "data" {
            data_lines.push("");
        }
        // `id:` and `retry:` fields are irrelevant to this proxy.
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Serialize a frame back to the wire.
pub fn encode_frame(frame: &SseFrame) -> String {
    let mut out = String::new();
    if let Some(event) = &frame.event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in frame.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"a\":").is_empty());
        let frames = parser.push_str("1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn named_events_and_comments() {
        let mut parser = SseParser::new();
        let frames =
            parser.push_str(": heartbeat\n\nevent: message_start\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn crlf_frames_parse() {
        let mut parser = SseParser::new();
        let frames = parser.push_str("data: x\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn multiline_data_joined() {
        let mut parser = SseParser::new();
        let frames = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_trailing_frame() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let frame = parser.finish().unwrap();
        assert_eq!(frame.data, "tail");
    }

    #[test]
    fn encode_round_trips() {
        let frame = SseFrame {
            event: Some("message_stop".to_string()),
            data: "{}".to_string(),
        };
        let mut parser = SseParser::new();
        let frames = parser.push_str(&encode_frame(&frame));
        assert_eq!(frames, vec![frame]);
    }
}
