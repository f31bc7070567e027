//! Incremental `text/event-stream` decoder.
//!
//! Bytes arrive in arbitrary chunks; complete lines are cut out of an internal
//! buffer and folded into frames. A blank line dispatches the pending frame.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes of the current incomplete line; may end inside a UTF-8 sequence.
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]).trim_end_matches('\r').to_string();

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.find(':') {
                Some(idx) => {
                    let value = &line[idx + 1..];
                    (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
                }
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                // id / retry carry nothing this client acts on
                _ => {}
            }
        }

        frames
    }

    /// Flush a trailing frame when the body ends without a final blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let mut rest = std::mem::take(&mut self.buffer);
            rest.push(b'\n');
            let mut frames = self.push(&rest);
            if let Some(frame) = frames.pop() {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let frame = SseFrame { event: self.event.take(), data: self.data.join("\n") };
        self.data.clear();
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_data_frame() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"data: {\"role\":\"Turing\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "{\"role\":\"Turing\"}");
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: hel").is_empty());
        assert!(d.push(b"lo\n").is_empty());
        let frames = d.push(b"\n");
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn test_named_end_event() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"event: end\ndata: \n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("end"));
    }

    #[test]
    fn test_event_without_data_still_dispatches() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"event: end\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("end"));
        assert_eq!(frames[0].data, "");
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut d = SseDecoder::new();
        let frames = d.push(b": keepalive\r\ndata: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn test_blank_lines_alone_dispatch_nothing() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"\n\n\n").is_empty());
    }

    #[test]
    fn test_event_name_resets_between_frames() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"event: end\ndata: x\n\ndata: y\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("end"));
        assert_eq!(frames[1].event, None);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: tail").is_empty());
        let frame = d.finish().expect("trailing frame");
        assert_eq!(frame.data, "tail");
        assert!(d.finish().is_none());
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let payload = "data: {\"role\":\"A\",\"content\":\"你好\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b >= 0x80).expect("multibyte") + 1;
        let mut d = SseDecoder::new();
        assert!(d.push(&payload[..split]).is_empty());
        let frames = d.push(&payload[split..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"role\":\"A\",\"content\":\"你好\"}");
        assert!(!frames[0].data.contains('\u{FFFD}'));
    }

    #[test]
    fn test_unterminated_multibyte_tail_flushes_whole() {
        let payload = "data: é".as_bytes();
        let mut d = SseDecoder::new();
        assert!(d.push(&payload[..payload.len() - 1]).is_empty());
        assert!(d.push(&payload[payload.len() - 1..]).is_empty());
        assert_eq!(d.finish().map(|f| f.data), Some("é".to_string()));
    }

    #[test]
    fn test_field_without_space() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"data:compact\n\n");
        assert_eq!(frames[0].data, "compact");
    }
}
