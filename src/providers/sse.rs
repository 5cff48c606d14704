//! Minimal incremental `text/event-stream` decoder.
//!
//! Provider responses arrive as arbitrary byte chunks; frames are separated
//! by a blank line and payloads carried on `data:` lines. The decoder owns
//! the reassembly buffer so adapters only ever see whole payloads.

/// Stateful SSE frame decoder. Push raw chunk text in, get complete `data:`
/// payloads out.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame it finishes.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some((pos, len)) = frame_boundary(&self.buffer) {
            let frame = self.buffer[..pos].to_string();
            self.buffer = self.buffer[pos + len..].to_string();

            if let Some(data) = frame_data(&frame) {
                payloads.push(data);
            }
        }

        payloads
    }
}

/// Position and width of the earliest blank-line frame separator. Servers may
/// terminate lines with either LF or CRLF, so both blank-line forms count.
fn frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|pos| (pos, 2));
    let crlf = buffer.find("\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Join the `data:` lines of one frame. Comment and `event:` lines are
/// ignored; the payload itself carries the event type for every provider we
/// speak to.
fn frame_data(frame: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            data_lines.push(data);
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push("data: {\"x\":1}\n\n");
        assert_eq!(payloads, vec!["{\"x\":1}".to_string()]);
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: {\"first\"").is_empty());
        assert!(decoder.push(":true}\n").is_empty());
        let payloads = decoder.push("\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec!["{\"first\":true}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn skips_event_and_comment_lines() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push("event: message_start\n: keep-alive\ndata: {\"t\":1}\n\n");
        assert_eq!(payloads, vec!["{\"t\":1}".to_string()]);
    }

    #[test]
    fn joins_multi_line_data() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push("data: line one\ndata: line two\n\n");
        assert_eq!(payloads, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn handles_crlf_terminated_lines() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push("data: {\"y\":2}\r\n\ndata: next\n\n");
        assert_eq!(payloads, vec!["{\"y\":2}".to_string(), "next".to_string()]);
    }

    #[test]
    fn decodes_fully_crlf_delimited_frames() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push("data: {\"z\":3}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(payloads, vec!["{\"z\":3}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn reassembles_crlf_separator_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push("data: partial\r\n").is_empty());
        let payloads = decoder.push("\r\n");
        assert_eq!(payloads, vec!["partial".to_string()]);
    }
}
