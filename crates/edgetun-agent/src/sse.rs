//! Incremental server-sent-event framing
//!
//! SSE events are line groups terminated by a blank line. The splitter
//! consumes raw body bytes as they arrive and yields one string per
//! completed event, so each event maps to exactly one
//! `proxy_stream_chunk` frame (halving store writes compared to
//! per-line chunks).

#[derive(Debug, Default)]
pub struct SseEventSplitter {
    /// Raw bytes not yet consumed up to a newline.
    buf: String,
    /// Lines of the event currently being accumulated.
    pending: String,
}

impl SseEventSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed body bytes; returns every event completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line = self.buf[..pos].to_string();
            self.buf.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                // Blank line terminates the event
                if !self.pending.is_empty() {
                    events.push(format!("{}\n", self.pending));
                    self.pending.clear();
                }
            } else {
                self.pending.push_str(&line);
                self.pending.push('\n');
            }
        }
        events
    }

    /// Flush whatever is buffered when the body ends mid-event.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.pending.push_str(line.trim_end_matches('\r'));
            self.pending.push('\n');
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(format!("{}\n", std::mem::take(&mut self.pending)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_events() {
        let mut splitter = SseEventSplitter::new();
        let events = splitter.push(b"data: a\n\ndata: b\n\n");
        assert_eq!(events, vec!["data: a\n\n", "data: b\n\n"]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_event_split_across_reads() {
        let mut splitter = SseEventSplitter::new();
        assert!(splitter.push(b"data: hel").is_empty());
        assert!(splitter.push(b"lo\n").is_empty());
        let events = splitter.push(b"\n");
        assert_eq!(events, vec!["data: hello\n\n"]);
    }

    #[test]
    fn test_multi_line_event() {
        let mut splitter = SseEventSplitter::new();
        let events = splitter.push(b"event: update\ndata: x\n\n");
        assert_eq!(events, vec!["event: update\ndata: x\n\n"]);
    }

    #[test]
    fn test_crlf_lines() {
        let mut splitter = SseEventSplitter::new();
        let events = splitter.push(b"data: a\r\n\r\n");
        assert_eq!(events, vec!["data: a\n\n"]);
    }

    #[test]
    fn test_finish_flushes_trailing_event() {
        let mut splitter = SseEventSplitter::new();
        assert!(splitter.push(b"data: tail\n").is_empty());
        assert_eq!(splitter.finish(), Some("data: tail\n\n".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_finish_with_unterminated_line() {
        let mut splitter = SseEventSplitter::new();
        assert!(splitter.push(b"data: partial").is_empty());
        assert_eq!(splitter.finish(), Some("data: partial\n\n".to_string()));
    }

    #[test]
    fn test_blank_input_yields_nothing() {
        let mut splitter = SseEventSplitter::new();
        assert!(splitter.push(b"\n\n\n").is_empty());
        assert_eq!(splitter.finish(), None);
    }
}
