//! Server-Sent Events block parser.
//!
//! Consumes an append-only UTF-8 buffer and yields complete event blocks.
//! Blocks are delimited by blank lines (`\n\n` or `\r\n\r\n`); within a block
//! `:` lines are comments, `event:` lines name the event, and `data:` lines
//! accumulate the payload (joined with `\n`, then trimmed). Blocks with no
//! `data:` lines produce no event.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name from the last `event:` line in the block, if any.
    pub event: Option<String>,
    /// Joined and trimmed `data:` payload.
    pub data: String,
}

/// Buffered SSE parser.
///
/// Feed chunks as they arrive; complete blocks come back immediately and the
/// unterminated tail stays in `remaining`. Re-feeding the tail together with
/// fresh input yields the same event sequence as parsing the concatenated
/// buffer once.
///
/// # Example
///
/// ```
/// use renderify::http::sse::SseParser;
///
/// let mut parser = SseParser::new();
/// let events = parser.push("data: {\"x\":1}\n\n");
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].data, "{\"x\":1}");
/// ```
#[derive(Debug, Default)]
pub struct SseParser {
    remaining: String,
}

impl SseParser {
    /// Create a new empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffered unterminated tail.
    pub fn remaining(&self) -> &str {
        &self.remaining
    }

    /// Feed a chunk and return all events whose blocks completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.remaining.push_str(chunk);

        let mut events = Vec::new();
        while let Some((at, len)) = find_block_end(&self.remaining) {
            let block: String = self.remaining.drain(..at + len).collect();
            if let Some(event) = parse_block(&block[..at]) {
                events.push(event);
            }
        }
        events
    }

    /// Emit any trailing well-formed block and clear the buffer.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let tail = std::mem::take(&mut self.remaining);
        match parse_block(&tail) {
            Some(event) => vec![event],
            None => Vec::new(),
        }
    }
}

/// Find the earliest blank-line delimiter, returning `(block_len, delim_len)`.
fn find_block_end(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|i| (i, 2));
    let crlf = buf.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => {
            if b.0 < a.0 {
                Some(b)
            } else {
                Some(a)
            }
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Parse a single block into an event, or `None` when no `data:` lines exist.
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for raw_line in block.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            event_name = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event: event_name,
        data: data_lines.join("\n").trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_block() {
        let mut parser = SseParser::new();
        let events = parser.push("data: {\"choices\":[]}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"choices\":[]}");
        assert_eq!(events[0].event, None);
        assert!(parser.remaining().is_empty());
    }

    #[test]
    fn named_event() {
        let mut parser = SseParser::new();
        let events = parser.push("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
    }

    #[test]
    fn crlf_delimiters() {
        let mut parser = SseParser::new();
        let events = parser.push("data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn comments_ignored() {
        let mut parser = SseParser::new();
        let events = parser.push(": keep-alive\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multi_data_lines_joined() {
        let mut parser = SseParser::new();
        let events = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn block_without_data_produces_no_event() {
        let mut parser = SseParser::new();
        let events = parser.push("event: ping\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: {\"par").is_empty());
        let events = parser.push("tial\":true}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
    }

    #[test]
    fn flush_emits_trailing_block() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: tail").is_empty());
        let events = parser.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
        assert!(parser.remaining().is_empty());
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn reparse_is_equivalent_to_single_parse() {
        let input = "event: a\ndata: 1\n\ndata: 2\n\ndata: 3\n\n";
        let mut whole = SseParser::new();
        let expected = whole.push(input);

        for split in 1..input.len() {
            let mut parser = SseParser::new();
            let mut events = parser.push(&input[..split]);
            events.extend(parser.push(&input[split..]));
            assert_eq!(events, expected, "split at {split}");
        }
    }
}
