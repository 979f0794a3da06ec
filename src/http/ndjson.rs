//! Newline-delimited JSON stream parser.
//!
//! Same buffered shape as the SSE parser: feed chunks, get back complete
//! payloads plus a retained tail. Unlike SSE, a malformed line is fatal for
//! the whole stream.

use serde_json::Value;

use crate::error::{RenderifyError, Result};

/// Buffered NDJSON parser.
///
/// # Example
///
/// ```
/// use renderify::http::ndjson::NdjsonParser;
///
/// let mut parser = NdjsonParser::new();
/// let payloads = parser.push("{\"response\":\"hi\"}\n").unwrap();
/// assert_eq!(payloads[0]["response"], "hi");
/// ```
#[derive(Debug, Default)]
pub struct NdjsonParser {
    remaining: String,
}

impl NdjsonParser {
    /// Create a new empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// The buffered unterminated tail.
    pub fn remaining(&self) -> &str {
        &self.remaining
    }

    /// Feed a chunk and return the payloads of all completed lines.
    ///
    /// A line that is not valid JSON fails the stream.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Value>> {
        self.remaining.push_str(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.remaining.find('\n') {
            let line: String = self.remaining.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value = serde_json::from_str::<Value>(line).map_err(|e| {
                RenderifyError::Other(format!("malformed NDJSON line: {e}"))
            })?;
            payloads.push(value);
        }
        Ok(payloads)
    }

    /// Parse any trailing line not terminated by a newline and clear the
    /// buffer.
    pub fn flush(&mut self) -> Result<Vec<Value>> {
        let tail = std::mem::take(&mut self.remaining);
        let tail = tail.trim();
        if tail.is_empty() {
            return Ok(Vec::new());
        }
        let value = serde_json::from_str::<Value>(tail)
            .map_err(|e| RenderifyError::Other(format!("malformed NDJSON line: {e}")))?;
        Ok(vec![value])
    }
}
