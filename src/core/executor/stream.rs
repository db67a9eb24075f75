use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::core::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, PartialEq)]
pub enum StreamLine {
    Output(String),
    ToolCall(ToolCall),
    /// Upstream signalled a rate limit. The line is still shown as output.
    RateLimited {
        retry_after: Option<Duration>,
        text: String,
    },
}

/// Classifies process output lines. Structured lines are JSON objects with a
/// `type` field; anything else is plain text.
pub struct LineClassifier {
    rate_limit: Regex,
}

impl LineClassifier {
    pub fn new() -> CoreResult<Self> {
        let rate_limit = Regex::new(r"(?i)rate[ _-]?limit|usage limit|\b429\b")
            .map_err(|e| CoreError::Config(format!("rate limit pattern: {}", e)))?;
        Ok(Self { rate_limit })
    }

    pub fn classify(&self, line: &str) -> StreamLine {
        if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(line.trim()) {
            match obj.get("type").and_then(|t| t.as_str()) {
                Some("tool_call") | Some("tool_use") => {
                    let name = obj
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let input = obj
                        .get("input")
                        .or_else(|| obj.get("arguments"))
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    return StreamLine::ToolCall(ToolCall { name, input });
                }
                Some("rate_limit") => {
                    return StreamLine::RateLimited {
                        retry_after: obj
                            .get("retry_after_secs")
                            .and_then(|v| v.as_u64())
                            .map(Duration::from_secs),
                        text: line.to_string(),
                    };
                }
                _ => {}
            }
        }

        if self.rate_limit.is_match(line) {
            StreamLine::RateLimited {
                retry_after: None,
                text: line.to_string(),
            }
        } else {
            StreamLine::Output(line.to_string())
        }
    }
}

/// Longest line handed to the classifier; longer lines are split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Newline-delimited reader over a child pipe. Invalid UTF-8 is replaced
/// rather than ending the stream. Only `fill_buf` is awaited, so a call
/// dropped inside `select!` loses nothing.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            max_len: max_len.max(1),
        }
    }

    /// `Ok(None)` only at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }
            let room = self.max_len - self.buf.len();
            let window = &available[..available.len().min(room)];
            match window.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    self.buf.extend_from_slice(&window[..i]);
                    self.inner.consume(i + 1);
                    return Ok(Some(self.take_line()));
                }
                None => {
                    let n = window.len();
                    self.buf.extend_from_slice(window);
                    self.inner.consume(n);
                    if self.buf.len() >= self.max_len {
                        return Ok(Some(self.take_line()));
                    }
                }
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(input: &[u8], max_len: usize) -> Vec<String> {
        let mut reader = LineReader::new(input, max_len);
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let lines = read_all(b"ok\n\xff\r\nafter\n", 1024).await;
        assert_eq!(lines, vec!["ok", "\u{FFFD}", "after"]);
    }

    #[tokio::test]
    async fn long_lines_are_split_at_the_cap() {
        let mut input = vec![b'a'; 10];
        input.extend_from_slice(b"\ntail");
        let lines = read_all(&input, 4).await;
        assert_eq!(lines, vec!["aaaa", "aaaa", "aa", "tail"]);
    }

    #[test]
    fn tool_use_lines_become_tool_calls() {
        let c = LineClassifier::new().unwrap();
        let line = r#"{"type":"tool_use","name":"bash","input":{"cmd":"ls"}}"#;
        assert_eq!(
            c.classify(line),
            StreamLine::ToolCall(ToolCall {
                name: "bash".into(),
                input: serde_json::json!({"cmd": "ls"}),
            })
        );
    }

    #[test]
    fn structured_rate_limit_carries_retry_after() {
        let c = LineClassifier::new().unwrap();
        match c.classify(r#"{"type":"rate_limit","retry_after_secs":120}"#) {
            StreamLine::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn textual_rate_limit_is_detected() {
        let c = LineClassifier::new().unwrap();
        assert!(matches!(
            c.classify("Error: 429 Too Many Requests"),
            StreamLine::RateLimited { .. }
        ));
        assert!(matches!(
            c.classify("Claude usage limit reached"),
            StreamLine::RateLimited { .. }
        ));
        assert!(matches!(c.classify("4290 files scanned"), StreamLine::Output(_)));
    }

    #[test]
    fn other_json_is_plain_output() {
        let c = LineClassifier::new().unwrap();
        assert!(matches!(
            c.classify(r#"{"type":"assistant","text":"hi"}"#),
            StreamLine::Output(_)
        ));
    }
}
