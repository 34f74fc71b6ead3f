pub mod openai;
pub mod zhipu;

use crate::traits::{ProviderError, TokenChunk};
use serde_json::Value;

/// Incremental parser for OpenAI-style SSE chat-completion streams
/// (`data: {...}` lines, `data: [DONE]` terminator). Both adapters in this
/// module speak that dialect.
pub(crate) struct SseTokenParser {
    line_buf: String,
    accumulated: String,
    finished: bool,
}

impl SseTokenParser {
    pub(crate) fn new() -> Self {
        Self {
            line_buf: String::new(),
            accumulated: String::new(),
            finished: false,
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    /// Feeds one network chunk and returns the token chunks completed by it.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<TokenChunk> {
        self.line_buf.push_str(&String::from_utf8_lossy(bytes));

        let mut chunks = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                chunks.push(self.final_chunk());
                break;
            }

            let Ok(value) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            let delta = value["choices"][0]["delta"]["content"]
                .as_str()
                .unwrap_or("")
                .to_string();
            if !delta.is_empty() {
                self.accumulated.push_str(&delta);
                chunks.push(TokenChunk {
                    delta,
                    accumulated: self.accumulated.clone(),
                    finished: false,
                });
            }
            if value["choices"][0]["finish_reason"].as_str().is_some() {
                chunks.push(self.final_chunk());
                break;
            }
        }
        chunks
    }

    /// Terminal chunk for streams that end without a `[DONE]` line.
    pub(crate) fn final_chunk(&mut self) -> TokenChunk {
        self.finished = true;
        TokenChunk {
            delta: String::new(),
            accumulated: self.accumulated.clone(),
            finished: true,
        }
    }
}

pub(crate) fn status_error(status: reqwest::StatusCode, body: String) -> ProviderError {
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Unavailable(format!("status {}: {}", status, body))
    } else {
        ProviderError::CallFailed(format!("status {}: {}", status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_lines_and_done() {
        let mut parser = SseTokenParser::new();
        let chunks = parser.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"\xe4\xbd\xa0\xe5\xa5\xbd\"}}]}\n\n",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, "你好");
        assert_eq!(chunks[0].accumulated, "你好");
        assert!(!chunks[0].finished);

        let chunks = parser.feed(b"data: [DONE]\n");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].finished);
        assert_eq!(chunks[0].accumulated, "你好");
        assert!(parser.finished());
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let mut parser = SseTokenParser::new();
        assert!(parser
            .feed(b"data: {\"choices\":[{\"delta\":{\"con")
            .is_empty());
        let chunks = parser.feed(b"tent\":\"hi\"}}]}\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, "hi");
    }

    #[test]
    fn finish_reason_terminates_stream() {
        let mut parser = SseTokenParser::new();
        let chunks = parser.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n",
        );
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].finished);
        assert!(chunks[1].finished);
        assert_eq!(chunks[1].accumulated, "ok");
    }

    #[test]
    fn ignores_comments_and_malformed_json() {
        let mut parser = SseTokenParser::new();
        assert!(parser.feed(b": keepalive\n").is_empty());
        assert!(parser.feed(b"data: {not json}\n").is_empty());
        assert!(parser.feed(b"event: ping\n").is_empty());
    }
}
