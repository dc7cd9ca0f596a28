//! Pull-based parser for `text/event-stream` bodies.
//!
//! Grounded on `services::llm_service`'s inline SSE line-splitting, factored
//! out so the same shape parses the upstream generation service's stream
//! (C5) and, conceptually, the one this process writes back to the client
//! (C6) — see spec §9 design notes, "SSE parsing".

/// Accumulates raw bytes across chunk boundaries and yields complete
/// `data: ...` lines one at a time. A line of exactly `[DONE]` signals the
/// end of the stream, matching the OpenAI-compatible chat completions
/// contract (spec §6).
#[derive(Default)]
pub struct SseLineParser {
    buffer: String,
}

pub enum SseLine {
    Data(String),
    Done,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the response body; returns every complete
    /// `data:` line found, in order. Incomplete trailing lines are kept for
    /// the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(newline_at) = self.buffer.find('\n') {
            let line = self.buffer[..newline_at].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_at);

            let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
                continue;
            };
            let payload = payload.trim();

            if payload == "[DONE]" {
                lines.push(SseLine::Done);
            } else if !payload.is_empty() {
                lines.push(SseLine::Data(payload.to_string()));
            }
        }

        lines
    }
}
