//! Streaming response interception: a byte-passthrough tee that parses SSE
//! `data:` frames on the side to harvest rate-limit telemetry without
//! blocking the downstream copy.

use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct HarvestedRateLimits {
    #[serde(default)]
    pub retry_after_ms: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenCountFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    rate_limits: Option<HarvestedRateLimits>,
}

/// Incrementally parses a byte stream of SSE frames, extracting
/// `token_count` payloads carrying `rate_limits`. Never buffers beyond the
/// current incomplete line, so arbitrarily long streams are bounded.
pub struct SseRateLimitHarvester {
    buffer: String,
    on_rate_limits: Box<dyn FnMut(HarvestedRateLimits) + Send>,
}

impl SseRateLimitHarvester {
    pub fn new(on_rate_limits: Box<dyn FnMut(HarvestedRateLimits) + Send>) -> Self {
        Self { buffer: String::new(), on_rate_limits }
    }

    /// Feed a chunk of bytes through the tee. Returns the same bytes
    /// unchanged, for passthrough to the downstream writer.
    pub fn feed(&mut self, chunk: Bytes) -> Bytes {
        if let Ok(text) = std::str::from_utf8(&chunk) {
            self.buffer.push_str(text);
            while let Some(pos) = self.buffer.find('\n') {
                let line = self.buffer[..pos].trim_end_matches('\r').to_string();
                self.buffer.drain(..=pos);
                self.process_line(&line);
            }
        }
        chunk
    }

    fn process_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data:") else { return };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(frame) = serde_json::from_str::<TokenCountFrame>(payload) else { return };
        if frame.frame_type != "token_count" {
            return;
        }
        if let Some(limits) = frame.rate_limits {
            debug!(?limits.retry_after_ms, "harvested rate-limit telemetry from stream");
            (self.on_rate_limits)(limits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn harvests_rate_limits_across_chunk_boundary() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();
        let mut harvester = SseRateLimitHarvester::new(Box::new(move |limits| {
            captured_clone.lock().unwrap().push(limits);
        }));

        let frame = serde_json::json!({
            "type": "token_count",
            "rate_limits": {"retry_after_ms": 5000, "reason": "standard"}
        })
        .to_string();
        let full_line = format!("data: {frame}\n");
        let (first, second) = full_line.split_at(full_line.len() / 2);

        harvester.feed(Bytes::from(first.to_string()));
        harvester.feed(Bytes::from(second.to_string()));

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].retry_after_ms, Some(5000));
    }

    #[test]
    fn ignores_non_token_count_frames() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();
        let mut harvester = SseRateLimitHarvester::new(Box::new(move |limits| {
            captured_clone.lock().unwrap().push(limits);
        }));

        harvester.feed(Bytes::from("data: {\"type\": \"delta\", \"text\": \"hi\"}\n".to_string()));
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn passthrough_returns_identical_bytes() {
        let mut harvester = SseRateLimitHarvester::new(Box::new(|_| {}));
        let input = Bytes::from_static(b"data: not json\n");
        let out = harvester.feed(input.clone());
        assert_eq!(out, input);
    }
}
