//! Reassembles discrete events from the runner's chunked stdout stream.

use tracing::warn;

use super::protocol::{FRAME_SENTINEL, RunEvent};

/// Incremental frame decoder.
///
/// Feed it stdout chunks as they arrive; it buffers the undelimited tail and
/// yields every complete event in order. Splitting the stream at arbitrary
/// byte offsets yields the same event sequence as one unchunked read.
///
/// A segment that fails to decode is dropped with a warning — one malformed
/// frame never aborts the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RunEvent> {
        self.buf.extend_from_slice(chunk);

        let sentinel = FRAME_SENTINEL.as_bytes();
        let mut events = Vec::new();
        while let Some(pos) = find_subslice(&self.buf, sentinel) {
            let rest = self.buf.split_off(pos + sentinel.len());
            self.buf.truncate(pos);
            let segment = std::mem::replace(&mut self.buf, rest);
            if let Some(event) = decode_segment(&segment) {
                events.push(event);
            }
        }
        events
    }

    /// Bytes buffered awaiting their sentinel.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn decode_segment(segment: &[u8]) -> Option<RunEvent> {
    let text = String::from_utf8_lossy(segment);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<RunEvent>(trimmed) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, segment = %truncate(trimmed, 200), "Dropping undecodable frame");
            None
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepStatus;
    use crate::runner::protocol::encode_frame;

    fn sample_events() -> Vec<RunEvent> {
        vec![
            RunEvent::RunStart {
                title: "smoke".to_string(),
            },
            RunEvent::StepEnd {
                title: "Open page".to_string(),
                duration: 100.0,
                status: StepStatus::Passed,
                error: None,
            },
            RunEvent::StepEnd {
                title: "Submit".to_string(),
                duration: 55.5,
                status: StepStatus::Failed,
                error: Some("x".to_string()),
            },
            RunEvent::RunEnd {
                status: "failed".to_string(),
                duration: 160.0,
            },
        ]
    }

    fn serialize_all(events: &[RunEvent]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for event in events {
            bytes.extend_from_slice(encode_frame(event).unwrap().as_bytes());
        }
        bytes
    }

    #[test]
    fn test_single_chunk_decodes_all_events() {
        let events = sample_events();
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.push(&serialize_all(&events));
        assert_eq!(decoded, events);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let events = sample_events();
        let bytes = serialize_all(&events);

        // Every split point, including ones inside the sentinel itself, must
        // produce the same decoded sequence as one unchunked read.
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut decoded = decoder.push(&bytes[..split]);
            decoded.extend(decoder.push(&bytes[split..]));
            assert_eq!(decoded, events, "diverged at split offset {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_feed() {
        let events = sample_events();
        let bytes = serialize_all(&events);
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for b in &bytes {
            decoded.extend(decoder.push(std::slice::from_ref(b)));
        }
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let good = encode_frame(&RunEvent::RunStart {
            title: "ok".to_string(),
        })
        .unwrap();
        let stream = format!("{{not json{}{}{{\"type\":\"bogus\"}}{}", FRAME_SENTINEL, good, FRAME_SENTINEL);
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.push(stream.as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded[0],
            RunEvent::RunStart {
                title: "ok".to_string()
            }
        );
    }

    #[test]
    fn test_empty_segments_are_ignored() {
        let mut decoder = FrameDecoder::new();
        let stream = format!("{}  {}", FRAME_SENTINEL, FRAME_SENTINEL);
        assert!(decoder.push(stream.as_bytes()).is_empty());
    }

    #[test]
    fn test_trailing_remainder_is_buffered() {
        let frame = encode_frame(&RunEvent::RunEnd {
            status: "passed".to_string(),
            duration: 5.0,
        })
        .unwrap();
        let (head, tail) = frame.split_at(frame.len() - 4);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head.as_bytes()).is_empty());
        assert!(decoder.pending_len() > 0);
        let decoded = decoder.push(tail.as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoder.pending_len(), 0);
    }
}
