//! Incremental decoding of server-sent token streams.
//!
//! Chunks may split anywhere, including inside a line or inside a multibyte
//! character. Complete lines are decoded as they arrive; the incomplete tail
//! is carried over to the next chunk. A `data:` payload that is not valid
//! JSON is held back and joined with the following `data:` line(s). It only
//! becomes a [`Error::Decode`] if the stream ends while it is still pending.

use std::collections::VecDeque;

use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;

use super::transport::ByteStream;

const DONE_SENTINEL: &str = "[DONE]";

/// One decoded protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub delta_content: Option<String>,
    pub tool_call_fragment: Option<String>,
    pub finish_reason: Option<String>,
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            delta_content: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChoicePayload>,
}

#[derive(Debug, Deserialize)]
struct ChoicePayload {
    #[serde(default)]
    delta: DeltaPayload,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_call_fragment: Option<Value>,
}

fn parse_payload(payload: &str) -> Option<StreamEvent> {
    let chunk: ChunkPayload = serde_json::from_str(payload).ok()?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Some(StreamEvent::default());
    };

    let tool_call_fragment = choice.delta.tool_call_fragment.map(|v| match v {
        Value::String(s) => s,
        other => other.to_string(),
    });

    Some(StreamEvent {
        delta_content: choice.delta.content,
        tool_call_fragment,
        finish_reason: choice.finish_reason,
    })
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Line-buffered SSE decoder for a single stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    pending: Option<String>,
    failure: Option<String>,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `data: [DONE]` was seen or [`finish`](Self::finish) ran.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one raw chunk, returning the events its complete lines produced.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1], &mut events);
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Signal end of input. Flushes an unterminated last line and reports
    /// any payload that never became valid JSON.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.process_line(&rest, &mut events);
        }
        self.done = true;

        if let Some(failure) = self.failure.take() {
            return Err(Error::Decode(failure));
        }
        if let Some(pending) = self.pending.take() {
            warn!("Stream ended with unresolved payload: {}", preview(&pending));
            return Err(Error::Decode(format!(
                "stream ended with unparsable payload: {}",
                preview(&pending)
            )));
        }
        Ok(events)
    }

    fn process_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                self.failure
                    .get_or_insert_with(|| format!("invalid UTF-8 in stream line: {e}"));
                return;
            }
        };
        let line = line.strip_suffix('\r').unwrap_or(line);

        // Blank lines delimit events; `:` lines are comments; other fields
        // (event, id, retry) carry nothing we use.
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        if payload.trim() == DONE_SENTINEL {
            if let Some(pending) = self.pending.take() {
                self.failure.get_or_insert_with(|| {
                    format!("stream terminated with unparsable payload: {}", preview(&pending))
                });
            }
            debug!("Stream reached [DONE]");
            self.done = true;
            return;
        }

        if let Some(pending) = self.pending.take() {
            for joined in [format!("{pending}{payload}"), format!("{pending}\n{payload}")] {
                if let Some(event) = parse_payload(&joined) {
                    events.push(event);
                    return;
                }
            }
            // The held-back payload stays unresolved; this line may still
            // stand on its own.
            match parse_payload(payload) {
                Some(event) => {
                    events.push(event);
                    self.pending = Some(pending);
                }
                None => self.pending = Some(format!("{pending}\n{payload}")),
            }
            return;
        }

        match parse_payload(payload) {
            Some(event) => events.push(event),
            None => {
                debug!("Holding back incomplete payload: {}", preview(payload));
                self.pending = Some(payload.to_string());
            }
        }
    }
}

/// Decode a complete list of chunks in one go.
pub fn decode_all<I, B>(chunks: I) -> Result<Vec<StreamEvent>>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut decoder = StreamDecoder::new();
    let mut events = Vec::new();
    for chunk in chunks {
        events.extend(decoder.push(chunk.as_ref()));
    }
    events.extend(decoder.finish()?);
    Ok(events)
}

struct DecodeState {
    bytes: Option<ByteStream>,
    decoder: StreamDecoder,
    queue: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl DecodeState {
    /// Drop the transport stream and seal the decoder.
    fn close(&mut self) -> Result<()> {
        self.bytes = None;
        self.finished = true;
        let tail = self.decoder.finish()?;
        self.queue.extend(tail);
        Ok(())
    }
}

/// Lazily decode a transport byte stream.
///
/// Once `cancel` fires no further events are yielded and the underlying
/// byte stream is dropped.
pub fn decode_stream(
    bytes: ByteStream,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent>> + Send {
    let state = DecodeState {
        bytes: Some(bytes),
        decoder: StreamDecoder::new(),
        queue: VecDeque::new(),
        cancel,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() {
                state.bytes = None;
                return None;
            }
            if let Some(event) = state.queue.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            if state.decoder.is_done() {
                if let Err(e) = state.close() {
                    return Some((Err(e), state));
                }
                continue;
            }

            let Some(bytes) = state.bytes.as_mut() else {
                state.finished = true;
                continue;
            };
            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => continue,
                next = bytes.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&chunk);
                    state.queue.extend(events);
                }
                Some(Err(e)) => {
                    state.bytes = None;
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    if let Err(e) = state.close() {
                        return Some((Err(e), state));
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sse(payloads: &[&str]) -> String {
        let mut out = String::new();
        for p in payloads {
            out.push_str("data: ");
            out.push_str(p);
            out.push_str("\n\n");
        }
        out.push_str("data: [DONE]\n\n");
        out
    }

    fn contents(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| e.delta_content.as_deref())
            .collect()
    }

    #[test]
    fn test_decode_single_chunk() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"content":"1"}}]}"#,
            r#"{"choices":[{"delta":{"content":"2"}}]}"#,
            r#"{"choices":[{"delta":{"content":"3"},"finish_reason":"stop"}]}"#,
        ]);
        let events = decode_all([body.as_bytes()]).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(contents(&events), "123");
        assert_eq!(events[2].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_data_without_space_and_crlf() {
        let body = "data:{\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata:[DONE]\r\n\r\n";
        let events = decode_all([body]).unwrap();
        assert_eq!(contents(&events), "a");
    }

    #[test]
    fn test_comments_and_fields_ignored() {
        let body = ": keepalive\nevent: message\nid: 7\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n";
        let events = decode_all([body]).unwrap();
        assert_eq!(events, vec![StreamEvent::content("x")]);
    }

    #[test]
    fn test_tool_call_fragment_object_is_serialized() {
        let body = sse(&[r#"{"choices":[{"delta":{"tool_call_fragment":{"tool_calls":[]}}}]}"#]);
        let events = decode_all([body]).unwrap();
        assert_eq!(events[0].tool_call_fragment.as_deref(), Some(r#"{"tool_calls":[]}"#));
    }

    #[test]
    fn test_split_payload_across_data_lines_is_joined() {
        let body = "data: {\"choices\":[{\"delta\":\n\ndata: {\"content\":\"joined\"}}]}\n\ndata: [DONE]\n\n";
        let events = decode_all([body]).unwrap();
        assert_eq!(contents(&events), "joined");
    }

    #[test]
    fn test_unresolved_payload_fails_at_end() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\ndata: {broken\n\n";
        let err = decode_all([body]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_unresolved_payload_before_done_fails() {
        let body = "data: {broken\n\ndata: [DONE]\n\n";
        assert!(matches!(decode_all([body]), Err(Error::Decode(_))));
    }

    #[test]
    fn test_valid_line_after_garbage_still_emitted() {
        let mut decoder = StreamDecoder::new();
        let mut events = decoder.push(b"data: {broken\n\n");
        events.extend(decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n\n"));
        assert_eq!(contents(&events), "y");
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn test_unterminated_last_line_is_flushed() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}";
        let events = decode_all([body]).unwrap();
        assert_eq!(contents(&events), "tail");
    }

    #[test]
    fn test_bytes_after_done_are_ignored() {
        let mut decoder = StreamDecoder::new();
        decoder.push(b"data: [DONE]\n\ndata: {garbage");
        assert!(decoder.is_done());
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_multibyte_split() {
        let body = sse(&[r#"{"choices":[{"delta":{"content":"héllo 世界"}}]}"#]);
        let bytes = body.as_bytes();
        let split = body.find('世').unwrap() + 1;
        let events = decode_all([&bytes[..split], &bytes[split..]]).unwrap();
        assert_eq!(contents(&events), "héllo 世界");
    }

    #[tokio::test]
    async fn test_decode_stream_stops_on_cancel() {
        let body = sse(&[r#"{"choices":[{"delta":{"content":"a"}}]}"#]);
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(body.into_bytes())];
        let bytes: ByteStream = Box::pin(futures_util::stream::iter(chunks));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<_> = decode_stream(bytes, cancel).collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_decode_stream_yields_in_order() {
        let body = sse(&[
            r#"{"choices":[{"delta":{"content":"a"}}]}"#,
            r#"{"choices":[{"delta":{"content":"b"}}]}"#,
        ]);
        let (left, right) = body.split_at(17);
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(left.as_bytes().to_vec()), Ok(right.as_bytes().to_vec())];
        let bytes: ByteStream = Box::pin(futures_util::stream::iter(chunks));

        let events: Vec<StreamEvent> = decode_stream(bytes, CancellationToken::new())
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(contents(&events), "ab");
    }

    #[tokio::test]
    async fn test_decode_stream_surfaces_transport_error() {
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec()),
            Err(Error::Transport("connection reset".into())),
        ];
        let bytes: ByteStream = Box::pin(futures_util::stream::iter(chunks));
        let items: Vec<_> = decode_stream(bytes, CancellationToken::new()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Transport(_))));
    }

    fn split_at_points(bytes: &[u8], mut points: Vec<usize>) -> Vec<Vec<u8>> {
        points.retain(|p| *p < bytes.len());
        points.sort_unstable();
        points.dedup();
        let mut chunks = Vec::new();
        let mut start = 0;
        for p in points {
            chunks.push(bytes[start..p].to_vec());
            start = p;
        }
        chunks.push(bytes[start..].to_vec());
        chunks
    }

    proptest! {
        #[test]
        fn decoding_is_split_invariant(
            texts in proptest::collection::vec("[a-zé世 \\\\\"]{0,12}", 1..6),
            points in proptest::collection::vec(0usize..400, 0..12),
        ) {
            let payloads: Vec<String> = texts
                .iter()
                .map(|t| serde_json::json!({"choices":[{"delta":{"content":t}}]}).to_string())
                .collect();
            let refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
            let body = sse(&refs);

            let whole = decode_all([body.as_bytes()]).unwrap();
            let split = decode_all(split_at_points(body.as_bytes(), points)).unwrap();
            prop_assert_eq!(whole, split);
        }
    }
}
