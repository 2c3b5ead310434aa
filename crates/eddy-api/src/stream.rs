//! Event stream decoding
//!
//! The chat service answers a streaming request with a long-lived body of
//! `data: {json}` lines. [`EventStreamDecoder`] turns arbitrarily split byte
//! chunks into [`ServerEvent`]s; [`decode_events`] wraps it around a body
//! stream.

use async_stream::stream;
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::{
    error::{Error, Result},
    types::ServerEvent,
};

/// Raw response body, chunked however the transport delivers it
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Decoded server events in wire order
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ServerEvent>> + Send>>;

const DATA_PREFIX: &str = "data:";

/// Incremental decoder from byte chunks to server events.
///
/// Bytes are decoded as UTF-8 with incomplete sequences held back until the
/// next chunk completes them. Complete lines are parsed lazily through
/// [`EventStreamDecoder::next_event`].
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence
    utf8_tail: Vec<u8>,
    /// Decoded text not yet split into lines
    pending: String,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of the body
    pub fn push(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.pending.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.pending.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Next event from the lines completed so far.
    ///
    /// Lines that are empty or lack the `data:` prefix are skipped. A
    /// payload that is not a JSON event is returned as [`Error::Protocol`].
    pub fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            if let Some(result) = parse_line(&line) {
                return Some(result);
            }
        }
        None
    }

    /// Drain every event that is currently complete
    pub fn drain_events(&mut self) -> Vec<Result<ServerEvent>> {
        std::iter::from_fn(|| self.next_event()).collect()
    }

    /// End of stream: drop any unterminated line. Returns the number of
    /// bytes discarded.
    pub fn finish(&mut self) -> usize {
        let discarded = self.pending.len() + self.utf8_tail.len();
        if discarded > 0 {
            tracing::debug!("Discarding {} bytes of unterminated stream data", discarded);
        }
        self.pending.clear();
        self.utf8_tail.clear();
        discarded
    }
}

fn parse_line(line: &str) -> Option<Result<ServerEvent>> {
    let line = line.trim_end_matches(['\n', '\r']);
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    Some(
        serde_json::from_str(payload).map_err(|source| Error::Protocol {
            payload: payload.to_string(),
            source,
        }),
    )
}

/// Decode a response body into a stream of server events.
///
/// The stream ends after the body ends or after the first error, which is
/// yielded as the last item.
pub fn decode_events(mut body: ByteStream) -> EventStream {
    Box::pin(stream! {
        let mut decoder = EventStreamDecoder::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            decoder.push(&chunk);
            while let Some(item) = decoder.next_event() {
                let failed = item.is_err();
                yield item;
                if failed {
                    return;
                }
            }
        }

        decoder.finish();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WIRE: &str = concat!(
        ": keep-alive\n",
        "data: {\"event\":\"message\",\"task_id\":\"t1\",\"answer\":\"Hé\"}\n",
        "\n",
        "event: message\n",
        "data: {\"event\":\"message\",\"task_id\":\"t1\",\"answer\":\"llo 世界\"}\r\n",
        "data:{\"event\":\"message\",\"task_id\":\"t1\",\"answer\":\" 🎉\"}\n",
        "data: {\"event\":\"message_end\",\"task_id\":\"t1\",\"message_id\":\"m1\"}\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<ServerEvent> {
        let mut decoder = EventStreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            decoder.push(chunk);
            for item in decoder.drain_events() {
                events.push(item.unwrap());
            }
        }
        decoder.finish();
        events
    }

    fn answers(events: &[ServerEvent]) -> Vec<&str> {
        events.iter().filter_map(|e| e.answer_fragment()).collect()
    }

    fn body(chunks: Vec<Result<Vec<u8>>>) -> ByteStream {
        Box::pin(futures::stream::iter(chunks))
    }

    #[test]
    fn test_single_chunk() {
        let events = decode_chunks(&[WIRE.as_bytes()]);
        assert_eq!(events.len(), 4);
        assert_eq!(answers(&events), vec!["Hé", "llo 世界", " 🎉"]);
        assert_eq!(events[3].message_id(), Some("m1"));
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = WIRE.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), decode_chunks(&[bytes]));
    }

    #[test]
    fn test_split_inside_multibyte_char() {
        let line = "data: {\"answer\":\"世\"}\n".as_bytes();
        let cut = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&line[..cut]);
        assert!(decoder.next_event().is_none());
        decoder.push(&line[cut..]);
        let event = decoder.next_event().unwrap().unwrap();
        assert_eq!(event.answer_fragment(), Some("世"));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(b"data: {\"answer\":\"a\xFFb\"}\n");
        let event = decoder.next_event().unwrap().unwrap();
        assert_eq!(event.answer_fragment(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn test_non_data_lines_are_ignored() {
        let events = decode_chunks(&[b": ping\nevent: ping\nid: 7\n\nretry: 10\n"]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(b"data: {\"answer\":\"ok\"}\ndata: {not json}\n");
        assert!(decoder.next_event().unwrap().is_ok());
        let err = decoder.next_event().unwrap().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_finish_discards_partial_line() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(b"data: {\"answer\":\"done\"}\ndata: {\"answer\":\"trunc");
        assert!(decoder.next_event().unwrap().is_ok());
        assert!(decoder.next_event().is_none());
        assert_eq!(decoder.finish(), "data: {\"answer\":\"trunc".len());
        assert!(decoder.next_event().is_none());
    }

    #[tokio::test]
    async fn test_decode_events_preserves_order() {
        let events: Vec<_> = decode_events(body(vec![
            Ok(b"data: {\"answer\":\"A\"}\ndata: {\"ans".to_vec()),
            Ok(b"wer\":\"B\"}\n".to_vec()),
            Ok(b"data: {\"answer\":\"C\"}\n".to_vec()),
        ]))
        .collect()
        .await;

        let fragments: Vec<_> = events
            .iter()
            .map(|e| e.as_ref().unwrap().answer_fragment().unwrap().to_string())
            .collect();
        assert_eq!(fragments, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_decode_events_stops_after_protocol_error() {
        let events: Vec<_> = decode_events(body(vec![
            Ok(b"data: {\"answer\":\"A\"}\ndata: [oops\n".to_vec()),
            Ok(b"data: {\"answer\":\"B\"}\n".to_vec()),
        ]))
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].as_ref().unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_decode_events_surfaces_transport_error() {
        let events: Vec<_> = decode_events(body(vec![
            Ok(b"data: {\"answer\":\"A\"}\n".to_vec()),
            Err(Error::api(502, "connection reset")),
            Ok(b"data: {\"answer\":\"B\"}\n".to_vec()),
        ]))
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        assert!(events[1].as_ref().unwrap_err().is_transport());
    }

    proptest! {
        #[test]
        fn prop_fragmentation_does_not_change_events(
            mut cuts in proptest::collection::vec(0..WIRE.len(), 0..12)
        ) {
            let bytes = WIRE.as_bytes();
            cuts.sort_unstable();
            cuts.dedup();

            let mut chunks = Vec::new();
            let mut start = 0;
            for cut in cuts {
                chunks.push(&bytes[start..cut]);
                start = cut;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(decode_chunks(&chunks), decode_chunks(&[bytes]));
        }
    }
}
