//! Turn a chunked HTTP body into cumulative reply events.
//!
//! The reply endpoints flush raw UTF-8 text as the model produces it. Chunk
//! boundaries are arbitrary, so a multi-byte character may be split across two
//! chunks; the decoder holds the incomplete tail back until the rest arrives.

use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::error::{PlaygroundError, PlaygroundResult};

use super::types::ReplyChunk;

/// A reply stream: one cumulative event per received chunk, then a terminal event.
pub type ReplyStream = Pin<Box<dyn Stream<Item = PlaygroundResult<ReplyChunk>> + Send>>;

/// Incremental UTF-8 accumulator.
#[derive(Clone, Debug, Default)]
pub struct CumulativeText {
    text: String,
    pending: Vec<u8>,
}

impl CumulativeText {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk. Invalid sequences become U+FFFD; an incomplete
    /// trailing sequence is kept until the next chunk.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);

        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = consumed + err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_up_to]));
                    match err.error_len() {
                        Some(invalid) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_up_to + invalid;
                        }
                        None => {
                            consumed = valid_up_to;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
    }

    /// End of input: a dangling partial sequence becomes U+FFFD.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.pending.clear();
            self.text.push(char::REPLACEMENT_CHARACTER);
        }
    }

    /// Text decoded so far.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Consume into the decoded text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

/// Wrap a byte-chunk stream into a [`ReplyStream`].
///
/// Every received chunk yields an event carrying the cumulative text (even when
/// the chunk only completed part of a character). The end of the body yields the
/// terminal event; a read error yields one error and ends the stream.
pub fn cumulative_stream<S, B, E>(bytes: S) -> ReplyStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<PlaygroundError> + Send + 'static,
{
    let inner = Box::pin(bytes);
    let stream = futures::stream::unfold(
        Some((inner, CumulativeText::new())),
        |state| async move {
            let (mut inner, mut text) = state?;
            match inner.next().await {
                Some(Ok(chunk)) => {
                    text.push_bytes(chunk.as_ref());
                    let event = ReplyChunk::partial(text.as_str());
                    Some((Ok(event), Some((inner, text))))
                }
                Some(Err(err)) => Some((Err(err.into()), None)),
                None => {
                    text.finish();
                    Some((Ok(ReplyChunk::terminal(text.into_string())), None))
                }
            }
        },
    );
    Box::pin(stream)
}
