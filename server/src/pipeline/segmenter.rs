use futures_util::{Stream, StreamExt};
use llm_core::TokenStream;
use tracing::debug;

use super::Sentence;

pub const TERMINATOR: char = '.';

/// Accumulates streamed fragments and cuts them into sentences at every
/// terminator. Fragments may be any size, from one character to several
/// sentences.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    next_index: u64,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `fragment` and return the sentences it completed, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<Sentence> {
        let mut completed = Vec::new();
        let mut rest = fragment;

        while let Some(pos) = rest.find(TERMINATOR) {
            let (head, tail) = rest.split_at(pos + TERMINATOR.len_utf8());
            self.buffer.push_str(head);
            completed.push(Sentence {
                index: self.next_index,
                text: std::mem::take(&mut self.buffer),
                terminator: TERMINATOR,
            });
            self.next_index += 1;
            rest = tail;
        }

        self.buffer.push_str(rest);
        completed
    }

    /// Number of sentences emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_index
    }

    /// End of input. Returns the unterminated remainder, which is not a
    /// sentence and is never emitted.
    pub fn finish(self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}

/// Lazily segment a token stream. An `Err` from the tokens ends the stream
/// with that error.
pub fn sentences(mut tokens: TokenStream) -> impl Stream<Item = anyhow::Result<Sentence>> + Send {
    async_stream::try_stream! {
        let mut segmenter = SentenceSegmenter::new();
        while let Some(fragment) = tokens.next().await {
            let fragment = fragment?;
            for sentence in segmenter.push(&fragment) {
                yield sentence;
            }
        }

        let emitted = segmenter.emitted();
        if let Some(rest) = segmenter.finish() {
            debug!(emitted, dropped_chars = rest.chars().count(), "dropping unterminated narration tail");
        }
    }
}
