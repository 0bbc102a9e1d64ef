//! Per-session narration pipeline.
//!
//! ```text
//! Narrator ─tokens─▶ segmenter ─sentences─▶ SynthesisStage ─chunks─▶ TranscodeStage ─▶ Sink
//!                                                 ▲                        │
//!                                                 └──── cursor (watch) ────┘
//! ```
//!
//! Synthesis calls run concurrently and finish in any order. The transcode
//! stage puts chunks back in sentence order before they reach the sink, and
//! publishes its cursor so synthesis never runs more than a fixed window
//! ahead of what has been written.

pub mod coordinator;
pub mod reorder;
pub mod segmenter;
pub mod synthesis;
pub mod transcode;

pub use coordinator::PipelineCoordinator;
pub use reorder::ReorderBuffer;
pub use segmenter::{sentences, SentenceSegmenter};
pub use synthesis::SynthesisStage;
pub use transcode::{TranscodeReport, TranscodeStage, TranscoderFactory};

use crate::error::PipelineError;

/// One completed sentence of narration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// Position within the session, starting at 0.
    pub index: u64,
    /// Exact text as streamed, terminator included.
    pub text: String,
    pub terminator: char,
}

impl Sentence {
    /// Whether there is anything to say. A stray "." is not.
    pub fn is_speakable(&self) -> bool {
        self.text.chars().any(char::is_alphanumeric)
    }

    /// Text handed to the synthesizer.
    pub fn speech_text(&self) -> &str {
        self.text.trim()
    }
}

/// Synthesis result for one sentence.
#[derive(Debug)]
pub struct AudioChunk {
    pub index: u64,
    pub payload: ChunkPayload,
}

#[derive(Debug)]
pub enum ChunkPayload {
    Audio(Vec<u8>),
    /// The sentence produced no audio; its index becomes a gap.
    Missing(PipelineError),
}
