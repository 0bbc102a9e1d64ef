use std::{sync::Arc, time::Instant};

use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, warn};
use tts_core::SpeechSynthesizer;
use uuid::Uuid;

use super::{AudioChunk, ChunkPayload, Sentence};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;

/// Fans sentences out to the synthesizer, one task per sentence.
///
/// Dispatch waits while the sentence is `window` or more ahead of the
/// transcode cursor, which bounds the audio held in memory per session.
pub struct SynthesisStage {
    session_id: Uuid,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    window: u64,
    cursor: watch::Receiver<u64>,
    chunks: mpsc::Sender<AudioChunk>,
    tasks: JoinSet<()>,
    metrics: Arc<PipelineMetrics>,
}

impl SynthesisStage {
    pub fn new(
        session_id: Uuid,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        window: usize,
        cursor: watch::Receiver<u64>,
        chunks: mpsc::Sender<AudioChunk>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            session_id,
            synthesizer,
            window: window.max(1) as u64,
            cursor,
            chunks,
            tasks: JoinSet::new(),
            metrics,
        }
    }

    /// Start synthesis for `sentence` without waiting for the result.
    pub async fn dispatch(&mut self, sentence: Sentence) -> Result<(), PipelineError> {
        let index = sentence.index;
        let window = self.window;
        self.cursor
            .wait_for(|cursor| index < cursor + window)
            .await
            .map_err(|_| PipelineError::Task("transcode stage stopped".into()))?;

        if !sentence.is_speakable() {
            debug!(session = %self.session_id, index, "skipping sentence with nothing to speak");
            let chunk = AudioChunk {
                index,
                payload: ChunkPayload::Missing(PipelineError::Unspeakable { index }),
            };
            return self
                .chunks
                .send(chunk)
                .await
                .map_err(|_| PipelineError::Task("transcode stage stopped".into()));
        }

        let session_id = self.session_id;
        let synthesizer = self.synthesizer.clone();
        let chunks = self.chunks.clone();
        let metrics = self.metrics.clone();
        self.tasks.spawn(async move {
            let started = Instant::now();
            let payload = match synthesizer.synthesize(sentence.speech_text()).await {
                Ok(audio) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    metrics.synthesis.record(latency_ms);
                    debug!(session = %session_id, index, latency_ms, bytes = audio.len(), "sentence synthesized");
                    ChunkPayload::Audio(audio)
                }
                Err(reason) => {
                    metrics.synthesis.record_error();
                    let err = PipelineError::Synthesis { index, reason };
                    warn!(session = %session_id, "{err}");
                    ChunkPayload::Missing(err)
                }
            };
            // a closed channel means the session already ended
            let _ = chunks.send(AudioChunk { index, payload }).await;
        });
        Ok(())
    }

    /// Wait for every dispatched sentence. Dropping the stage afterwards
    /// closes the chunk channel.
    pub async fn drain(mut self) -> Result<(), PipelineError> {
        while let Some(joined) = self.tasks.join_next().await {
            joined.map_err(|e| PipelineError::Task(format!("synthesis task failed: {e}")))?;
        }
        Ok(())
    }

    /// Cancel every call still in flight.
    pub fn abort(mut self) {
        self.tasks.abort_all();
    }
}
