use std::{pin::pin, sync::Arc, time::Duration};

use futures_util::StreamExt;
use llm_core::{NarrationRequest, Narrator};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tts_core::SpeechSynthesizer;
use uuid::Uuid;

use super::{
    segmenter::sentences, SynthesisStage, TranscodeReport, TranscodeStage, TranscoderFactory,
};
use crate::config::ServerConfig;
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::session::{Session, SessionRegistry, SessionState};

/// Starts and supervises one pipeline per narration request.
#[derive(Clone)]
pub struct PipelineCoordinator {
    registry: Arc<SessionRegistry>,
    narrator: Arc<dyn Narrator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcoder: TranscoderFactory,
    metrics: Arc<PipelineMetrics>,
    window: usize,
    retention: Duration,
}

impl PipelineCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        narrator: Arc<dyn Narrator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcoder: TranscoderFactory,
        metrics: Arc<PipelineMetrics>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            narrator,
            synthesizer,
            transcoder,
            metrics,
            window: config.synthesis_window.max(1),
            retention: config.retention(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Create a session, schedule its deletion and run the pipeline in the
    /// background. Returns as soon as the session exists.
    pub async fn start(&self, request: NarrationRequest) -> Result<Uuid, PipelineError> {
        let session = self.registry.create().await?;
        let id = session.id();
        self.registry.schedule_deletion(id, self.retention);
        PipelineMetrics::incr(&self.metrics.sessions_started);
        info!(
            session = %id,
            images = request.images.len(),
            question_len = request.question.len(),
            "narration started"
        );

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run(session, request).await });
        Ok(id)
    }

    async fn run(self, session: Arc<Session>, request: NarrationRequest) {
        let id = session.id();
        match self.drive(&session, &request).await {
            Ok(report) => {
                if session.transition(SessionState::Complete) {
                    info!(
                        session = %id,
                        sentences = report.chunks_written + report.gaps.len() as u64,
                        gaps = ?report.gaps,
                        bytes = report.bytes_written,
                        "narration complete"
                    );
                } else {
                    warn!(session = %id, state = ?session.state(), "narration finished after the session ended");
                }
                PipelineMetrics::incr(&self.metrics.sessions_completed);
            }
            Err(err) => {
                error!(session = %id, "narration failed: {err}");
                session.transition(SessionState::Failed);
                session.sink().fail();
                PipelineMetrics::incr(&self.metrics.sessions_failed);
            }
        }
    }

    async fn drive(
        &self,
        session: &Arc<Session>,
        request: &NarrationRequest,
    ) -> Result<TranscodeReport, PipelineError> {
        let (chunk_tx, chunk_rx) = mpsc::channel(self.window);
        let (cursor_tx, cursor_rx) = watch::channel(0u64);

        let transcode = TranscodeStage::new(
            session.clone(),
            chunk_rx,
            cursor_tx,
            self.transcoder.clone(),
            self.metrics.clone(),
        )
        .spawn();
        let mut synthesis = SynthesisStage::new(
            session.id(),
            self.synthesizer.clone(),
            self.window,
            cursor_rx,
            chunk_tx,
            self.metrics.clone(),
        );

        if let Err(err) = self.generate(session, request, &mut synthesis).await {
            synthesis.abort();
            // Stop readers before the transcoder drains what is left.
            session.transition(SessionState::Failed);
            session.sink().fail();
            return match transcode.await {
                Ok(Err(stage_err)) => Err(stage_err),
                _ => Err(err),
            };
        }

        session.transition(SessionState::Transcoding);
        debug!(session = %session.id(), "narration stream ended, draining synthesis");
        synthesis.drain().await?;

        transcode
            .await
            .map_err(|e| PipelineError::Task(format!("transcode task failed: {e}")))?
    }

    async fn generate(
        &self,
        session: &Session,
        request: &NarrationRequest,
        synthesis: &mut SynthesisStage,
    ) -> Result<(), PipelineError> {
        let tokens = self
            .narrator
            .narrate(request)
            .await
            .map_err(PipelineError::UpstreamStream)?;

        let mut stream = pin!(sentences(tokens));
        while let Some(sentence) = stream.next().await {
            let sentence = sentence.map_err(PipelineError::UpstreamStream)?;
            session.record_sentence();
            PipelineMetrics::incr(&self.metrics.sentences);
            debug!(session = %session.id(), index = sentence.index, len = sentence.text.len(), "sentence ready");
            synthesis.dispatch(sentence).await?;
        }
        Ok(())
    }
}
