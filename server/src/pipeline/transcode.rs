use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use tts_core::{CodecError, Transcoder};

use super::{AudioChunk, ChunkPayload, ReorderBuffer};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::session::Session;
use crate::sink::SinkWriter;

/// Builds the session's transcoder on the thread that will drive it.
pub type TranscoderFactory =
    Arc<dyn Fn() -> Result<Box<dyn Transcoder>, CodecError> + Send + Sync>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TranscodeReport {
    pub chunks_written: u64,
    /// Indices that produced no audio, ascending.
    pub gaps: Vec<u64>,
    /// Encoded bytes appended after the header.
    pub bytes_written: u64,
}

/// Sole writer of a session's sink.
///
/// Receives chunks in completion order, applies them in sentence order, and
/// publishes the index it is waiting for on `cursor`.
pub struct TranscodeStage {
    session: Arc<Session>,
    chunks: mpsc::Receiver<AudioChunk>,
    cursor: watch::Sender<u64>,
    factory: TranscoderFactory,
    metrics: Arc<PipelineMetrics>,
}

impl TranscodeStage {
    pub fn new(
        session: Arc<Session>,
        chunks: mpsc::Receiver<AudioChunk>,
        cursor: watch::Sender<u64>,
        factory: TranscoderFactory,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            session,
            chunks,
            cursor,
            factory,
            metrics,
        }
    }

    /// Run on the blocking pool until every chunk sender is gone. A fatal
    /// error fails the sink so attached readers stop waiting.
    pub fn spawn(self) -> JoinHandle<Result<TranscodeReport, PipelineError>> {
        tokio::task::spawn_blocking(move || {
            let session = self.session.clone();
            let result = self.run();
            if let Err(err) = &result {
                warn!(session = %session.id(), "transcode stage stopped: {err}");
                session.sink().fail();
            }
            result
        })
    }

    fn run(mut self) -> Result<TranscodeReport, PipelineError> {
        let session = self.session.clone();
        let mut transcoder = (self.factory)().map_err(PipelineError::EncoderSetup)?;
        let mut writer = session
            .sink()
            .take_writer()
            .ok_or_else(|| PipelineError::Task("sink writer already taken".into()))?;

        let mut reorder = ReorderBuffer::new();
        let mut report = TranscodeReport::default();

        while let Some(chunk) = self.chunks.blocking_recv() {
            if !reorder.insert(chunk.index, chunk.payload) {
                warn!(session = %session.id(), index = chunk.index, "ignoring stale or duplicate chunk");
                continue;
            }
            while let Some((index, payload)) = reorder.pop_ready() {
                self.apply(transcoder.as_mut(), &mut writer, index, payload, &mut report)?;
                self.cursor.send_replace(reorder.next_expected());
            }
        }

        // Only reachable when a synthesis task vanished without reporting.
        let mut expected = reorder.next_expected();
        for (index, payload) in reorder.drain_remaining() {
            for missing in expected..index {
                warn!(session = %session.id(), index = missing, "chunk never arrived");
                self.record_gap(missing, &mut report);
            }
            self.apply(transcoder.as_mut(), &mut writer, index, payload, &mut report)?;
            expected = index + 1;
        }

        match transcoder.finish() {
            Ok(tail) => self.append(&mut writer, &tail, &mut report)?,
            Err(e) => warn!(session = %session.id(), "encoder flush failed: {e}"),
        }
        writer.finish()?;

        info!(
            session = %session.id(),
            chunks = report.chunks_written,
            gaps = report.gaps.len(),
            bytes = report.bytes_written,
            "transcode finished"
        );
        Ok(report)
    }

    fn apply(
        &self,
        transcoder: &mut dyn Transcoder,
        writer: &mut SinkWriter<'_>,
        index: u64,
        payload: ChunkPayload,
        report: &mut TranscodeReport,
    ) -> Result<(), PipelineError> {
        match payload {
            ChunkPayload::Audio(clip) => match transcoder.transcode(&clip) {
                Ok(encoded) => {
                    self.append(writer, &encoded, report)?;
                    report.chunks_written += 1;
                    debug!(session = %self.session.id(), index, bytes = encoded.len(), "chunk written");
                }
                Err(source) => {
                    let err = PipelineError::Transcode { index, source };
                    warn!(session = %self.session.id(), "{err}");
                    PipelineMetrics::incr(&self.metrics.transcode_failures);
                    self.record_gap(index, report);
                }
            },
            ChunkPayload::Missing(err) => {
                debug!(session = %self.session.id(), index, "gap: {err}");
                self.record_gap(index, report);
            }
        }
        Ok(())
    }

    fn append(
        &self,
        writer: &mut SinkWriter<'_>,
        bytes: &[u8],
        report: &mut TranscodeReport,
    ) -> Result<(), PipelineError> {
        writer.append(bytes)?;
        report.bytes_written += bytes.len() as u64;
        self.metrics
            .bytes_written
            .fetch_add(bytes.len() as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn record_gap(&self, index: u64, report: &mut TranscodeReport) {
        report.gaps.push(index);
        self.session.record_gap(index);
        PipelineMetrics::incr(&self.metrics.gaps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::sink::{SinkStatus, SINK_HEADER};

    /// Writes `<clip>|` so the sink shows exactly what was applied and when.
    struct Tagging;

    impl Transcoder for Tagging {
        fn transcode(&mut self, clip: &[u8]) -> Result<Vec<u8>, CodecError> {
            if clip == b"bad" {
                return Err(CodecError::Decode("garbage".into()));
            }
            let mut out = clip.to_vec();
            out.push(b'|');
            Ok(out)
        }

        fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
            Ok(b"END".to_vec())
        }
    }

    fn factory() -> TranscoderFactory {
        Arc::new(|| Ok(Box::new(Tagging) as Box<dyn Transcoder>))
    }

    fn audio(index: u64, bytes: &[u8]) -> AudioChunk {
        AudioChunk {
            index,
            payload: ChunkPayload::Audio(bytes.to_vec()),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        let session = registry.create().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let (cursor_tx, mut cursor_rx) = watch::channel(0);
        let metrics = Arc::new(PipelineMetrics::new());
        let handle =
            TranscodeStage::new(session.clone(), rx, cursor_tx, factory(), metrics.clone()).spawn();

        tx.send(audio(2, b"c")).await.unwrap();
        tx.send(audio(0, b"a")).await.unwrap();
        cursor_rx.wait_for(|c| *c == 1).await.unwrap();
        tx.send(AudioChunk {
            index: 1,
            payload: ChunkPayload::Missing(PipelineError::Unspeakable { index: 1 }),
        })
        .await
        .unwrap();
        tx.send(audio(3, b"bad")).await.unwrap();
        tx.send(audio(4, b"e")).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.chunks_written, 3);
        assert_eq!(report.gaps, vec![1, 3]);
        assert_eq!(session.gaps(), vec![1, 3]);

        let on_disk = std::fs::read(session.sink().path()).unwrap();
        assert_eq!(&on_disk[..SINK_HEADER.len()], &SINK_HEADER);
        assert_eq!(&on_disk[SINK_HEADER.len()..], b"a|c|e|END");
        assert_eq!(report.bytes_written, 9);
        assert_eq!(session.sink().progress().status, SinkStatus::Finished);
        assert_eq!(*cursor_rx.borrow(), 5);
    }

    #[tokio::test]
    async fn test_missing_index_does_not_stall_forever() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        let session = registry.create().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let (cursor_tx, _cursor_rx) = watch::channel(0);
        let handle = TranscodeStage::new(
            session.clone(),
            rx,
            cursor_tx,
            factory(),
            Arc::new(PipelineMetrics::new()),
        )
        .spawn();

        tx.send(audio(1, b"b")).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.gaps, vec![0]);
        let on_disk = std::fs::read(session.sink().path()).unwrap();
        assert_eq!(&on_disk[SINK_HEADER.len()..], b"b|END");
    }

    #[tokio::test]
    async fn test_encoder_setup_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        let session = registry.create().await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let (cursor_tx, _cursor_rx) = watch::channel(0);
        let broken: TranscoderFactory =
            Arc::new(|| Err(CodecError::Encode("no encoder".into())));
        let err = TranscodeStage::new(
            session.clone(),
            rx,
            cursor_tx,
            broken,
            Arc::new(PipelineMetrics::new()),
        )
        .spawn()
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, PipelineError::EncoderSetup(_)));
        assert!(err.is_fatal());
        assert_eq!(session.sink().progress().status, SinkStatus::Failed);
    }

    #[tokio::test]
    async fn test_fatal_exit_fails_sink_for_readers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        let session = registry.create().await.unwrap();
        let mut progress = session.sink().subscribe();
        let _held = session.sink().take_writer().unwrap();

        let (tx, rx) = mpsc::channel(1);
        let (cursor_tx, _cursor_rx) = watch::channel(0);
        let handle = TranscodeStage::new(
            session.clone(),
            rx,
            cursor_tx,
            factory(),
            Arc::new(PipelineMetrics::new()),
        )
        .spawn();

        progress
            .wait_for(|p| p.status == SinkStatus::Failed)
            .await
            .unwrap();
        drop(tx);
        assert!(handle.await.unwrap().unwrap_err().is_fatal());
    }
}
