//! Append-only audio file with change notification.
//!
//! A [`Sink`] is the on-disk destination of one session's encoded audio. It
//! hands out exactly one [`SinkWriter`]; every append and every status change
//! is published on a `watch` channel so tailing readers wake up immediately
//! instead of polling the file.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tokio::sync::watch;

/// Empty ID3v2.4 tag. Written first so the file on disk is a regular `.mp3`;
/// readers start after it and receive bare MPEG frames.
pub const SINK_HEADER: [u8; 10] = [b'I', b'D', b'3', 4, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// The writer may still append.
    Open,
    /// Closed for writing; everything up to `written` is final.
    Finished,
    /// The session failed; readers must stop.
    Failed,
    /// The file has been removed.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkProgress {
    /// File length in bytes, header included.
    pub written: u64,
    pub status: SinkStatus,
}

#[derive(Debug)]
pub struct Sink {
    path: PathBuf,
    progress: watch::Sender<SinkProgress>,
    file: Mutex<Option<File>>,
}

impl Sink {
    /// Create the file and write the header.
    pub async fn create(path: PathBuf) -> io::Result<Self> {
        let mut file = tokio::fs::File::create(&path).await?.into_std().await;
        let path_for_write = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            file.write_all(&SINK_HEADER)?;
            file.flush()?;
            Ok::<_, io::Error>(file)
        })
        .await
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("sink setup for {} panicked: {e}", path_for_write.display()),
            )
        })??;

        let (progress, _) = watch::channel(SinkProgress {
            written: SINK_HEADER.len() as u64,
            status: SinkStatus::Open,
        });

        Ok(Self {
            path,
            progress,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The single writer. Later calls return `None`.
    pub fn take_writer(&self) -> Option<SinkWriter<'_>> {
        let file = self.file.lock().ok()?.take()?;
        Some(SinkWriter { file, sink: self })
    }

    pub fn subscribe(&self) -> watch::Receiver<SinkProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> SinkProgress {
        *self.progress.borrow()
    }

    /// Bytes of encoded audio appended so far, header excluded.
    pub fn audio_bytes(&self) -> u64 {
        self.progress().written - SINK_HEADER.len() as u64
    }

    /// Stop readers. A deleted sink stays deleted.
    pub fn fail(&self) {
        self.progress.send_if_modified(|p| match p.status {
            SinkStatus::Open | SinkStatus::Finished => {
                p.status = SinkStatus::Failed;
                true
            }
            SinkStatus::Failed | SinkStatus::Deleted => false,
        });
    }

    /// Remove the backing file and tell readers it is gone.
    pub fn remove(&self) -> io::Result<()> {
        let result = match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        self.progress.send_if_modified(|p| {
            let changed = p.status != SinkStatus::Deleted;
            p.status = SinkStatus::Deleted;
            changed
        });
        result
    }
}

/// Exclusive, append-only handle to a [`Sink`]. Blocking I/O.
pub struct SinkWriter<'a> {
    file: File,
    sink: &'a Sink,
}

impl SinkWriter<'_> {
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.file.write_all(bytes)?;
        self.file.flush()?;
        self.sink
            .progress
            .send_modify(|p| p.written += bytes.len() as u64);
        Ok(())
    }

    /// Close for writing. Has no effect on a failed or deleted sink.
    pub fn finish(mut self) -> io::Result<()> {
        self.file.flush()?;
        self.sink.progress.send_if_modified(|p| {
            if p.status == SinkStatus::Open {
                p.status = SinkStatus::Finished;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}
