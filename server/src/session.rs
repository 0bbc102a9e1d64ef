//! Process-wide session table.
//!
//! Every narration request becomes a [`Session`]: one sink, one state machine
//! and at most one reader. The [`SessionRegistry`] is the only owner of the
//! table; handlers and pipeline stages go through its methods.

use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Generating,
    Transcoding,
    Complete,
    Failed,
    Deleted,
}

impl SessionState {
    /// `Deleted` is reachable from every other state: the retention timer
    /// does not wait for the pipeline to finish.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Generating, Transcoding) | (Generating, Failed) => true,
            (Transcoding, Complete) | (Transcoding, Failed) => true,
            (Deleted, _) => false,
            (_, Deleted) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Generating | SessionState::Transcoding)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Generating,
            1 => SessionState::Transcoding,
            2 => SessionState::Complete,
            3 => SessionState::Failed,
            _ => SessionState::Deleted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Generating => 0,
            SessionState::Transcoding => 1,
            SessionState::Complete => 2,
            SessionState::Failed => 3,
            SessionState::Deleted => 4,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    created: Instant,
    state: AtomicU8,
    consumed: AtomicBool,
    readers: AtomicUsize,
    sink: Sink,
    sentences: AtomicU64,
    gaps: Mutex<Vec<u64>>,
}

/// Read-only view served by `GET /sessions/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
    pub bytes_written: u64,
    pub sentences: u64,
    pub gaps: Vec<u64>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// transition happened.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !SessionState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(session = %self.id, from = ?SessionState::from_u8(current), to = ?next, "session state changed");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Flip `consumed` from false to true. Only the caller that wins gets `true`.
    pub fn mark_consumed(&self) -> bool {
        self.consumed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn record_sentence(&self) {
        self.sentences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self, index: u64) {
        if let Ok(mut gaps) = self.gaps.lock() {
            gaps.push(index);
        }
    }

    pub fn gaps(&self) -> Vec<u64> {
        self.gaps.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state(),
            consumed: self.is_consumed(),
            created_at: self.created_at,
            bytes_written: self.sink.audio_bytes(),
            sentences: self.sentences.load(Ordering::Relaxed),
            gaps: self.gaps(),
        }
    }
}

/// Outcome of a reader trying to attach to a session.
#[derive(Debug)]
pub enum Attach {
    /// First reader; holds the lease for as long as it streams.
    Reader(ReaderLease),
    /// Someone already attached.
    Duplicate,
    /// Nothing to read: the session failed or its sink is gone.
    Unavailable(SessionState),
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    audio_dir: PathBuf,
    active_readers: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(audio_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: DashMap::new(),
            audio_dir: audio_dir.into(),
            active_readers: AtomicUsize::new(0),
        }
    }

    pub fn sink_path(&self, id: &Uuid) -> PathBuf {
        self.audio_dir.join(format!("speech-{id}.mp3"))
    }

    /// Allocate a session in `Generating` together with its sink.
    pub async fn create(&self) -> io::Result<Arc<Session>> {
        let id = Uuid::new_v4();
        let sink = Sink::create(self.sink_path(&id)).await?;
        let session = Arc::new(Session {
            id,
            created_at: Utc::now(),
            created: Instant::now(),
            state: AtomicU8::new(SessionState::Generating.as_u8()),
            consumed: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            sink,
            sentences: AtomicU64::new(0),
            gaps: Mutex::new(Vec::new()),
        });
        self.sessions.insert(id, session.clone());
        debug!(session = %id, path = %session.sink.path().display(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// `false` when the id is unknown or another caller already won.
    pub fn mark_consumed(&self, id: &Uuid) -> bool {
        self.get(id).map(|s| s.mark_consumed()).unwrap_or(false)
    }

    /// `None` when the id is unknown.
    pub fn attach_reader(self: &Arc<Self>, id: &Uuid) -> Option<Attach> {
        let session = self.get(id)?;
        let state = session.state();
        if matches!(state, SessionState::Failed | SessionState::Deleted) {
            return Some(Attach::Unavailable(state));
        }
        if !session.mark_consumed() {
            return Some(Attach::Duplicate);
        }

        session.readers.fetch_add(1, Ordering::SeqCst);
        self.active_readers.fetch_add(1, Ordering::Relaxed);
        Some(Attach::Reader(ReaderLease {
            session,
            registry: self.clone(),
        }))
    }

    pub fn active_readers(&self) -> usize {
        self.active_readers.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove the session's sink once `after` has elapsed since creation,
    /// whatever state the session is in by then.
    pub fn schedule_deletion(self: &Arc<Self>, id: Uuid, after: Duration) {
        let Some(session) = self.get(&id) else {
            return;
        };
        let deadline = session.created + after;
        drop(session);

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            registry.delete(&id);
        });
    }

    /// Remove the sink and mark the session `Deleted`. The table entry goes
    /// away now, or when the last reader lets go.
    pub fn delete(&self, id: &Uuid) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };

        let was = session.state();
        if let Err(e) = session.sink.remove() {
            warn!(session = %id, "failed to remove sink {}: {e}", session.sink.path().display());
        }
        session.transition(SessionState::Deleted);
        if was.is_active() {
            warn!(session = %id, state = ?was, "retention expired while the session was still running");
        }

        if session.readers.load(Ordering::SeqCst) == 0 {
            self.sessions.remove(id);
        }
        info!(session = %id, "session deleted");
        true
    }

    fn release(&self, session: &Session) {
        session.readers.fetch_sub(1, Ordering::SeqCst);
        self.active_readers.fetch_sub(1, Ordering::Relaxed);
        if session.state() == SessionState::Deleted && session.readers.load(Ordering::SeqCst) == 0
        {
            self.sessions.remove(&session.id);
        }
    }
}

/// Held by the one reader of a session. Dropping it detaches the reader.
#[derive(Debug)]
pub struct ReaderLease {
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
}

impl ReaderLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.registry.release(&self.session);
        debug!(session = %self.session.id, "reader detached");
    }
}
