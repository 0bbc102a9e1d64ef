//! Tailing reads of a sink that may still be growing.

use std::io::{self, SeekFrom};

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::session::ReaderLease;
use crate::sink::{SinkStatus, SINK_HEADER};

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Absolute file position of payload byte `offset`, if it fits in a `u64`.
pub fn start_position(offset: u64) -> Option<u64> {
    (SINK_HEADER.len() as u64).checked_add(offset)
}

/// Stream the sink behind `lease`, starting `offset` bytes past the header.
///
/// Reads whatever has been appended, then waits for the writer to append
/// more. Ends once the sink is finished and fully read, or as soon as it
/// fails or is deleted. Dropping the stream releases the lease.
pub fn tail_sink(lease: ReaderLease, offset: u64) -> impl Stream<Item = io::Result<Bytes>> + Send {
    async_stream::try_stream! {
        let session = lease.session().clone();
        let sink = session.sink();
        let mut progress = sink.subscribe();
        let mut position = start_position(offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("offset {offset} out of range"))
        })?;

        let mut file = tokio::fs::File::open(sink.path()).await?;
        file.seek(SeekFrom::Start(position)).await?;
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut sent = 0u64;

        loop {
            let snapshot = *progress.borrow_and_update();
            if matches!(snapshot.status, SinkStatus::Failed | SinkStatus::Deleted) {
                debug!(session = %session.id(), status = ?snapshot.status, sent, "sink closed under reader");
                break;
            }

            if position < snapshot.written {
                let want = (snapshot.written - position).min(buf.len() as u64) as usize;
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    // file shorter than reported, e.g. removed and recreated
                    break;
                }
                position += n as u64;
                sent += n as u64;
                yield Bytes::copy_from_slice(&buf[..n]);
                continue;
            }

            if snapshot.status == SinkStatus::Finished {
                debug!(session = %session.id(), sent, "reader reached end of sink");
                break;
            }
            if progress.changed().await.is_err() {
                break;
            }
        }

        drop(lease);
    }
}
