//! Chunked artifact transfer between fleet nodes
//!
//! A file travels as `upload-start` / `upload-chunk`* / `upload-end`
//! envelopes over an ordered connection. Chunks carry no positions: delivery
//! order on the single connection is the correctness invariant. There is no
//! retry or resume; a failed transfer restarts from the beginning with a
//! fresh upload id.

pub mod archive;
mod sender;

pub use sender::upload_file;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::UploadStartData;
use crate::{Error, Result};

/// One in-progress upload
#[derive(Debug)]
struct UploadSink {
    file: fs::File,
    path: PathBuf,
}

/// Receiver-side table of open upload sessions
///
/// Sessions are keyed by `(connection id, upload id)`: the same upload id
/// from two different connections is two independent sessions. A session is
/// destroyed the instant its connection closes; a dangling session must not
/// accept further writes.
#[derive(Debug)]
pub struct UploadSessions {
    save_root: PathBuf,
    sessions: Mutex<HashMap<(Uuid, String), UploadSink>>,
}

impl UploadSessions {
    /// Create a session table landing files under `save_root`
    #[must_use]
    pub fn new(save_root: impl Into<PathBuf>) -> Self {
        Self {
            save_root: save_root.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session and return the destination path
    ///
    /// Creates the destination directory recursively under the save root.
    ///
    /// # Errors
    ///
    /// Returns an error if the file name or sub-directory escapes the save
    /// root, or if the destination cannot be created.
    pub async fn start(&self, connection_id: Uuid, request: &UploadStartData) -> Result<PathBuf> {
        let dir = match &request.sub_dir {
            Some(sub) => self.save_root.join(sanitized(sub)?),
            None => self.save_root.clone(),
        };
        fs::create_dir_all(&dir).await?;

        let path = dir.join(sanitized(&request.file_name)?);
        let file = fs::File::create(&path).await?;
        self.sessions.lock().await.insert(
            (connection_id, request.upload_id.clone()),
            UploadSink {
                file,
                path: path.clone(),
            },
        );
        tracing::debug!(upload_id = %request.upload_id, path = %path.display(), "upload session opened");
        Ok(path)
    }

    /// Append one chunk in arrival order
    ///
    /// Chunks for unknown sessions are dropped without a NACK; the protocol
    /// only confirms delivery on the final ack.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk encoding is invalid or the write fails.
    pub async fn chunk(
        &self,
        connection_id: Uuid,
        upload_id: &str,
        chunk_base64: &str,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(sink) = sessions.get_mut(&(connection_id, upload_id.to_string())) else {
            tracing::trace!(upload_id, "chunk for unknown upload session dropped");
            return Ok(());
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(chunk_base64)
            .map_err(|e| Error::Transfer(format!("invalid chunk encoding: {e}")))?;
        sink.file.write_all(&bytes).await?;
        Ok(())
    }

    /// Flush and close a session
    ///
    /// A missing session is a no-op. Returns the destination path when a
    /// session was actually closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub async fn end(&self, connection_id: Uuid, upload_id: &str) -> Result<Option<PathBuf>> {
        let removed = self
            .sessions
            .lock()
            .await
            .remove(&(connection_id, upload_id.to_string()));
        let Some(mut sink) = removed else {
            return Ok(None);
        };
        sink.file.flush().await?;
        tracing::debug!(upload_id, path = %sink.path.display(), "upload session completed");
        Ok(Some(sink.path))
    }

    /// Drop every session owned by a closed connection
    pub async fn remove_for_connection(&self, connection_id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|(conn, _), _| *conn != connection_id);
        let dropped = before - sessions.len();
        if dropped > 0 {
            tracing::debug!(%connection_id, dropped, "dropped upload sessions for closed connection");
        }
    }

    /// Number of currently open sessions
    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Root directory uploads land under
    #[must_use]
    pub fn save_root(&self) -> &Path {
        &self.save_root
    }
}

/// Reject path components that would escape the save root
fn sanitized(raw: &str) -> Result<&str> {
    if raw.is_empty()
        || raw == ".."
        || raw.contains('/')
        || raw.contains('\\')
        || Path::new(raw).is_absolute()
    {
        return Err(Error::Transfer(format!("unsafe path component: {raw:?}")));
    }
    Ok(raw)
}
