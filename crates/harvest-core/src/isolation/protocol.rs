//! Wire format between a worker process and its supervisor.
//!
//! Newline-delimited JSON over the child's stdin/stdout. The child sends
//! [`WorkerMessage`]s; the supervisor answers every `pull` with exactly one
//! [`Pull`]. `complete` and `fail` get no reply. Children must log to stderr.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AppError;
use crate::operation::Completion;
use crate::task::TaskId;

pub use crate::worker::Pull as SupervisorMessage;

/// Child → supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Pull { timeout_ms: u64 },
    Complete { task_id: TaskId, completion: Completion },
    Fail { task_id: TaskId, error: String },
}

/// Write one message followed by a newline, and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. `Ok(None)` means the peer closed the stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, AppError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed).map(Some).map_err(|e| {
            AppError::ProtocolError(format!("invalid message {trimmed:?}: {e}"))
        });
    }
}
