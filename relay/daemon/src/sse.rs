//! SSE-style framing for stdout
//!
//! Every frame is written as
//!
//! ```text
//! event: <name>
//! data: <json>
//!
//! ```
//!
//! so the output can be piped into anything that understands server-sent
//! events.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use relay_core::{FlushTrigger, ProgressReport, RegistryStats, StreamId, TokenBatch};

/// A batch as sent to the client
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchFrame {
    /// Owning stream
    pub stream_id: String,
    /// Position in the stream, starting at 1
    pub batch_number: u64,
    /// Tokens in the batch
    pub size: usize,
    /// Why the batch was flushed
    pub trigger: FlushTrigger,
    /// Concatenated token text
    pub content: String,
}

impl BatchFrame {
    /// Build a frame from a batch
    #[must_use]
    pub fn new(stream_id: &StreamId, batch: &TokenBatch) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            batch_number: batch.batch_number(),
            size: batch.size(),
            trigger: batch.trigger(),
            content: batch.content(),
        }
    }
}

/// A progress report tagged with its stream
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressFrame {
    /// Owning stream
    pub stream_id: String,
    /// The report itself
    #[serde(flatten)]
    pub report: ProgressReport,
}

/// End-of-stream summary
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DoneFrame {
    /// Owning stream
    pub stream_id: String,
    /// Tokens generated
    pub tokens: u64,
    /// Batches delivered
    pub batches: u64,
    /// Stopped early by Ctrl+C
    pub interrupted: bool,
    /// Removed from the registry before it finished
    pub evicted: bool,
}

/// One SSE frame
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// `event: batch`
    Batch(BatchFrame),
    /// `event: progress`
    Progress(ProgressFrame),
    /// `event: done`
    Done(DoneFrame),
    /// `event: stats`
    Stats(RegistryStats),
}

impl Frame {
    /// SSE event name
    #[must_use]
    pub fn event(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::Progress(_) => "progress",
            Self::Done(_) => "done",
            Self::Stats(_) => "stats",
        }
    }

    /// Render the frame including the terminating blank line
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> serde_json::Result<String> {
        let data = match self {
            Self::Batch(frame) => serde_json::to_string(frame)?,
            Self::Progress(frame) => serde_json::to_string(frame)?,
            Self::Done(frame) => serde_json::to_string(frame)?,
            Self::Stats(stats) => serde_json::to_string(stats)?,
        };
        Ok(format!("event: {}\ndata: {data}\n\n", self.event()))
    }
}

/// Write frames until every sender is dropped
///
/// Returns the number of frames written.
///
/// # Errors
///
/// Returns an error if a frame cannot be encoded or the output fails.
pub async fn write_frames<W>(mut frames: mpsc::Receiver<Frame>, mut out: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(frame) = frames.recv().await {
        let text = frame
            .encode()
            .with_context(|| format!("Failed to encode {} frame", frame.event()))?;
        out.write_all(text.as_bytes())
            .await
            .context("Failed to write frame")?;
        out.flush().await.context("Failed to flush output")?;
        written += 1;
    }
    tracing::debug!(frames = written, "Frame writer finished");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn done(stream_id: &str) -> Frame {
        Frame::Done(DoneFrame {
            stream_id: stream_id.to_string(),
            tokens: 12,
            batches: 3,
            interrupted: false,
            evicted: false,
        })
    }

    #[test]
    fn test_encode_layout() {
        let text = done("abc").encode().unwrap();
        assert_eq!(
            text,
            "event: done\ndata: {\"stream_id\":\"abc\",\"tokens\":12,\"batches\":3,\
             \"interrupted\":false,\"evicted\":false}\n\n"
        );
    }

    #[test]
    fn test_batch_frame_fields() {
        let frame = Frame::Batch(BatchFrame {
            stream_id: "s".to_string(),
            batch_number: 2,
            size: 2,
            trigger: FlushTrigger::BufferLimit,
            content: "hi there".to_string(),
        });
        let text = frame.encode().unwrap();
        assert!(text.starts_with("event: batch\ndata: {"));
        assert!(text.contains("\"trigger\":\"buffer_limit\""));
        assert!(text.contains("\"content\":\"hi there\""));
        assert!(text.ends_with("}\n\n"));
    }

    #[test]
    fn test_newlines_stay_inside_json() {
        let frame = Frame::Batch(BatchFrame {
            stream_id: "s".to_string(),
            batch_number: 1,
            size: 1,
            trigger: FlushTrigger::Size,
            content: "line one\nline two".to_string(),
        });
        let text = frame.encode().unwrap();
        // Only the header line break, the data line break and the blank line
        assert_eq!(text.matches('\n').count(), 3);
    }

    #[test]
    fn test_stats_event_name() {
        let frame = Frame::Stats(RegistryStats::default());
        assert_eq!(frame.event(), "stats");
        assert!(frame.encode().unwrap().contains("\"total_connections\":0"));
    }

    #[tokio::test]
    async fn test_writer_drains_until_senders_drop() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(done("a")).await.unwrap();
        tx.send(done("b")).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        let written = write_frames(rx, &mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("event: done\n").count(), 2);
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
    }
}
