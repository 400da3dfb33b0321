//! Durable event sink.
//!
//! The bus treats the store as best-effort: append failures are logged and
//! swallowed so observability can never take down the pipeline it observes.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::events::Event;

/// Append-only persistent event log with bounded replay reads.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event record.
    async fn append(&self, event: &Event) -> Result<()>;

    /// Read the newest `limit` events, oldest first.
    async fn read_last(&self, limit: usize) -> Result<Vec<Event>>;

    /// Read every event with `sequence > since`, oldest first.
    async fn read_since(&self, since: u64) -> Result<Vec<Event>>;
}

/// Line-delimited JSON log on the local filesystem.
///
/// Rotation and retention are an external concern; this store only ever
/// appends.
pub struct JsonlEventStore {
    path: PathBuf,
    // Held open across appends; reset to None after a write error so the next
    // append reopens the file.
    file: Mutex<Option<tokio::fs::File>>,
}

impl std::fmt::Debug for JsonlEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlEventStore")
            .field("path", &self.path)
            .finish()
    }
}

impl JsonlEventStore {
    /// Store backed by the file at `path`; the file is created on first
    /// append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    async fn read_all(&self) -> Result<Vec<Event>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    // Torn writes from a crash leave a partial trailing line;
                    // skip rather than refuse the whole log.
                    tracing::debug!(
                        target: "conveyor::bus",
                        error = %err,
                        "skipping unparseable event log line"
                    );
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, event: &Event) -> Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let file = guard
            .as_mut()
            .ok_or_else(|| crate::error::ConveyorError::Internal("event log file lost".into()))?;
        if let Err(err) = file.write_all(&line).await {
            *guard = None;
            return Err(err.into());
        }
        if let Err(err) = file.flush().await {
            *guard = None;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_last(&self, limit: usize) -> Result<Vec<Event>> {
        let mut events = self.read_all().await?;
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    async fn read_since(&self, since: u64) -> Result<Vec<Event>> {
        let events = self.read_all().await?;
        Ok(events
            .into_iter()
            .filter(|event| event.sequence > since)
            .collect())
    }
}

/// Store that persists nothing, for deployments that only want the live feed.
#[derive(Debug, Default)]
pub struct NullEventStore;

#[async_trait]
impl EventStore for NullEventStore {
    async fn append(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn read_last(&self, _limit: usize) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn read_since(&self, _since: u64) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventDraft, EventKind, EventSource};
    use crate::ids::RunId;
    use chrono::Utc;

    fn event(sequence: u64, run_id: RunId) -> Event {
        let draft = EventDraft::new(run_id, EventSource::Pipeline, EventKind::Log)
            .with_message(format!("event {sequence}"));
        Event {
            sequence,
            run_id: draft.run_id,
            source: draft.source,
            kind: draft.kind,
            timestamp: Utc::now(),
            message: draft.message,
            data: draft.data,
        }
    }

    #[tokio::test]
    async fn append_then_read_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlEventStore::new(dir.path().join("events.jsonl"));
        let run_id = RunId::new();

        for sequence in 1..=5 {
            store.append(&event(sequence, run_id)).await.expect("append");
        }

        let all = store.read_last(100).await.expect("read_last");
        assert_eq!(
            all.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );

        let tail = store.read_last(2).await.expect("read_last tail");
        assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);

        let since = store.read_since(3).await.expect("read_since");
        assert_eq!(since.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonlEventStore::new(dir.path().join("absent.jsonl"));
        assert!(store.read_last(10).await.expect("read_last").is_empty());
        assert!(store.read_since(0).await.expect("read_since").is_empty());
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let store = JsonlEventStore::new(&path);
        let run_id = RunId::new();

        store.append(&event(1, run_id)).await.expect("append");
        store.append(&event(2, run_id)).await.expect("append");

        // Simulate a crash mid-write.
        let mut raw = tokio::fs::read_to_string(&path).await.expect("read");
        raw.push_str("{\"sequence\":3,\"run_id\"");
        tokio::fs::write(&path, raw).await.expect("write");

        let all = store.read_last(10).await.expect("read_last");
        assert_eq!(all.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }
}
