use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use entraflow_core::event::EventBus;
use entraflow_core::types::RunEvent;

/// JSONL run-event logger.
///
/// Reads an EventBus subscription and appends every event to
/// `{log_dir}/{workflow}-{timestamp}.jsonl`, one JSON object per line.
/// Previously written lines survive a crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a RunEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Path of the log file for a workflow started now.
    pub fn log_path(&self, workflow: &str) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        self.log_dir.join(format!("{}-{}.jsonl", workflow, timestamp))
    }

    /// Log every event published on `event_bus` while `run` executes, then
    /// stop the logger. Returns the output of `run` and the log path.
    pub async fn record<T, F>(
        self,
        event_bus: &EventBus,
        label: &str,
        run: F,
    ) -> (T, Option<PathBuf>)
    where
        F: Future<Output = T>,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.run(event_bus.subscribe(), label.to_string(), cancel.clone()));

        let output = run.await;
        // Everything the run published is buffered by now. The logger drains
        // it and stops, even when the run published nothing.
        cancel.cancel();
        let path = match handle.await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "RunLogger task failed");
                None
            }
        };
        (output, path)
    }

    /// Run the logger as a background task.
    ///
    /// Subscribe before spawning so no event is missed. Writes until the
    /// first `RunFinished` event, the bus closing, or cancellation. Events
    /// already buffered when `cancel` fires are still written. Returns the
    /// log path.
    pub async fn run(
        self,
        mut rx: Receiver<RunEvent>,
        workflow: String,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let log_path = self.log_path(&workflow);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Err(e) = write_entry(&mut writer, &event).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if matches!(event, RunEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }
}

async fn write_entry<W>(writer: &mut W, event: &RunEvent) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        event,
    };
    let json = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
    writer.write_all(format!("{}\n", json).as_bytes()).await?;
    // Flush after each entry for crash resilience
    writer.flush().await
}

/// Read back every entry of a JSONL run log.
pub fn read_log(path: &Path) -> std::io::Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use entraflow_core::types::{NodeStatus, RunId, RunStatus};

    #[test]
    fn test_entry_flattens_event() {
        let event = RunEvent::NodeStatusChanged {
            run_id: RunId::from_string("run-1"),
            node_id: "fetch".into(),
            status: NodeStatus::Succeeded,
            attempt: 2,
        };
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            event: &event,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "node_status_changed");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["timestamp"], "2026-02-24T12:00:00Z");
    }

    #[tokio::test]
    async fn test_logger_writes_until_run_finished() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let logger = RunLogger::new(dir.path().to_path_buf());
        let handle = tokio::spawn(logger.run(
            bus.subscribe(),
            "briefing".into(),
            CancellationToken::new(),
        ));

        let run_id = RunId::from_string("run-1");
        bus.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            workflow: "briefing".into(),
            resumed: false,
        });
        bus.publish(RunEvent::RunFinished {
            run_id,
            status: RunStatus::Completed,
        });

        let path = handle.await.unwrap().unwrap();
        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["type"], "run_started");
        assert_eq!(entries[1]["status"], "completed");
    }

    #[tokio::test]
    async fn test_cancel_drains_buffered_events_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let rx = bus.subscribe();

        bus.publish(RunEvent::CancellationRequested {
            run_id: RunId::from_string("run-2"),
        });
        cancel.cancel();

        let logger = RunLogger::new(dir.path().to_path_buf());
        let path = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            logger.run(rx, "nightly".into(), cancel),
        )
        .await
        .expect("logger stops once cancelled")
        .unwrap();

        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["type"], "cancellation_requested");
    }
}
