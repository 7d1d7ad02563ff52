use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use vendflow_core::types::WorkflowEvent;

/// JSONL run logger.
///
/// Consumes workflow events and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Every line is flushed as it is written, so a
/// crashed process leaves a readable prefix behind.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=per-stage, 3=per-attempt.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write events until cancellation or until the bus closes.
    ///
    /// Subscribe before starting the execution so no event is missed.
    pub async fn run(self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), "RunLogger started");

        let mut writers: HashMap<String, BufWriter<tokio::fs::File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => self.write(&mut writers, &event).await,
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                            // A skipped terminal event would keep its writer open.
                            close_all(&mut writers).await;
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        close_all(&mut writers).await;
        debug!("RunLogger finished");
    }

    async fn write(
        &self,
        writers: &mut HashMap<String, BufWriter<tokio::fs::File>>,
        event: &WorkflowEvent,
    ) {
        let Some(entry) = self.event_to_entry(event) else {
            return;
        };
        let run_id = event.run_id().to_string();

        if !writers.contains_key(&run_id) {
            let path = self.log_path(&run_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    writers.insert(run_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open log file");
                    return;
                }
            }
        }
        let Some(writer) = writers.get_mut(&run_id) else {
            return;
        };

        if let Ok(json) = serde_json::to_string(&entry) {
            let line = format!("{}\n", json);
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write log entry");
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush log");
            }
        }

        if event.is_terminal() {
            writers.remove(&run_id);
        }
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, stage: Option<&String>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type: event_type.to_string(),
            stage: stage.cloned(),
            detail,
        };

        match event {
            // L1: run summary
            WorkflowEvent::RunStarted { .. } => Some(entry("run_started", None, None)),
            WorkflowEvent::RunCompleted {
                verification_id,
                outcome,
                stored,
                ..
            } => Some(entry(
                "run_completed",
                None,
                Some(serde_json::json!({
                    "verification_id": verification_id,
                    "outcome": outcome,
                    "stored": stored,
                })),
            )),
            WorkflowEvent::RunAborted { error, .. } => Some(entry(
                "run_aborted",
                None,
                Some(serde_json::json!({ "error": error })),
            )),
            WorkflowEvent::StageFailed { stage, error, .. } => Some(entry(
                "stage_failed",
                Some(stage),
                Some(serde_json::json!({ "error": error })),
            )),
            WorkflowEvent::DeadlineExceeded { stage, .. } => {
                Some(entry("deadline_exceeded", Some(stage), None))
            }

            // L2: per-stage
            WorkflowEvent::StageStarted { stage, .. } if self.level >= 2 => {
                Some(entry("stage_started", Some(stage), None))
            }
            WorkflowEvent::StageCompleted {
                stage, elapsed_ms, ..
            } if self.level >= 2 => Some(entry(
                "stage_completed",
                Some(stage),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            )),

            // L3: per-attempt
            WorkflowEvent::StageRetried {
                stage,
                attempt,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "stage_retried",
                Some(stage),
                Some(serde_json::json!({ "attempt": attempt, "error": error })),
            )),

            _ => None,
        }
    }
}

/// Flush and drop every open writer. Later events reopen their file in
/// append mode.
async fn close_all(writers: &mut HashMap<String, BufWriter<tokio::fs::File>>) {
    for (_, mut writer) in writers.drain() {
        writer.flush().await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vendflow_core::error::TaskError;
    use vendflow_core::types::ExecutionOutcome;
    use vendflow_core::EventBus;

    fn started(run_id: &str, stage: &str) -> WorkflowEvent {
        WorkflowEvent::StageStarted {
            run_id: run_id.into(),
            stage: stage.into(),
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = RunLogger::new("/tmp", 1);
        let entry = logger
            .event_to_entry(&WorkflowEvent::RunStarted {
                run_id: "r1".into(),
            })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run_started"));
        assert!(!json.contains("stage"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let retried = WorkflowEvent::StageRetried {
            run_id: "r".into(),
            stage: "ExecuteTurn1".into(),
            attempt: 1,
            error: TaskError::throttled("invoke_bedrock", "slow down"),
        };

        let logger = RunLogger::new("/tmp", 1);
        assert!(logger.event_to_entry(&started("r", "FetchImages")).is_none());
        assert!(logger.event_to_entry(&retried).is_none());

        let logger2 = RunLogger::new("/tmp", 2);
        assert!(logger2.event_to_entry(&started("r", "FetchImages")).is_some());
        assert!(logger2.event_to_entry(&retried).is_none());

        let logger3 = RunLogger::new("/tmp", 3);
        assert!(logger3.event_to_entry(&retried).is_some());
    }

    #[tokio::test]
    async fn test_writes_one_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(dir.path(), 2);
        let path_a = logger.log_path("run-a");
        let path_b = logger.log_path("run-b");

        let bus = EventBus::default();
        let rx = bus.subscribe();
        bus.publish(WorkflowEvent::RunStarted {
            run_id: "run-a".into(),
        });
        bus.publish(started("run-b", "Initialize"));
        bus.publish(started("run-a", "Initialize"));
        bus.publish(WorkflowEvent::RunCompleted {
            run_id: "run-a".into(),
            verification_id: Some("verif-1".into()),
            outcome: ExecutionOutcome::Completed,
            stored: true,
        });
        drop(bus);

        logger.run(rx, CancellationToken::new()).await;

        let a = std::fs::read_to_string(path_a).unwrap();
        let lines: Vec<&str> = a.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["event_type"], "run_completed");
        assert_eq!(last["detail"]["outcome"], "COMPLETED");

        let b = std::fs::read_to_string(path_b).unwrap();
        assert_eq!(b.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_lag_releases_open_writers() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(dir.path(), 2);
        let mut writers = HashMap::new();

        logger.write(&mut writers, &started("run-a", "Initialize")).await;
        logger.write(&mut writers, &started("run-b", "Initialize")).await;
        assert_eq!(writers.len(), 2);

        close_all(&mut writers).await;
        assert!(writers.is_empty());

        logger.write(&mut writers, &started("run-a", "FetchImages")).await;
        close_all(&mut writers).await;
        let a = std::fs::read_to_string(logger.log_path("run-a")).unwrap();
        assert_eq!(a.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_lagged_receiver_keeps_logging() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(dir.path(), 2);
        let path = logger.log_path("run-a");

        let (tx, rx) = tokio::sync::broadcast::channel(2);
        for stage in ["Initialize", "FetchImages", "PrepareSystemPrompt", "InitializeConversationState"] {
            tx.send(started("run-a", stage)).unwrap();
        }
        drop(tx);

        logger.run(rx, CancellationToken::new()).await;

        let log = std::fs::read_to_string(path).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("InitializeConversationState"));
    }
}
