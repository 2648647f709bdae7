use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use conductor_core::types::{RunEvent, RunId};

/// JSONL run logger.
///
/// Consumes run events and writes one JSON object per line. Lines are
/// flushed as they are written, so a crash mid-run leaves every earlier
/// line intact. Events of nested sub-workflow runs land in their root
/// run's file.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the log file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run summary, 2 = + step results and routes, 3 = + step starts.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events of `run_id` (and the sub-runs it starts) until the run
    /// finishes or `cancel` fires.
    ///
    /// Takes an already subscribed receiver so that no event published
    /// after subscription is missed. On cancellation, queued events are
    /// still drained.
    pub async fn run(self, mut rx: Receiver<RunEvent>, run_id: RunId, cancel: CancellationToken) {
        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut tracked: HashSet<RunId> = HashSet::from([run_id.clone()]);

        loop {
            let event = tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            };

            if let RunEvent::RunStarted {
                run_id: child,
                parent: Some(parent),
                ..
            } = &event
            {
                if tracked.contains(parent) {
                    tracked.insert(child.clone());
                }
            }
            if !tracked.contains(event.run_id()) {
                continue;
            }

            if let Some(entry) = self.event_to_entry(&event) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }

            if matches!(&event, RunEvent::RunFinished { run_id: finished, .. } if *finished == run_id) {
                break;
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a run event to a log line (`None` if filtered by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let timestamp = Utc::now().to_rfc3339();
        let run_id = event.run_id().to_string();

        match event {
            RunEvent::RunStarted {
                parent,
                template,
                depth,
                ..
            } => Some(LogEntry {
                timestamp,
                run_id,
                event_type: "run_started".to_string(),
                step_id: None,
                detail: Some(serde_json::json!({
                    "template": template,
                    "depth": depth,
                    "parent": parent.as_ref().map(|p| p.to_string()),
                })),
            }),
            RunEvent::RunFinished { success, error, .. } => Some(LogEntry {
                timestamp,
                run_id,
                event_type: "run_finished".to_string(),
                step_id: None,
                detail: Some(serde_json::json!({ "success": success, "error": error })),
            }),
            RunEvent::StepFinished { entry, .. } if self.level >= 2 => Some(LogEntry {
                timestamp,
                run_id,
                event_type: (if entry.success { "step_completed" } else { "step_failed" }).to_string(),
                step_id: Some(entry.step_id.clone()),
                detail: Some(serde_json::json!({
                    "kind": entry.kind,
                    "attempt": entry.attempt,
                    "elapsed_ms": entry.elapsed_ms,
                    "output_preview": entry.output.as_deref().map(|o| truncate_str(o, 200)),
                    "error": entry.error,
                })),
            }),
            RunEvent::RouteTaken { from, to, .. } if self.level >= 2 => Some(LogEntry {
                timestamp,
                run_id,
                event_type: "route_taken".to_string(),
                step_id: Some(from.clone()),
                detail: Some(serde_json::json!({ "target": to })),
            }),
            RunEvent::StepStarted {
                step_id, attempt, ..
            } if self.level >= 3 => Some(LogEntry {
                timestamp,
                run_id,
                event_type: "step_started".to_string(),
                step_id: Some(step_id.clone()),
                detail: Some(serde_json::json!({ "attempt": attempt })),
            }),
            _ => None,
        }
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
