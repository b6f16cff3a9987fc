use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::AppResult;

const PROGRESS_FILE_NAME: &str = "progress.jsonl";

#[derive(Debug, Default)]
struct StageState {
    name: String,
    total_estimate: Option<u64>,
    processed: u64,
}

/// Tracks stage progress, logs every `log_every` steps and, when a sink is
/// configured, appends queued events to `progress.jsonl` in batches.
pub struct ProgressReporter {
    log_every: u64,
    stage: Mutex<StageState>,
    sink: Option<ProgressSink>,
}

struct ProgressSink {
    path: PathBuf,
    batch_size: usize,
    queue: Mutex<Vec<ProgressEvent>>,
}

#[derive(Debug, Serialize)]
pub struct ProgressEvent {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub payload: Value,
}

impl ProgressReporter {
    pub fn new(log_every: u64) -> Self {
        Self {
            log_every: log_every.max(1),
            stage: Mutex::new(StageState::default()),
            sink: None,
        }
    }

    pub fn with_sink<P: AsRef<Path>>(output_dir: P, log_every: u64, batch_size: usize) -> AppResult<Self> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(PROGRESS_FILE_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            sink: Some(ProgressSink {
                path,
                batch_size: batch_size.max(1),
                queue: Mutex::new(Vec::new()),
            }),
            ..Self::new(log_every)
        })
    }

    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|sink| sink.path.as_path())
    }

    pub fn set_stage(&self, name: &str, total_estimate: Option<u64>) {
        {
            let mut stage = self.stage.lock();
            *stage = StageState {
                name: name.to_string(),
                total_estimate,
                processed: 0,
            };
        }
        info!(target: "progress", stage = name, total_estimate, "stage started");
        self.record_or_warn("stage", json!({"stage": name, "total_estimate": total_estimate}));
    }

    pub fn advance(&self) {
        let mut stage = self.stage.lock();
        stage.processed += 1;
        if stage.processed % self.log_every == 0 {
            info!(
                target: "progress",
                stage = %stage.name,
                processed = stage.processed,
                total_estimate = stage.total_estimate,
                "stage progress"
            );
        }
    }

    pub fn processed(&self) -> u64 {
        self.stage.lock().processed
    }

    pub fn stage(&self) -> String {
        self.stage.lock().name.clone()
    }

    /// Queues an event; the queue is written once it reaches the batch size.
    pub fn record(&self, event: impl Into<String>, payload: Value) -> AppResult<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let mut queue = sink.queue.lock();
        queue.push(ProgressEvent {
            ts: Utc::now(),
            event: event.into(),
            payload,
        });
        if queue.len() >= sink.batch_size {
            sink.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    /// Progress output never fails a run.
    pub fn record_or_warn(&self, event: &str, payload: Value) {
        if let Err(err) = self.record(event, payload) {
            warn!(?err, event, "failed to record progress event");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        match &self.sink {
            Some(sink) => {
                let mut queue = sink.queue.lock();
                sink.persist_locked(&mut queue)
            }
            None => Ok(()),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.sink
            .as_ref()
            .map(|sink| sink.queue.lock().len())
            .unwrap_or(0)
    }
}

impl ProgressSink {
    fn persist_locked(&self, queue: &mut Vec<ProgressEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::with_capacity(queue.len());
        for event in queue.iter() {
            lines.push(serde_json::to_vec(event)?);
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }
}
