use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStatus {
    Started,
    Running,
    Finished,
    Failed,
}

impl PreloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PreloadStatus::Finished | PreloadStatus::Failed)
    }
}

impl fmt::Display for PreloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PreloadStatus::Started => "started",
            PreloadStatus::Running => "running",
            PreloadStatus::Finished => "finished",
            PreloadStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One progress notification for a data id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadState {
    pub data_id: String,
    pub status: PreloadStatus,
    pub progress: f64,
    pub message: String,
}

pub trait ProgressSink: Send + Sync {
    fn notify(&self, state: &PreloadState);
}

/// Used when `silent` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn notify(&self, _state: &PreloadState) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn notify(&self, state: &PreloadState) {
        info!(
            data_id = %state.data_id,
            status = %state.status,
            progress = state.progress,
            message = %state.message,
            "preload progress"
        );
    }
}

/// Forwards every notification over a channel; a closed receiver is ignored.
pub struct ChannelProgress {
    sender: Mutex<Sender<PreloadState>>,
}

impl ChannelProgress {
    pub fn new(sender: Sender<PreloadState>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressSink for ChannelProgress {
    fn notify(&self, state: &PreloadState) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(state.clone());
        }
    }
}

/// Latest state per data id, shared between the worker and the handle.
#[derive(Debug, Default, Clone)]
pub struct StateBoard {
    states: Arc<Mutex<BTreeMap<String, PreloadState>>>,
}

impl StateBoard {
    pub fn snapshot(&self) -> Vec<PreloadState> {
        self.states
            .lock()
            .map(|states| states.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, data_id: &str) -> Option<PreloadState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(data_id).cloned())
    }
}

impl ProgressSink for StateBoard {
    fn notify(&self, state: &PreloadState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(state.data_id.clone(), state.clone());
        }
    }
}

pub struct FanOut(pub Vec<Arc<dyn ProgressSink>>);

impl ProgressSink for FanOut {
    fn notify(&self, state: &PreloadState) {
        for sink in &self.0 {
            sink.notify(state);
        }
    }
}

/// Emits the notifications of one preload run, never letting the reported
/// progress go backwards.
pub struct ProgressReporter<'a> {
    data_id: String,
    sink: &'a dyn ProgressSink,
    last: f64,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(data_id: &str, sink: &'a dyn ProgressSink) -> Self {
        Self {
            data_id: data_id.to_string(),
            sink,
            last: 0.0,
        }
    }

    pub fn progress(&self) -> f64 {
        self.last
    }

    fn emit(&mut self, status: PreloadStatus, progress: f64, message: &str) {
        let progress = progress.clamp(self.last, 1.0);
        self.last = progress;
        self.sink.notify(&PreloadState {
            data_id: self.data_id.clone(),
            status,
            progress,
            message: message.to_string(),
        });
    }

    pub fn started(&mut self, message: &str) {
        self.emit(PreloadStatus::Started, 0.0, message);
    }

    pub fn running(&mut self, progress: f64, message: &str) {
        self.emit(PreloadStatus::Running, progress, message);
    }

    pub fn finished(&mut self, message: &str) {
        self.emit(PreloadStatus::Finished, 1.0, message);
    }

    pub fn failed(&mut self, message: &str) {
        let last = self.last;
        self.emit(PreloadStatus::Failed, last, message);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn reporter_never_goes_backwards() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelProgress::new(tx);
        let mut reporter = ProgressReporter::new("FLUXCOM-X-BASE_NEE", &sink);
        reporter.started("Download in progress");
        reporter.running(0.6, "Prepare data");
        reporter.running(0.3, "late update");
        reporter.failed("boom");
        drop(reporter);
        drop(sink);

        let states = rx.iter().collect::<Vec<_>>();
        let progress = states.iter().map(|s| s.progress).collect::<Vec<_>>();
        assert_eq!(progress, vec![0.0, 0.6, 0.6, 0.6]);
        assert_eq!(states[3].status, PreloadStatus::Failed);
    }

    #[test]
    fn board_keeps_latest_state() {
        let board = StateBoard::default();
        let mut reporter = ProgressReporter::new("FLUXCOM-X-BASE_GPP", &board);
        reporter.started("Download in progress");
        reporter.finished("Preload finished");
        let state = board.get("FLUXCOM-X-BASE_GPP").unwrap();
        assert_eq!(state.status, PreloadStatus::Finished);
        assert_eq!(state.progress, 1.0);
        assert_eq!(board.snapshot().len(), 1);
    }
}
