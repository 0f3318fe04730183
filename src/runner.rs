use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::ExperimentApi;
use crate::config::Config;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{ExperimentConfig, ExperimentId, ExperimentState, ExperimentStatus};
use crate::poller::StatusPoller;
use crate::stream::{LogBuffer, LogStreamConsumer};

/// Per-experiment lifecycle state machine: idle → running → {completed,
/// failed}, with no automatic return to idle.
///
/// The runner is the exclusive owner of its poller and consumer; at most
/// one of each is live at a time, and starting a new run replaces (never
/// stacks) prior background work. State and log buffer are behind mutexes
/// only so background tasks can write them; every external reader gets a
/// cloned snapshot.
pub struct ExperimentRunner {
    api: Arc<dyn ExperimentApi>,
    id: ExperimentId,
    poll_interval: Duration,
    log_capacity: usize,
    state: Arc<Mutex<ExperimentState>>,
    logs: Arc<Mutex<LogBuffer>>,
    poller: Option<StatusPoller>,
    consumer: Option<LogStreamConsumer>,
}

impl ExperimentRunner {
    pub fn new(api: Arc<dyn ExperimentApi>, id: ExperimentId, cfg: &Config) -> Self {
        Self {
            api,
            id,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            log_capacity: cfg.log_capacity,
            state: Arc::new(Mutex::new(ExperimentState::initial(id))),
            logs: Arc::new(Mutex::new(LogBuffer::new(cfg.log_capacity))),
            poller: None,
            consumer: None,
        }
    }

    pub fn id(&self) -> ExperimentId {
        self.id
    }

    /// Immutable snapshot of the current lifecycle state.
    pub fn state(&self) -> ExperimentState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| ExperimentState::initial(self.id))
    }

    /// Immutable snapshot of the buffered log lines, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().map(|b| b.snapshot()).unwrap_or_default()
    }

    /// Log lines appended after `cursor`, plus the cursor for the next
    /// call. The cursor is the buffer's running append count, not an
    /// index, so tailing keeps advancing after the buffer saturates and
    /// `clear_logs` never causes a reprint; lines evicted before being
    /// read are skipped.
    pub fn logs_since(&self, cursor: u64) -> (Vec<String>, u64) {
        match self.logs.lock() {
            Ok(buf) => {
                let total = buf.total_appended();
                let fresh = total.saturating_sub(cursor).min(buf.len() as u64) as usize;
                let snap = buf.snapshot();
                let lines = snap[snap.len() - fresh..].to_vec();
                (lines, total)
            }
            Err(_) => (Vec::new(), cursor),
        }
    }

    /// Empty the log buffer without touching the connection.
    pub fn clear_logs(&self) {
        if let Ok(mut buf) = self.logs.lock() {
            buf.clear();
        }
    }

    /// Start the experiment. On success the server's returned state
    /// replaces the local one and, unless the job already finished,
    /// polling and log streaming begin. On transport failure the local
    /// state is forced to failed and no background work starts.
    pub async fn run(&mut self, config: &ExperimentConfig) {
        self.stop_background();
        match self.api.run_experiment(self.id, config).await {
            Ok(next) => {
                let resume = next.is_running();
                self.replace_state(next);
                log(
                    Level::Info,
                    Domain::Runner,
                    "started",
                    obj(&[("experiment", v_str(self.id.as_str()))]),
                );
                if resume {
                    self.start_background();
                }
            }
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Runner,
                    "start_failed",
                    obj(&[
                        ("experiment", v_str(self.id.as_str())),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
                if let Ok(mut state) = self.state.lock() {
                    state.status = ExperimentStatus::Failed;
                    state.error = Some(format!("{:#}", err));
                    state.results = None;
                }
            }
        }
    }

    /// One-shot status fetch used at mount/reload to recover an
    /// already-running job. Errors are swallowed: an unreachable backend
    /// at startup is not a failed experiment.
    pub async fn refresh(&mut self) {
        match self.api.experiment_status(self.id).await {
            Ok(next) => {
                let resume = next.is_running();
                self.replace_state(next);
                if resume {
                    self.start_background();
                }
            }
            Err(err) => {
                log(
                    Level::Debug,
                    Domain::Runner,
                    "refresh_failed",
                    obj(&[
                        ("experiment", v_str(self.id.as_str())),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
            }
        }
    }

    /// Unconditionally stop polling and streaming. Idempotent; no update
    /// lands after this returns.
    pub fn teardown(&mut self) {
        self.stop_background();
    }

    /// Replace the state wholesale without touching background tasks.
    /// Responses always land as full replacements, never field patches.
    pub fn replace_state(&self, next: ExperimentState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    fn start_background(&mut self) {
        self.stop_background();
        // Fresh buffer per run: the previous run's tail is not this run's
        // history.
        self.logs = Arc::new(Mutex::new(LogBuffer::new(self.log_capacity)));
        let stream_token = CancellationToken::new();
        self.consumer = Some(LogStreamConsumer::spawn(
            self.api.clone(),
            self.id,
            self.logs.clone(),
            stream_token.clone(),
        ));
        // The poller cancels the stream the instant it applies a terminal
        // status.
        self.poller = Some(StatusPoller::spawn(
            self.api.clone(),
            self.id,
            self.state.clone(),
            self.poll_interval,
            stream_token,
        ));
    }

    fn stop_background(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.stop();
        }
    }
}

impl Drop for ExperimentRunner {
    fn drop(&mut self) {
        self.stop_background();
    }
}
