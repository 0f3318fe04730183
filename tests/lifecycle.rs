//! Lifecycle tests for the experiment engine: polling self-stop,
//! stream cancellation, and state machine transitions, driven by a
//! scripted in-process backend instead of a network server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use routerdash::api::{ByteStream, ExperimentApi};
use routerdash::config::Config;
use routerdash::hub::ExperimentHub;
use routerdash::model::{
    CostEstimate, ExperimentConfig, ExperimentId, ExperimentState, ExperimentStatus,
    MetricsSummary, ParetoData, Progress,
};
use routerdash::runner::ExperimentRunner;
use routerdash::stream::{LogBuffer, LogStreamConsumer};

const ID: ExperimentId = ExperimentId::E1Baselines;

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

type LogSender = mpsc::UnboundedSender<Result<Bytes>>;

#[derive(Default)]
struct FakeBackend {
    run_response: Mutex<Option<Result<ExperimentState>>>,
    /// Status responses popped per poll; the last entry repeats.
    statuses: Mutex<VecDeque<ExperimentState>>,
    status_calls: AtomicUsize,
    stream_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes>>>>,
    all_results: Mutex<Option<HashMap<ExperimentId, ExperimentState>>>,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_run(&self, response: Result<ExperimentState>) {
        *self.run_response.lock().unwrap() = Some(response);
    }

    fn script_statuses(&self, states: Vec<ExperimentState>) {
        *self.statuses.lock().unwrap() = states.into();
    }

    /// Install a log stream fed through the returned sender.
    fn script_stream(&self) -> LogSender {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.stream_rx.lock().unwrap() = Some(rx);
        tx
    }

    fn script_all_results(&self, results: HashMap<ExperimentId, ExperimentState>) {
        *self.all_results.lock().unwrap() = Some(results);
    }

    fn polls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExperimentApi for FakeBackend {
    async fn run_experiment(
        &self,
        _id: ExperimentId,
        _config: &ExperimentConfig,
    ) -> Result<ExperimentState> {
        self.run_response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(anyhow!("no run response scripted")))
    }

    async fn experiment_status(&self, _id: ExperimentId) -> Result<ExperimentState> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.statuses.lock().unwrap();
        if queue.len() > 1 {
            Ok(queue.pop_front().unwrap())
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| anyhow!("no status scripted"))
        }
    }

    async fn open_log_stream(&self, _id: ExperimentId) -> Result<ByteStream> {
        let rx = self
            .stream_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("no stream scripted"))?;
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn all_results(&self) -> Result<HashMap<ExperimentId, ExperimentState>> {
        self.all_results
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no results scripted"))
    }

    async fn cost_estimates(&self) -> Result<Vec<CostEstimate>> {
        Ok(Vec::new())
    }

    async fn metrics(&self) -> Result<MetricsSummary> {
        Err(anyhow!("not used"))
    }

    async fn pareto(&self) -> Result<ParetoData> {
        Err(anyhow!("not used"))
    }

    async fn health(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// State helpers
// ---------------------------------------------------------------------------

fn exp_state(status: ExperimentStatus) -> ExperimentState {
    ExperimentState {
        experiment_id: ID,
        status,
        progress: None,
        started_at: None,
        completed_at: None,
        results: None,
        error: None,
    }
}

fn running_with(current: u64, total: u64) -> ExperimentState {
    let mut state = exp_state(ExperimentStatus::Running);
    state.progress = Some(Progress {
        current,
        total,
        percent: current as f64 / total as f64 * 100.0,
    });
    state
}

fn completed_with(current: u64, total: u64) -> ExperimentState {
    let mut state = running_with(current, total);
    state.status = ExperimentStatus::Completed;
    state.results = Some(serde_json::json!({"gap": 0.8}));
    state
}

fn frame(message: &str) -> Bytes {
    Bytes::from(format!("data: {{\"type\":\"log\",\"message\":\"{}\"}}\n\n", message))
}

fn poll_interval() -> Duration {
    Duration::from_millis(Config::default().poll_interval_ms)
}

// ---------------------------------------------------------------------------
// Runner lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn run_polls_to_completion_then_stops() {
    let api = FakeBackend::new();
    api.script_run(Ok(exp_state(ExperimentStatus::Running)));
    api.script_statuses(vec![
        running_with(1, 10),
        running_with(5, 10),
        completed_with(10, 10),
    ]);
    let _tx = api.script_stream();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    let initial = runner.state();
    assert_eq!(initial.status, ExperimentStatus::Running);
    assert!(initial.progress.is_none());

    sleep(poll_interval() + Duration::from_millis(50)).await;
    assert_eq!(runner.state().progress.unwrap().current, 1);

    sleep(poll_interval()).await;
    assert_eq!(runner.state().progress.unwrap().current, 5);

    sleep(poll_interval()).await;
    let done = runner.state();
    assert_eq!(done.status, ExperimentStatus::Completed);
    assert!(done.results.is_some());
    assert!(done.error.is_none());
    assert_eq!(api.polls(), 3);

    // Terminal status observed: silence over two further intervals.
    sleep(poll_interval() * 2 + Duration::from_millis(50)).await;
    assert_eq!(api.polls(), 3, "polling must cease after terminal status");
}

#[tokio::test(start_paused = true)]
async fn run_transport_failure_forces_failed_without_background_work() {
    let api = FakeBackend::new();
    api.script_run(Err(anyhow!("connection refused")));
    api.script_statuses(vec![running_with(1, 10)]);

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    let state = runner.state();
    assert_eq!(state.status, ExperimentStatus::Failed);
    assert!(state.error.unwrap().contains("connection refused"));
    assert!(state.results.is_none());

    sleep(poll_interval() * 3).await;
    assert_eq!(api.polls(), 0, "no poller may start after a failed start call");
}

#[tokio::test(start_paused = true)]
async fn run_returning_terminal_state_starts_nothing() {
    let api = FakeBackend::new();
    api.script_run(Ok(completed_with(10, 10)));

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    assert_eq!(runner.state().status, ExperimentStatus::Completed);
    sleep(poll_interval() * 3).await;
    assert_eq!(api.polls(), 0, "trivial job finished in the start call itself");
}

#[tokio::test(start_paused = true)]
async fn refresh_recovers_running_job_and_resumes_polling() {
    let api = FakeBackend::new();
    api.script_statuses(vec![
        running_with(3, 10),
        completed_with(10, 10),
    ]);
    let _tx = api.script_stream();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.refresh().await;

    assert_eq!(runner.state().status, ExperimentStatus::Running);
    assert_eq!(api.polls(), 1);

    sleep(poll_interval() + Duration::from_millis(50)).await;
    assert_eq!(runner.state().status, ExperimentStatus::Completed);

    sleep(poll_interval() * 2).await;
    assert_eq!(api.polls(), 2);
}

#[tokio::test(start_paused = true)]
async fn refresh_swallows_transport_errors() {
    let api = FakeBackend::new();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.refresh().await;

    assert_eq!(runner.state().status, ExperimentStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn teardown_stops_polling_and_is_idempotent() {
    let api = FakeBackend::new();
    api.script_run(Ok(exp_state(ExperimentStatus::Running)));
    api.script_statuses(vec![running_with(1, 100)]);
    let _tx = api.script_stream();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    sleep(poll_interval() * 2 + Duration::from_millis(50)).await;
    let seen = api.polls();
    assert!(seen >= 2);

    runner.teardown();
    runner.teardown();

    sleep(poll_interval() * 3).await;
    assert_eq!(api.polls(), seen, "no poll may be issued after teardown");
    assert_eq!(runner.state().status, ExperimentStatus::Running, "teardown freezes the last applied state");
}

// ---------------------------------------------------------------------------
// Log streaming
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stream_lines_reach_logs_and_stop_at_terminal() {
    let api = FakeBackend::new();
    api.script_run(Ok(exp_state(ExperimentStatus::Running)));
    api.script_statuses(vec![running_with(1, 10), completed_with(10, 10)]);
    let tx = api.script_stream();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    tx.send(Ok(frame("A"))).unwrap();
    // Frame split mid-envelope across two deliveries.
    tx.send(Ok(Bytes::from_static(b"data: {\"typ"))).unwrap();
    tx.send(Ok(Bytes::from_static(b"e\":\"log\",\"message\":\"B\"}\n\n")))
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(runner.logs(), vec!["A", "B"]);

    // Second poll applies the terminal status and cancels the stream.
    sleep(poll_interval() * 2 + Duration::from_millis(50)).await;
    assert_eq!(runner.state().status, ExperimentStatus::Completed);

    // The consumer drops the stream on cancellation, so the channel may
    // already be closed; either way no line may be appended.
    let _ = tx.send(Ok(frame("late")));
    sleep(Duration::from_millis(10)).await;
    assert_eq!(runner.logs(), vec!["A", "B"], "no line may land after the run left running");
}

#[tokio::test(start_paused = true)]
async fn clear_logs_keeps_the_stream_attached() {
    let api = FakeBackend::new();
    api.script_run(Ok(exp_state(ExperimentStatus::Running)));
    api.script_statuses(vec![running_with(1, 10)]);
    let tx = api.script_stream();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    tx.send(Ok(frame("first"))).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(runner.logs(), vec!["first"]);

    runner.clear_logs();
    assert!(runner.logs().is_empty());

    tx.send(Ok(frame("second"))).unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(runner.logs(), vec!["second"]);

    runner.teardown();
}

#[tokio::test(start_paused = true)]
async fn tail_cursor_advances_past_buffer_capacity() {
    let api = FakeBackend::new();
    api.script_run(Ok(exp_state(ExperimentStatus::Running)));
    api.script_statuses(vec![running_with(1, 10)]);
    let tx = api.script_stream();

    let cfg = Config {
        log_capacity: 5,
        ..Config::default()
    };
    let mut runner = ExperimentRunner::new(api.clone(), ID, &cfg);
    runner.run(&ExperimentConfig::default()).await;

    for i in 1..=4 {
        tx.send(Ok(frame(&format!("line {}", i)))).unwrap();
    }
    sleep(Duration::from_millis(10)).await;
    let (first, cursor) = runner.logs_since(0);
    assert_eq!(first, vec!["line 1", "line 2", "line 3", "line 4"]);
    assert_eq!(cursor, 4);

    // Push well past capacity: the length stays pinned at 5 but the tail
    // must still surface the newest lines.
    for i in 5..=12 {
        tx.send(Ok(frame(&format!("line {}", i)))).unwrap();
    }
    sleep(Duration::from_millis(10)).await;
    assert_eq!(runner.logs().len(), 5);
    let (second, cursor) = runner.logs_since(cursor);
    assert_eq!(
        second,
        vec!["line 8", "line 9", "line 10", "line 11", "line 12"],
        "lines evicted unread are skipped, not silenced forever"
    );
    assert_eq!(cursor, 12);

    // Clearing drops history without rewinding the cursor.
    runner.clear_logs();
    tx.send(Ok(frame("line 13"))).unwrap();
    sleep(Duration::from_millis(10)).await;
    let (third, _) = runner.logs_since(cursor);
    assert_eq!(third, vec!["line 13"], "clear must not cause reprints");

    runner.teardown();
}

#[tokio::test(start_paused = true)]
async fn cancelled_consumer_discards_in_flight_chunk() {
    let api = FakeBackend::new();
    let tx = api.script_stream();

    let buffer = Arc::new(Mutex::new(LogBuffer::new(1000)));
    let token = CancellationToken::new();
    let consumer = LogStreamConsumer::spawn(
        api.clone() as Arc<dyn ExperimentApi>,
        ID,
        buffer.clone(),
        token,
    );

    // Let the consumer connect and park on the next delivery.
    sleep(Duration::from_millis(10)).await;
    consumer.stop();

    // The chunk resolves only after cancellation.
    tx.send(Ok(frame("ghost"))).unwrap();
    sleep(Duration::from_millis(10)).await;

    assert!(buffer.lock().unwrap().is_empty(), "cancelled stream must not append");
    consumer.stop(); // idempotent
}

#[tokio::test(start_paused = true)]
async fn mid_stream_error_is_swallowed() {
    let api = FakeBackend::new();
    api.script_run(Ok(exp_state(ExperimentStatus::Running)));
    api.script_statuses(vec![running_with(1, 10)]);
    let tx = api.script_stream();

    let mut runner = ExperimentRunner::new(api.clone(), ID, &Config::default());
    runner.run(&ExperimentConfig::default()).await;

    tx.send(Ok(frame("ok"))).unwrap();
    tx.send(Err(anyhow!("connection reset"))).unwrap();
    sleep(Duration::from_millis(10)).await;

    // The stream died but the run is still healthy and polling.
    assert_eq!(runner.logs(), vec!["ok"]);
    assert_eq!(runner.state().status, ExperimentStatus::Running);
    sleep(poll_interval() + Duration::from_millis(50)).await;
    assert!(api.polls() >= 1);

    runner.teardown();
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn hub_keeps_one_runner_per_id_and_refreshes_idle_state() {
    let api = FakeBackend::new();
    let mut results = HashMap::new();
    results.insert(ID, completed_with(10, 10));
    results.insert(ExperimentId::E4Evaluation, {
        let mut s = exp_state(ExperimentStatus::Idle);
        s.experiment_id = ExperimentId::E4Evaluation;
        s
    });
    api.script_all_results(results);

    let mut hub = ExperimentHub::new(api.clone(), Config::default());
    hub.refresh_all().await.unwrap();

    assert_eq!(
        hub.runner(ID).state().status,
        ExperimentStatus::Completed
    );
    assert_eq!(
        hub.runner(ExperimentId::E4Evaluation).state().status,
        ExperimentStatus::Idle
    );

    // Same runner instance on repeat lookup: state persists.
    hub.runner(ID).clear_logs();
    assert_eq!(hub.runner(ID).state().status, ExperimentStatus::Completed);

    hub.teardown_all();
    hub.teardown_all();
}
