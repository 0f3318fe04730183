use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::ExperimentApi;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{MetricsSummary, ParetoData};

/// Display snapshot for the dashboard header. Replaced wholesale on each
/// refresh; there are no merge semantics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub metrics: Option<MetricsSummary>,
    pub pareto: Option<ParetoData>,
    pub error: Option<String>,
    pub refreshed_at: Option<String>,
}

/// Dashboard-wide pull-and-replace reader for `/metrics` and
/// `/metrics/pareto`. The Pareto sweep is optional: when its fetch fails
/// the snapshot simply reports it unavailable, without blocking or
/// erroring the metrics value.
pub struct MetricsAggregator {
    snapshot: Arc<Mutex<MetricsSnapshot>>,
    token: CancellationToken,
}

impl MetricsAggregator {
    pub fn spawn(api: Arc<dyn ExperimentApi>, interval: Duration) -> Self {
        let snapshot = Arc::new(Mutex::new(MetricsSnapshot::default()));
        let token = CancellationToken::new();
        tokio::spawn(refresh_loop(api, snapshot.clone(), interval, token.clone()));
        Self { snapshot, token }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Cancel the refresh timer. Idempotent; no update lands afterward.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

async fn refresh_loop(
    api: Arc<dyn ExperimentApi>,
    snapshot: Arc<Mutex<MetricsSnapshot>>,
    interval: Duration,
    token: CancellationToken,
) {
    // First tick fires immediately so the dashboard is not empty for a
    // full interval after startup.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let (metrics, pareto) = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            fetched = fetch_both(api.as_ref()) => fetched,
        };
        if token.is_cancelled() {
            return;
        }
        if let Ok(mut snap) = snapshot.lock() {
            match metrics {
                Ok(summary) => {
                    snap.metrics = Some(summary);
                    snap.pareto = pareto;
                    snap.error = None;
                    snap.refreshed_at = Some(crate::logging::ts_now());
                }
                Err(err) => {
                    // Keep the previous values on screen; only flag the
                    // staleness.
                    snap.error = Some(format!("{:#}", err));
                    log(
                        Level::Warn,
                        Domain::Metrics,
                        "refresh_failed",
                        obj(&[("error", v_str(&format!("{:#}", err)))]),
                    );
                }
            }
        }
    }
}

/// Both fetches run concurrently; Pareto data may legitimately be absent.
async fn fetch_both(api: &dyn ExperimentApi) -> (anyhow::Result<MetricsSummary>, Option<ParetoData>) {
    let (metrics, pareto) = tokio::join!(api.metrics(), api.pareto());
    (metrics, pareto.ok())
}
