use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::ExperimentApi;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{ExperimentId, ExperimentState};

/// Periodic status fetch for one running experiment. Requests are issued
/// serially, one per tick, so responses apply in issue order; the poller
/// stops itself the instant an applied status is terminal, cancelling the
/// sibling log stream via `on_terminal`.
pub struct StatusPoller {
    token: CancellationToken,
}

impl StatusPoller {
    pub fn spawn(
        api: Arc<dyn ExperimentApi>,
        id: ExperimentId,
        state: Arc<Mutex<ExperimentState>>,
        interval: Duration,
        on_terminal: CancellationToken,
    ) -> Self {
        let token = CancellationToken::new();
        tokio::spawn(poll_loop(api, id, state, interval, token.clone(), on_terminal));
        Self { token }
    }

    /// Cancel the poll timer. Idempotent; a response already in flight is
    /// discarded rather than applied.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

async fn poll_loop(
    api: Arc<dyn ExperimentApi>,
    id: ExperimentId,
    state: Arc<Mutex<ExperimentState>>,
    interval: Duration,
    token: CancellationToken,
    on_terminal: CancellationToken,
) {
    // First fetch lands one full interval after start: the run call itself
    // just returned a fresh state.
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            res = api.experiment_status(id) => res,
        };
        // Teardown may have raced the request; its response must not land.
        if token.is_cancelled() {
            return;
        }
        match fetched {
            Ok(next) => {
                let terminal = next.status.is_terminal();
                let status = next.status;
                if let Ok(mut current) = state.lock() {
                    *current = next;
                }
                if terminal {
                    log(
                        Level::Info,
                        Domain::Poll,
                        "terminal",
                        obj(&[
                            ("experiment", v_str(id.as_str())),
                            ("status", v_str(status.as_str())),
                        ]),
                    );
                    on_terminal.cancel();
                    return;
                }
            }
            Err(err) => {
                // Transient transport noise; the next tick retries
                // implicitly and only a backend-reported failure may mark
                // the experiment failed.
                log(
                    Level::Warn,
                    Domain::Poll,
                    "tick_failed",
                    obj(&[
                        ("experiment", v_str(id.as_str())),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
            }
        }
    }
}
