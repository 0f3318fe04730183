use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::api::ExperimentApi;
use crate::config::Config;
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::model::{CostEstimate, ExperimentId, ExperimentState};
use crate::runner::ExperimentRunner;

/// Single orchestrator holding one runner per experiment id, so several
/// concurrently displayed experiments never duplicate polling or
/// streaming work.
pub struct ExperimentHub {
    api: Arc<dyn ExperimentApi>,
    cfg: Config,
    runners: HashMap<ExperimentId, ExperimentRunner>,
}

impl ExperimentHub {
    pub fn new(api: Arc<dyn ExperimentApi>, cfg: Config) -> Self {
        Self {
            api,
            cfg,
            runners: HashMap::new(),
        }
    }

    /// Get or lazily create the runner for an id. Each id has exactly one
    /// live runner for the lifetime of the hub.
    pub fn runner(&mut self, id: ExperimentId) -> &mut ExperimentRunner {
        let api = self.api.clone();
        let cfg = &self.cfg;
        self.runners
            .entry(id)
            .or_insert_with(|| ExperimentRunner::new(api, id, cfg))
    }

    pub fn states(&self) -> Vec<ExperimentState> {
        self.runners.values().map(|r| r.state()).collect()
    }

    /// Bulk state recovery from `GET /experiments/results`. Runners that
    /// are locally running keep their own state: their pollers are the
    /// authority for in-flight runs.
    pub async fn refresh_all(&mut self) -> Result<()> {
        let results = self.api.all_results().await?;
        log(
            Level::Debug,
            Domain::Runner,
            "refresh_all",
            obj(&[("count", v_num(results.len() as f64))]),
        );
        for (id, state) in results {
            let runner = self.runner(id);
            if !runner.state().is_running() {
                if state.is_running() {
                    // A run survived a reload; re-attach poller and stream.
                    runner.refresh().await;
                } else {
                    runner.replace_state(state);
                }
            }
        }
        Ok(())
    }

    pub async fn cost_estimates(&self) -> Result<Vec<CostEstimate>> {
        self.api.cost_estimates().await
    }

    pub async fn backend_healthy(&self) -> bool {
        self.api.health().await
    }

    /// Stop every runner's background work. Idempotent.
    pub fn teardown_all(&mut self) {
        for runner in self.runners.values_mut() {
            runner.teardown();
        }
        log(
            Level::Info,
            Domain::System,
            "teardown_all",
            obj(&[("runners", v_num(self.runners.len() as f64))]),
        );
    }
}
