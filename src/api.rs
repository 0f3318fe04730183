use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::model::{
    CostEstimate, ExperimentConfig, ExperimentId, ExperimentState, MetricsSummary, ParetoData,
};

/// Raw chunked body of one log stream connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Backend surface the engine drives. Object-safe so tests can substitute
/// an in-process fake for the HTTP client.
#[async_trait]
pub trait ExperimentApi: Send + Sync {
    async fn run_experiment(
        &self,
        id: ExperimentId,
        config: &ExperimentConfig,
    ) -> Result<ExperimentState>;
    async fn experiment_status(&self, id: ExperimentId) -> Result<ExperimentState>;
    async fn open_log_stream(&self, id: ExperimentId) -> Result<ByteStream>;
    async fn all_results(&self) -> Result<HashMap<ExperimentId, ExperimentState>>;
    async fn cost_estimates(&self) -> Result<Vec<CostEstimate>>;
    async fn metrics(&self) -> Result<MetricsSummary>;
    async fn pareto(&self) -> Result<ParetoData>;
    async fn health(&self) -> bool;
}

pub struct HttpApi {
    client: Client,
    base: String,
    timeout: Duration,
}

impl HttpApi {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            // No client-wide timeout: it would also cap the lifetime of the
            // log stream body. JSON calls get a per-request deadline instead.
            client: Client::builder().build()?,
            base: cfg.api_base.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(cfg.request_timeout_secs),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self.client.get(&url).timeout(self.timeout).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("API error {} on {}: {}", status.as_u16(), path, body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("API error {} on {}: {}", status.as_u16(), path, text));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ExperimentApi for HttpApi {
    async fn run_experiment(
        &self,
        id: ExperimentId,
        config: &ExperimentConfig,
    ) -> Result<ExperimentState> {
        self.post_json(&format!("/experiments/{}/run", id), config).await
    }

    async fn experiment_status(&self, id: ExperimentId) -> Result<ExperimentState> {
        self.get_json(&format!("/experiments/{}/status", id)).await
    }

    async fn open_log_stream(&self, id: ExperimentId) -> Result<ByteStream> {
        let url = format!("{}/experiments/{}/logs", self.base, id);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("log stream open failed {}: {}", status.as_u16(), body));
        }
        Ok(Box::pin(resp.bytes_stream().map_err(anyhow::Error::from)))
    }

    async fn all_results(&self) -> Result<HashMap<ExperimentId, ExperimentState>> {
        self.get_json("/experiments/results").await
    }

    async fn cost_estimates(&self) -> Result<Vec<CostEstimate>> {
        self.get_json("/experiments/cost-estimate").await
    }

    async fn metrics(&self) -> Result<MetricsSummary> {
        self.get_json("/metrics").await
    }

    async fn pareto(&self) -> Result<ParetoData> {
        self.get_json("/metrics/pareto").await
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
