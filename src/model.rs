use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of known backend evaluation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentId {
    E1Baselines,
    E2JudgeValidation,
    E3LabelData,
    E3TrainRouter,
    E3TrainFeature,
    E3Routellm,
    E4Evaluation,
    E6ErrorAnalysis,
}

impl ExperimentId {
    pub const ALL: [ExperimentId; 8] = [
        ExperimentId::E1Baselines,
        ExperimentId::E2JudgeValidation,
        ExperimentId::E3LabelData,
        ExperimentId::E3TrainRouter,
        ExperimentId::E3TrainFeature,
        ExperimentId::E3Routellm,
        ExperimentId::E4Evaluation,
        ExperimentId::E6ErrorAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentId::E1Baselines => "e1_baselines",
            ExperimentId::E2JudgeValidation => "e2_judge_validation",
            ExperimentId::E3LabelData => "e3_label_data",
            ExperimentId::E3TrainRouter => "e3_train_router",
            ExperimentId::E3TrainFeature => "e3_train_feature",
            ExperimentId::E3Routellm => "e3_routellm",
            ExperimentId::E4Evaluation => "e4_evaluation",
            ExperimentId::E6ErrorAnalysis => "e6_error_analysis",
        }
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| anyhow!("unknown experiment id: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Idle => "idle",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub percent: f64,
}

/// Full lifecycle snapshot of one experiment. Replaced wholesale by each
/// start/poll response, never patched field by field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentState {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub results: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExperimentState {
    pub fn initial(experiment_id: ExperimentId) -> Self {
        Self {
            experiment_id,
            status: ExperimentStatus::Idle,
            progress: None,
            started_at: None,
            completed_at: None,
            results: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }
}

/// Optional overrides passed through to the start call; opaque to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// Display classification of a log line by substring markers. Cosmetic
/// only; never affects buffering or lifecycle decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Error,
    Warning,
    Progress,
    Plain,
}

impl LogKind {
    pub fn of(line: &str) -> Self {
        if line.contains("ERROR") {
            LogKind::Error
        } else if line.contains("WARNING") {
            LogKind::Warning
        } else if line.contains("[PROGRESS]") {
            LogKind::Progress
        } else {
            LogKind::Plain
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DomainSplit {
    pub local: u64,
    pub cloud: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingLogEntry {
    pub id: u64,
    pub query: String,
    pub route: String,
    pub confidence: f64,
    pub domain: String,
    pub latency_ms: f64,
    pub cost_usd: f64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Dashboard-wide routing aggregates; refreshed by full replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_queries: u64,
    pub local_count: u64,
    pub cloud_count: u64,
    pub total_cost: f64,
    pub total_saved: f64,
    pub avg_router_latency_ms: f64,
    #[serde(default)]
    pub domain_breakdown: HashMap<String, DomainSplit>,
    #[serde(default)]
    pub recent_history: Vec<RoutingLogEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParetoPoint {
    pub threshold: f64,
    pub quality: f64,
    pub cost_pct: f64,
    pub local_pct: f64,
    pub pgr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParetoData {
    pub sweep: Vec<ParetoPoint>,
    pub cloud_quality: f64,
    pub local_quality: f64,
    pub recommended_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    pub experiment_id: String,
    pub calls: u64,
    pub estimated_cost: f64,
    pub model: String,
}
