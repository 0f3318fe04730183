#[derive(Clone, Debug)]
pub struct Config {
    pub api_base: String,
    pub poll_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub log_capacity: usize,
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_base: std::env::var("API_BASE").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            poll_interval_ms: std::env::var("POLL_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(2000),
            metrics_interval_ms: std::env::var("METRICS_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            log_capacity: std::env::var("LOG_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(1000),
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080".to_string(),
            poll_interval_ms: 2000,
            metrics_interval_ms: 5000,
            log_capacity: 1000,
            request_timeout_secs: 30,
        }
    }
}
