use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Base URL of the orchestration API, e.g. `https://10.0.0.1:6443`.
    pub orchestrator_url: String,
    /// Bearer token for the orchestration API, if the cluster requires one.
    pub orchestrator_token: Option<String>,
    /// Accept invalid TLS certificates from the orchestration API
    /// (self-signed clusters in lab environments).
    pub orchestrator_insecure: bool,
    /// How many historical lines to fetch before a live tail starts.
    pub recent_line_limit: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("QUARTERDECK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            orchestrator_url: env::var("ORCHESTRATOR_URL")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            orchestrator_token: env::var("ORCHESTRATOR_TOKEN").ok(),
            orchestrator_insecure: env::var("ORCHESTRATOR_INSECURE")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            recent_line_limit: env::var("RECENT_LINE_LIMIT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(100),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            orchestrator_url: "http://localhost:8001".to_string(),
            orchestrator_token: None,
            orchestrator_insecure: false,
            recent_line_limit: 100,
        }
    }
}
