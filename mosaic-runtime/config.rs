//! Process configuration loaded from environment variables.

/// Runtime configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Number of dedicated worker scheduler threads (§5).
    pub worker_count: usize,
    /// Override for the Claude CLI binary path, forwarded to
    /// `ClaudeAgentOptions` when set.
    pub claude_cli_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("MOSAIC_WORKER_COUNT").ok().as_deref(),
            std::env::var("CLAUDE_CLI_PATH").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env
    /// vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        port: Option<&str>,
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        worker_count: Option<&str>,
        claude_cli_path: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(8081);

        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let worker_count = worker_count
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(4);

        let claude_cli_path = claude_cli_path.filter(|s| !s.is_empty()).map(String::from);

        Config {
            port,
            sentry_dsn,
            environment,
            worker_count,
            claude_cli_path,
        }
    }
}
