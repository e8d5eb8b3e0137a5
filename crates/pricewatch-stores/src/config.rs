use std::path::PathBuf;
use std::time::Duration;

use pricewatch_backend::{LocalStateStore, RestConfig};

/// Client settings read from `PRICEWATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Unset selects the in-memory backend seeded from `fixture_path`.
    pub backend_url: Option<String>,
    pub anon_key: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub state_dir: PathBuf,
    pub fixture_path: PathBuf,
    pub email: Option<String>,
    pub password: Option<String>,
    pub web_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            backend_url: non_empty("PRICEWATCH_BACKEND_URL"),
            anon_key: lookup("PRICEWATCH_ANON_KEY").unwrap_or_default(),
            http_timeout_secs: lookup("PRICEWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("PRICEWATCH_USER_AGENT")
                .unwrap_or_else(|| format!("pricewatch/{}", env!("CARGO_PKG_VERSION"))),
            state_dir: lookup("PRICEWATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.pricewatch")),
            fixture_path: lookup("PRICEWATCH_FIXTURE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fixtures/demo/seed.yaml")),
            email: non_empty("PRICEWATCH_EMAIL"),
            password: non_empty("PRICEWATCH_PASSWORD"),
            web_port: lookup("PRICEWATCH_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    /// HTTP backend settings, when a backend URL is configured.
    pub fn rest_config(&self) -> Option<RestConfig> {
        let base_url = self.backend_url.as_ref()?;
        let mut config = RestConfig::new(base_url.trim_end_matches('/'), self.anon_key.clone());
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        config.user_agent = Some(self.user_agent.clone());
        config.state_dir = Some(self.state_dir.clone());
        Some(config)
    }

    pub fn local_state(&self) -> LocalStateStore {
        LocalStateStore::new(self.state_dir.clone())
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.email.as_deref()?, self.password.as_deref()?))
    }
}
