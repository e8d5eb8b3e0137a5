//! HTTP backend speaking a PostgREST/GoTrue-style API with an SSE changefeed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{AuthEventKind, Identity, Session};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use reqwest_eventsource::RequestBuilderExt;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::changefeed::{owner_filter, pump};
use crate::{
    AuthEvents, AuthListeners, AuthProvider, Backend, BackendError, ChannelSpec, Filter,
    LocalStateStore, Query, Result, Subscription, Table,
};

pub const SESSION_STATE_KEY: &str = "auth_session";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub anon_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Where the signed-in session is persisted; `None` keeps it in memory only.
    pub state_dir: Option<PathBuf>,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            state_dir: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: Identity,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                self.expires_in
                    .map(|secs| now + chrono::Duration::seconds(secs))
            });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Best human-readable message from an error body.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|value| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(JsonValue::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

pub fn parse_rows(context: &str, body: &str) -> Result<Vec<JsonValue>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: JsonValue = serde_json::from_str(body).map_err(|source| BackendError::Decode {
        context: context.to_string(),
        source,
    })?;
    Ok(match value {
        JsonValue::Array(rows) => rows,
        JsonValue::Null => Vec::new(),
        other => vec![other],
    })
}

pub struct RestBackend {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    config: RestConfig,
    state: Option<LocalStateStore>,
    session: RwLock<Option<Session>>,
    listeners: AuthListeners,
    feeds: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        // Changefeed connections are long-lived and must not time out.
        let mut stream_builder = reqwest::Client::builder();

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
            stream_builder = stream_builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let stream_client = stream_builder
            .build()
            .context("building changefeed client")?;
        let state = config.state_dir.clone().map(LocalStateStore::new);

        Ok(Self {
            client,
            stream_client,
            config,
            state,
            session: RwLock::new(None),
            listeners: AuthListeners::default(),
            feeds: Mutex::new(HashMap::new()),
        })
    }

    /// Loads a previously persisted session, if any.
    pub async fn restore_session(&self) -> anyhow::Result<Option<Session>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        let restored: Option<Session> = state.load(SESSION_STATE_KEY).await?;
        if let Some(session) = &restored {
            info!(user_id = session.user_id(), "restored persisted session");
        }
        *self.session.write().await = restored.clone();
        Ok(restored)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn table_url(&self, table: Table) -> String {
        self.url(&format!("rest/v1/{table}"))
    }

    pub fn rpc_url(&self, function: &str) -> String {
        self.url(&format!("rest/v1/rpc/{function}"))
    }

    pub fn changefeed_url(&self, spec: &ChannelSpec) -> Result<Url> {
        let mut params = vec![("table", spec.table.as_str().to_string())];
        if let Some(owner) = &spec.owner {
            params.push(("filter", owner_filter(owner)));
        }
        Url::parse_with_params(&self.url("realtime/v1/changes"), &params)
            .map_err(|err| BackendError::Changefeed(format!("invalid changefeed url: {err}")))
    }

    fn authed(&self, method: Method, url: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
    }

    async fn send_rows(&self, request: RequestBuilder, context: &str) -> Result<Vec<JsonValue>> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized);
        }
        if !status.is_success() {
            return Err(BackendError::HttpStatus {
                status: status.as_u16(),
                url,
                message: error_message(&body),
            });
        }
        parse_rows(context, &body)
    }

    async fn token_request(&self, grant_type: &str, body: JsonValue) -> Result<Session> {
        let url = self.url(&format!("auth/v1/token?grant_type={grant_type}"));
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.config.anon_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Auth(error_message(&text)));
        }
        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|source| BackendError::Decode {
                context: "auth token".to_string(),
                source,
            })?;
        Ok(token.into_session(Utc::now()))
    }

    async fn persist(&self, session: Option<&Session>) {
        let Some(state) = &self.state else {
            return;
        };
        let outcome = match session {
            Some(session) => state.save(SESSION_STATE_KEY, session).await.map(|_| ()),
            None => state.remove(SESSION_STATE_KEY).await.map(|_| ()),
        };
        if let Err(err) = outcome {
            warn!(error = %err, "could not persist auth session");
        }
    }

    async fn replace_session(&self, kind: AuthEventKind, session: Option<Session>) {
        let mut current = self.session.write().await;
        *current = session.clone();
        self.persist(session.as_ref()).await;
        self.listeners.emit(kind, session).await;
    }
}

impl Drop for RestBackend {
    fn drop(&mut self) {
        if let Ok(mut feeds) = self.feeds.try_lock() {
            for (_, task) in feeds.drain() {
                task.abort();
            }
        }
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::to_param).collect()
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, session: &Session, query: Query) -> Result<Vec<JsonValue>> {
        let request = self
            .authed(Method::GET, &self.table_url(query.table), &session.access_token)
            .query(&query.to_params());
        self.send_rows(request, query.table.as_str()).await
    }

    async fn insert(
        &self,
        session: &Session,
        table: Table,
        rows: Vec<JsonValue>,
    ) -> Result<Vec<JsonValue>> {
        let request = self
            .authed(Method::POST, &self.table_url(table), &session.access_token)
            .header("Prefer", "return=representation")
            .json(&rows);
        self.send_rows(request, table.as_str()).await
    }

    async fn update(
        &self,
        session: &Session,
        table: Table,
        filters: Vec<Filter>,
        patch: JsonValue,
    ) -> Result<Vec<JsonValue>> {
        let request = self
            .authed(Method::PATCH, &self.table_url(table), &session.access_token)
            .query(&filter_params(&filters))
            .header("Prefer", "return=representation")
            .json(&patch);
        self.send_rows(request, table.as_str()).await
    }

    async fn upsert(
        &self,
        session: &Session,
        table: Table,
        row: JsonValue,
        on_conflict: &str,
    ) -> Result<Vec<JsonValue>> {
        let request = self
            .authed(Method::POST, &self.table_url(table), &session.access_token)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row);
        self.send_rows(request, table.as_str()).await
    }

    async fn delete(
        &self,
        session: &Session,
        table: Table,
        filters: Vec<Filter>,
    ) -> Result<Vec<JsonValue>> {
        let request = self
            .authed(Method::DELETE, &self.table_url(table), &session.access_token)
            .query(&filter_params(&filters))
            .header("Prefer", "return=representation");
        self.send_rows(request, table.as_str()).await
    }

    async fn rpc(
        &self,
        session: &Session,
        function: &str,
        args: JsonValue,
    ) -> Result<Vec<JsonValue>> {
        let request = self
            .authed(Method::POST, &self.rpc_url(function), &session.access_token)
            .json(&args);
        self.send_rows(request, function).await
    }

    async fn subscribe(&self, session: &Session, spec: ChannelSpec) -> Result<Subscription> {
        let url = self.changefeed_url(&spec)?;
        let source = self
            .stream_client
            .get(url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&session.access_token)
            .eventsource()
            .map_err(|err| BackendError::Changefeed(err.to_string()))?;

        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let span = info_span!("changefeed", channel = %spec.name, table = %spec.table, %id);
        let task = tokio::spawn(pump(source, spec.name.clone(), tx).instrument(span));
        self.feeds.lock().await.insert(id, task);

        Ok(Subscription {
            id,
            channel: spec.name,
            events,
        })
    }

    async fn remove_subscription(&self, id: Uuid) -> Result<()> {
        if let Some(task) = self.feeds.lock().await.remove(&id) {
            task.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for RestBackend {
    async fn get_session(&self) -> Result<Option<Session>> {
        let current = self.session.read().await.clone();
        match current {
            Some(session)
                if session.is_expired_at(Utc::now()) && session.refresh_token.is_some() =>
            {
                match self.refresh_session().await {
                    Ok(refreshed) => Ok(Some(refreshed)),
                    Err(err) => {
                        warn!(error = %err, "stored session expired and could not be refreshed");
                        self.replace_session(AuthEventKind::SignedOut, None).await;
                        Ok(None)
                    }
                }
            }
            other => Ok(other),
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let session = self
            .token_request("password", json!({ "email": email.trim(), "password": password }))
            .await?;
        info!(user_id = session.user_id(), "signed in");
        self.replace_session(AuthEventKind::SignedIn, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let current = self.session.read().await.clone();
        let outcome = match current {
            Some(session) => {
                let request = self.authed(
                    Method::POST,
                    &self.url("auth/v1/logout"),
                    &session.access_token,
                );
                self.send_rows(request, "logout").await.map(|_| ())
            }
            None => Ok(()),
        };
        self.replace_session(AuthEventKind::SignedOut, None).await;
        outcome
    }

    async fn refresh_session(&self) -> Result<Session> {
        let refresh_token = self
            .session
            .read()
            .await
            .as_ref()
            .and_then(|session| session.refresh_token.clone())
            .ok_or_else(|| BackendError::Auth("Auth session missing!".to_string()))?;
        let session = self
            .token_request("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        self.replace_session(AuthEventKind::TokenRefreshed, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn on_auth_state_change(&self) -> Result<AuthEvents> {
        let current = self.session.read().await;
        Ok(self.listeners.register(current.clone()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend(base_url: &str) -> RestBackend {
        RestBackend::new(RestConfig::new(base_url, "anon")).expect("client")
    }

    #[test]
    fn urls_are_joined_without_double_slashes() {
        let rest = backend("https://db.example.com/");
        assert_eq!(
            rest.table_url(Table::ScrapeJobs),
            "https://db.example.com/rest/v1/scrape_jobs"
        );
        assert_eq!(
            rest.rpc_url("current_low_query"),
            "https://db.example.com/rest/v1/rpc/current_low_query"
        );
    }

    #[test]
    fn changefeed_url_carries_table_and_owner_filter() {
        let rest = backend("https://db.example.com");
        let url = rest
            .changefeed_url(&ChannelSpec::owned("listings-u1", Table::Listings, "u1"))
            .expect("url");
        assert_eq!(url.path(), "/realtime/v1/changes");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("table".to_string(), "listings".to_string()),
                ("filter".to_string(), "user_id=eq.u1".to_string()),
            ]
        );
    }

    #[test]
    fn error_messages_prefer_structured_fields() {
        assert_eq!(
            error_message(r#"{"code":"23505","message":"duplicate key"}"#),
            "duplicate key"
        );
        assert_eq!(
            error_message(r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#),
            "Invalid login credentials"
        );
        assert_eq!(error_message(" upstream timeout \n"), "upstream timeout");
    }

    #[test]
    fn row_bodies_accept_arrays_objects_and_empty() {
        assert_eq!(parse_rows("t", "").expect("empty").len(), 0);
        assert_eq!(parse_rows("t", "[{\"id\":1},{\"id\":2}]").expect("array").len(), 2);
        assert_eq!(parse_rows("t", "{\"id\":1}").expect("object").len(), 1);
        assert!(parse_rows("t", "<html>").is_err());
    }

    #[test]
    fn token_responses_compute_expiry() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600,
            "user": {"id": "u1", "email": "ana@example.com", "role": "authenticated"}
        }))
        .expect("token");
        let session = token.into_session(now);
        assert_eq!(session.user_id(), "u1");
        assert_eq!(
            session.expires_at,
            Some(now + chrono::Duration::seconds(3600))
        );
    }

    #[tokio::test]
    async fn persisted_sessions_are_restored() {
        let dir = tempdir().expect("tempdir");
        let mut config = RestConfig::new("https://db.example.com", "anon");
        config.state_dir = Some(dir.path().to_path_buf());
        let session = Session {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: None,
            user: Identity {
                id: "u1".into(),
                email: None,
            },
        };
        LocalStateStore::new(dir.path())
            .save(SESSION_STATE_KEY, &session)
            .await
            .expect("save");

        let rest = RestBackend::new(config).expect("client");
        assert_eq!(rest.restore_session().await.expect("restore"), Some(session.clone()));
        assert_eq!(rest.get_session().await.expect("session"), Some(session));
    }
}
