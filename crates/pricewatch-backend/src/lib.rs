//! Backend contract for the pricewatch client plus its HTTP and in-memory implementations.

pub mod changefeed;
pub mod fixtures;
pub mod local_state;
pub mod memory;
pub mod query;
pub mod rest;

use std::fmt;

use async_trait::async_trait;
use pricewatch_core::{AuthEvent, AuthEventKind, RowChange, Session};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub use local_state::LocalStateStore;
pub use memory::MemoryBackend;
pub use query::{Filter, Order, Query};
pub use rest::{RestBackend, RestConfig};

pub const CRATE_NAME: &str = "pricewatch-backend";

pub const CURRENT_LOW_QUERY: &str = "current_low_query";
pub const PRICE_TIMELINE: &str = "get_price_timeline";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("{0}")]
    Auth(String),
    #[error("missing or expired access token")]
    Unauthorized,
    #[error("decoding {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("changefeed: {0}")]
    Changefeed(String),
    #[error("{0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    ScrapeJobs,
    Listings,
    SearchTags,
    Folders,
    Files,
    AlertsData,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::ScrapeJobs,
        Table::Listings,
        Table::SearchTags,
        Table::Folders,
        Table::Files,
        Table::AlertsData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::ScrapeJobs => "scrape_jobs",
            Table::Listings => "listings",
            Table::SearchTags => "search_tags",
            Table::Folders => "folders",
            Table::Files => "files",
            Table::AlertsData => "alerts_data",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a changefeed subscription listens to. `owner` restricts delivery to
/// rows whose `user_id` matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub table: Table,
    pub owner: Option<String>,
}

impl ChannelSpec {
    pub fn owned(name: impl Into<String>, table: Table, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table,
            owner: Some(owner.into()),
        }
    }
}

/// Live changefeed handle. Dropping `events` stops delivery on the next send;
/// call [`Backend::remove_subscription`] to release the channel upstream.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    pub channel: String,
    pub events: mpsc::UnboundedReceiver<RowChange>,
}

pub type AuthEvents = mpsc::UnboundedReceiver<AuthEvent>;

#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, session: &Session, query: Query) -> Result<Vec<JsonValue>>;

    async fn insert(
        &self,
        session: &Session,
        table: Table,
        rows: Vec<JsonValue>,
    ) -> Result<Vec<JsonValue>>;

    async fn update(
        &self,
        session: &Session,
        table: Table,
        filters: Vec<Filter>,
        patch: JsonValue,
    ) -> Result<Vec<JsonValue>>;

    async fn upsert(
        &self,
        session: &Session,
        table: Table,
        row: JsonValue,
        on_conflict: &str,
    ) -> Result<Vec<JsonValue>>;

    async fn delete(
        &self,
        session: &Session,
        table: Table,
        filters: Vec<Filter>,
    ) -> Result<Vec<JsonValue>>;

    async fn rpc(&self, session: &Session, function: &str, args: JsonValue)
        -> Result<Vec<JsonValue>>;

    async fn subscribe(&self, session: &Session, spec: ChannelSpec) -> Result<Subscription>;

    async fn remove_subscription(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_session(&self) -> Result<Option<Session>>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    async fn sign_out(&self) -> Result<()>;

    async fn refresh_session(&self) -> Result<Session>;

    /// Session-change stream. The first event is always `INITIAL_SESSION`
    /// carrying the session current at registration time.
    async fn on_auth_state_change(&self) -> Result<AuthEvents>;
}

pub fn decode_rows<T: DeserializeOwned>(context: &str, rows: Vec<JsonValue>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|source| BackendError::Decode {
                context: context.to_string(),
                source,
            })
        })
        .collect()
}

#[derive(Debug, Default)]
pub(crate) struct AuthListeners {
    senders: Mutex<Vec<mpsc::UnboundedSender<AuthEvent>>>,
}

impl AuthListeners {
    pub(crate) async fn register(&self, current: Option<Session>) -> AuthEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AuthEvent::new(AuthEventKind::InitialSession, current));
        self.senders.lock().await.push(tx);
        rx
    }

    pub(crate) async fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let event = AuthEvent::new(kind, session);
        self.senders
            .lock()
            .await
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
