//! In-process backend used by tests, the demo fixture and offline runs.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use pricewatch_core::{parse_timestamp, AuthEventKind, Identity, RowChange, RowId, Session};
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::changefeed::FeedHub;
use crate::fixtures::{load_seed, Seed};
use crate::query::{json_eq, parse_select, SelectItem};
use crate::{
    AuthEvents, AuthListeners, AuthProvider, Backend, BackendError, ChannelSpec, Filter, Query,
    Result, Subscription, Table, CURRENT_LOW_QUERY, PRICE_TIMELINE,
};

/// Parent/child foreign keys, used for `select` embedding and cascade deletes.
const RELATIONS: &[(Table, Table, &str)] = &[
    (Table::Folders, Table::Files, "folder_id"),
    (Table::Files, Table::ScrapeJobs, "file_id"),
    (Table::ScrapeJobs, Table::Listings, "scrape_job_id"),
    (Table::ScrapeJobs, Table::SearchTags, "scrape_job_id"),
];

#[derive(Debug, Clone)]
struct MemoryUser {
    identity: Identity,
    password: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<Table, Vec<JsonValue>>,
    next_ids: BTreeMap<Table, RowId>,
    users: Vec<MemoryUser>,
    access_tokens: HashMap<String, Identity>,
    refresh_tokens: HashMap<String, Identity>,
    current: Option<Session>,
    feeds: FeedHub,
    rpc_rows: HashMap<String, Vec<JsonValue>>,
    calls: HashMap<String, usize>,
    failures: HashMap<String, String>,
}

fn row_id(row: &JsonValue) -> Option<RowId> {
    row.get("id").and_then(JsonValue::as_i64)
}

/// Row-level security stand-in: rows without an owner are visible to everyone.
fn visible(row: &JsonValue, uid: Option<&str>) -> bool {
    match (uid, row.get("user_id")) {
        (None, _) | (_, None) | (_, Some(JsonValue::Null)) => true,
        (Some(uid), Some(owner)) => owner.as_str() == Some(uid),
    }
}

fn text(row: &JsonValue, column: &str) -> String {
    row.get(column)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn price_of(row: &JsonValue) -> Option<f64> {
    match row.get("price")? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn inserted_at(row: &JsonValue) -> Option<chrono::DateTime<Utc>> {
    row.get("date_inserted")
        .and_then(JsonValue::as_str)
        .and_then(parse_timestamp)
}

impl MemoryState {
    fn enter(&mut self, key: String) -> Result<()> {
        *self.calls.entry(key.clone()).or_default() += 1;
        match self.failures.remove(&key) {
            Some(message) => Err(BackendError::Rejected(message)),
            None => Ok(()),
        }
    }

    fn authorize(&self, session: &Session) -> Result<Identity> {
        self.access_tokens
            .get(&session.access_token)
            .cloned()
            .ok_or(BackendError::Unauthorized)
    }

    fn rows(&self, table: Table) -> &[JsonValue] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn claim_id(&mut self, table: Table, requested: Option<RowId>) -> RowId {
        let next = self.next_ids.entry(table).or_insert(1);
        match requested {
            Some(id) => {
                *next = (*next).max(id + 1);
                id
            }
            None => {
                let id = *next;
                *next += 1;
                id
            }
        }
    }

    /// Stores a row, assigning id/owner defaults. Returns the stored copy.
    fn store_row(
        &mut self,
        table: Table,
        mut row: JsonValue,
        owner: Option<&str>,
    ) -> Result<JsonValue> {
        let requested = match &row {
            JsonValue::Object(object) => object.get("id").and_then(JsonValue::as_i64),
            _ => {
                return Err(BackendError::Rejected(format!(
                    "{table} rows must be JSON objects"
                )))
            }
        };
        if let Some(id) = requested {
            if self.rows(table).iter().any(|r| row_id(r) == Some(id)) {
                return Err(BackendError::Rejected(format!(
                    "duplicate key value violates unique constraint on {table}.id ({id})"
                )));
            }
        }
        let id = self.claim_id(table, requested);

        if let Some(object) = row.as_object_mut() {
            object.insert("id".to_string(), json!(id));
            if let Some(owner) = owner {
                if object.get("user_id").map_or(true, JsonValue::is_null) {
                    object.insert("user_id".to_string(), json!(owner));
                }
            }
            if table == Table::Listings && !object.contains_key("date_inserted") {
                object.insert("date_inserted".to_string(), json!(Utc::now().to_rfc3339()));
            }
        }

        self.tables.entry(table).or_default().push(row.clone());
        Ok(row)
    }

    fn insert_row(
        &mut self,
        table: Table,
        row: JsonValue,
        owner: Option<&str>,
    ) -> Result<JsonValue> {
        let stored = self.store_row(table, row, owner)?;
        self.feeds
            .publish(&RowChange::insert(table.as_str(), stored.clone()));
        Ok(stored)
    }

    fn update_rows(
        &mut self,
        table: Table,
        uid: Option<&str>,
        filters: &[Filter],
        patch: &Map<String, JsonValue>,
    ) -> Vec<JsonValue> {
        let mut changes = Vec::new();
        if let Some(rows) = self.tables.get_mut(&table) {
            for row in rows
                .iter_mut()
                .filter(|row| visible(row, uid) && filters.iter().all(|f| f.matches(row)))
            {
                let old = row.clone();
                if let Some(object) = row.as_object_mut() {
                    for (column, value) in patch {
                        if column != "id" {
                            object.insert(column.clone(), value.clone());
                        }
                    }
                }
                changes.push(RowChange::update(table.as_str(), row.clone(), old));
            }
        }
        for change in &changes {
            self.feeds.publish(change);
        }
        changes.into_iter().filter_map(|change| change.record).collect()
    }

    fn delete_rows(
        &mut self,
        table: Table,
        uid: Option<&str>,
        filters: &[Filter],
    ) -> Vec<JsonValue> {
        let Some(rows) = self.tables.get_mut(&table) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(rows)
            .into_iter()
            .partition(|row| visible(row, uid) && filters.iter().all(|f| f.matches(row)));
        *rows = kept;

        for row in &removed {
            self.feeds
                .publish(&RowChange::delete(table.as_str(), row.clone()));
        }
        let ids: Vec<RowId> = removed.iter().filter_map(row_id).collect();
        self.cascade(table, &ids);
        removed
    }

    fn cascade(&mut self, parent: Table, ids: &[RowId]) {
        for &(from, child, fk) in RELATIONS {
            if from != parent {
                continue;
            }
            for &id in ids {
                let removed = self.delete_rows(child, None, &[Filter::eq(fk, id)]);
                if !removed.is_empty() {
                    debug!(%parent, %child, parent_id = id, rows = removed.len(), "cascade delete");
                }
            }
        }
    }

    fn upsert_row(
        &mut self,
        table: Table,
        uid: &str,
        row: JsonValue,
        on_conflict: &str,
    ) -> Result<Vec<JsonValue>> {
        let key = row.get(on_conflict).cloned().ok_or_else(|| {
            BackendError::Rejected(format!("upsert row is missing conflict column {on_conflict}"))
        })?;
        let exists = self.rows(table).iter().any(|r| {
            visible(r, Some(uid)) && r.get(on_conflict).is_some_and(|v| json_eq(v, &key))
        });
        if exists {
            let patch = row.as_object().cloned().unwrap_or_default();
            Ok(self.update_rows(table, Some(uid), &[Filter::eq(on_conflict, key)], &patch))
        } else {
            Ok(vec![self.insert_row(table, row, Some(uid))?])
        }
    }

    fn select_rows(&self, query: &Query, uid: &str) -> Result<Vec<JsonValue>> {
        let items = parse_select(&query.columns);
        let mut rows: Vec<JsonValue> = self
            .rows(query.table)
            .iter()
            .filter(|row| visible(row, Some(uid)) && query.filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();
        query.sort_rows(&mut rows);
        rows.iter()
            .map(|row| self.project(query.table, row, &items, uid))
            .collect()
    }

    fn project(
        &self,
        table: Table,
        row: &JsonValue,
        items: &[SelectItem],
        uid: &str,
    ) -> Result<JsonValue> {
        let mut out = Map::new();
        for item in items {
            match item {
                SelectItem::All => {
                    if let Some(object) = row.as_object() {
                        out.extend(object.clone());
                    }
                }
                SelectItem::Column(column) => {
                    out.insert(
                        column.clone(),
                        row.get(column).cloned().unwrap_or(JsonValue::Null),
                    );
                }
                SelectItem::Embed { table: name, columns } => {
                    let child = Table::from_name(name).ok_or_else(|| {
                        BackendError::Rejected(format!("unknown relation {name}"))
                    })?;
                    let fk = RELATIONS
                        .iter()
                        .find(|(parent, c, _)| *parent == table && *c == child)
                        .map(|(_, _, fk)| *fk)
                        .ok_or_else(|| {
                            BackendError::Rejected(format!(
                                "no relationship between {table} and {child}"
                            ))
                        })?;
                    let parent_id = row.get("id").cloned().unwrap_or(JsonValue::Null);
                    let mut children: Vec<&JsonValue> = self
                        .rows(child)
                        .iter()
                        .filter(|c| {
                            visible(c, Some(uid))
                                && c.get(fk).is_some_and(|v| json_eq(v, &parent_id))
                        })
                        .collect();
                    children.sort_by_key(|c| row_id(c));
                    let projected = children
                        .into_iter()
                        .map(|c| self.project(child, c, columns, uid))
                        .collect::<Result<Vec<_>>>()?;
                    out.insert(name.clone(), JsonValue::Array(projected));
                }
            }
        }
        Ok(JsonValue::Object(out))
    }

    /// Cheapest listing per (job, search, marketplace) with its link and offer count.
    fn current_low(&self, uid: &str) -> Vec<JsonValue> {
        let mut groups: BTreeMap<(Option<RowId>, String, String), Vec<&JsonValue>> =
            BTreeMap::new();
        for row in self.rows(Table::Listings).iter().filter(|r| visible(r, Some(uid))) {
            let key = (
                row.get("scrape_job_id").and_then(JsonValue::as_i64),
                text(row, "search_term"),
                text(row, "source"),
            );
            groups.entry(key).or_default().push(row);
        }

        groups
            .into_iter()
            .map(|((job_id, term, source), rows)| {
                let cheapest = rows
                    .iter()
                    .filter_map(|r| price_of(r).map(|price| (price, *r)))
                    .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
                let latest = rows.iter().filter_map(|r| inserted_at(r)).max();
                json!({
                    "scrape_job_id": job_id,
                    "search_term": term,
                    "source": source,
                    "current_lowest_price": cheapest.map(|(price, _)| price),
                    "latest_date": latest.map(|ts| ts.to_rfc3339()),
                    "link": cheapest.and_then(|(_, r)| r.get("url").cloned()),
                    "condition": cheapest.and_then(|(_, r)| r.get("condition").cloned()),
                    "offers": rows.len(),
                })
            })
            .collect()
    }

    /// Daily minimum price and offer count per (search, marketplace).
    fn price_timeline(&self, uid: &str) -> Vec<JsonValue> {
        let mut groups: BTreeMap<(NaiveDate, String, String), (Option<f64>, usize)> =
            BTreeMap::new();
        for row in self.rows(Table::Listings).iter().filter(|r| visible(r, Some(uid))) {
            let Some(date) = inserted_at(row).map(|ts| ts.date_naive()) else {
                continue;
            };
            let entry = groups
                .entry((date, text(row, "search_term"), text(row, "source")))
                .or_insert((None, 0));
            if let Some(price) = price_of(row) {
                entry.0 = Some(entry.0.map_or(price, |low: f64| low.min(price)));
            }
            entry.1 += 1;
        }

        groups
            .into_iter()
            .map(|((date, term, source), (min_price, offers))| {
                json!({
                    "the_date": date.format("%Y-%m-%d").to_string(),
                    "search_term": term,
                    "source": source,
                    "min_price": min_price,
                    "offers": offers,
                })
            })
            .collect()
    }

    fn issue_session(&mut self, identity: Identity) -> Session {
        let access_token = format!("mem-{}", Uuid::new_v4());
        let refresh_token = format!("mem-refresh-{}", Uuid::new_v4());
        self.access_tokens
            .insert(access_token.clone(), identity.clone());
        self.refresh_tokens
            .insert(refresh_token.clone(), identity.clone());
        let session = Session {
            access_token,
            refresh_token: Some(refresh_token),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            user: identity,
        };
        self.current = Some(session.clone());
        session
    }

    fn add_user(&mut self, id: Option<String>, email: &str, password: &str) -> Identity {
        let identity = Identity {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            email: Some(email.to_string()),
        };
        self.users.push(MemoryUser {
            identity: identity.clone(),
            password: password.to_string(),
        });
        identity
    }
}

/// Backend and auth provider kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    listeners: AuthListeners,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Result<Self> {
        let mut state = MemoryState::default();
        for user in seed.users {
            state.add_user(user.id, &user.email, &user.password);
        }
        for (table, rows) in seed.tables {
            for row in rows {
                state.store_row(table, row, None)?;
            }
        }
        state.rpc_rows.extend(seed.rpc);
        Ok(Self {
            state: Mutex::new(state),
            listeners: AuthListeners::default(),
        })
    }

    pub fn from_fixture(path: &Path) -> anyhow::Result<Self> {
        let seed = load_seed(path)?;
        Ok(Self::from_seed(seed)?)
    }

    pub async fn add_user(&self, email: &str, password: &str) -> Identity {
        self.state.lock().await.add_user(None, email, password)
    }

    /// Loads rows without emitting change notifications.
    pub async fn seed_rows(&self, table: Table, rows: Vec<JsonValue>) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            state.store_row(table, row, None)?;
        }
        Ok(())
    }

    /// Writes a row the way an external writer (the scraper) would: no
    /// session, change notification published.
    pub async fn ingest(&self, table: Table, row: JsonValue) -> Result<JsonValue> {
        self.state.lock().await.insert_row(table, row, None)
    }

    pub async fn rows(&self, table: Table) -> Vec<JsonValue> {
        self.state.lock().await.rows(table).to_vec()
    }

    pub async fn set_rpc_rows(&self, function: &str, rows: Vec<JsonValue>) {
        self.state
            .lock()
            .await
            .rpc_rows
            .insert(function.to_string(), rows);
    }

    /// Number of calls made for `key`, e.g. `select:scrape_jobs` or
    /// `rpc:current_low_query`.
    pub async fn calls(&self, key: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Makes the next call for `key` fail with `message`.
    pub async fn fail_next(&self, key: &str, message: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(key.to_string(), message.to_string());
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.feeds.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, session: &Session, query: Query) -> Result<Vec<JsonValue>> {
        let mut state = self.state.lock().await;
        state.enter(format!("select:{}", query.table))?;
        let identity = state.authorize(session)?;
        let rows = state.select_rows(&query, &identity.id)?;
        debug!(table = %query.table, rows = rows.len(), "memory select");
        Ok(rows)
    }

    async fn insert(
        &self,
        session: &Session,
        table: Table,
        rows: Vec<JsonValue>,
    ) -> Result<Vec<JsonValue>> {
        let mut state = self.state.lock().await;
        state.enter(format!("insert:{table}"))?;
        let identity = state.authorize(session)?;
        rows.into_iter()
            .map(|row| state.insert_row(table, row, Some(&identity.id)))
            .collect()
    }

    async fn update(
        &self,
        session: &Session,
        table: Table,
        filters: Vec<Filter>,
        patch: JsonValue,
    ) -> Result<Vec<JsonValue>> {
        let mut state = self.state.lock().await;
        state.enter(format!("update:{table}"))?;
        let identity = state.authorize(session)?;
        let patch = patch
            .as_object()
            .cloned()
            .ok_or_else(|| BackendError::Rejected("update patch must be a JSON object".into()))?;
        Ok(state.update_rows(table, Some(&identity.id), &filters, &patch))
    }

    async fn upsert(
        &self,
        session: &Session,
        table: Table,
        row: JsonValue,
        on_conflict: &str,
    ) -> Result<Vec<JsonValue>> {
        let mut state = self.state.lock().await;
        state.enter(format!("upsert:{table}"))?;
        let identity = state.authorize(session)?;
        state.upsert_row(table, &identity.id, row, on_conflict)
    }

    async fn delete(
        &self,
        session: &Session,
        table: Table,
        filters: Vec<Filter>,
    ) -> Result<Vec<JsonValue>> {
        let mut state = self.state.lock().await;
        state.enter(format!("delete:{table}"))?;
        let identity = state.authorize(session)?;
        Ok(state.delete_rows(table, Some(&identity.id), &filters))
    }

    async fn rpc(
        &self,
        session: &Session,
        function: &str,
        _args: JsonValue,
    ) -> Result<Vec<JsonValue>> {
        let mut state = self.state.lock().await;
        state.enter(format!("rpc:{function}"))?;
        let identity = state.authorize(session)?;
        if let Some(rows) = state.rpc_rows.get(function) {
            return Ok(rows.clone());
        }
        match function {
            CURRENT_LOW_QUERY => Ok(state.current_low(&identity.id)),
            PRICE_TIMELINE => Ok(state.price_timeline(&identity.id)),
            other => Err(BackendError::Rejected(format!(
                "could not find the function {other}"
            ))),
        }
    }

    async fn subscribe(&self, session: &Session, spec: ChannelSpec) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        state.enter(format!("subscribe:{}", spec.table))?;
        state.authorize(session)?;
        debug!(channel = %spec.name, table = %spec.table, "memory subscription opened");
        Ok(state.feeds.open(spec))
    }

    async fn remove_subscription(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("remove_subscription".to_string())?;
        if !state.feeds.close(id) {
            debug!(%id, "subscription already removed");
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn get_session(&self) -> Result<Option<Session>> {
        let mut state = self.state.lock().await;
        state.enter("get_session".to_string())?;
        Ok(state.current.clone())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let mut state = self.state.lock().await;
        state.enter("sign_in".to_string())?;
        let email = email.trim();
        let identity = state
            .users
            .iter()
            .find(|user| {
                user.password == password
                    && user
                        .identity
                        .email
                        .as_deref()
                        .is_some_and(|known| known.eq_ignore_ascii_case(email))
            })
            .map(|user| user.identity.clone())
            .ok_or_else(|| BackendError::Auth("Invalid login credentials".to_string()))?;
        let session = state.issue_session(identity);
        self.listeners
            .emit(AuthEventKind::SignedIn, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("sign_out".to_string())?;
        if let Some(session) = state.current.take() {
            state.access_tokens.remove(&session.access_token);
            if let Some(refresh) = &session.refresh_token {
                state.refresh_tokens.remove(refresh);
            }
        }
        self.listeners.emit(AuthEventKind::SignedOut, None).await;
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session> {
        let mut state = self.state.lock().await;
        state.enter("refresh".to_string())?;
        let current = state
            .current
            .clone()
            .ok_or_else(|| BackendError::Auth("Auth session missing!".to_string()))?;
        let identity = current
            .refresh_token
            .as_ref()
            .and_then(|token| state.refresh_tokens.remove(token))
            .ok_or_else(|| BackendError::Auth("Invalid Refresh Token".to_string()))?;
        state.access_tokens.remove(&current.access_token);
        let session = state.issue_session(identity);
        self.listeners
            .emit(AuthEventKind::TokenRefreshed, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn on_auth_state_change(&self) -> Result<AuthEvents> {
        let mut state = self.state.lock().await;
        state.enter("listen".to_string())?;
        Ok(self.listeners.register(state.current.clone()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::ChangeKind;

    async fn signed_in(backend: &MemoryBackend) -> Session {
        backend.add_user("ana@example.com", "secret").await;
        backend
            .sign_in_with_password("ana@example.com", "secret")
            .await
            .expect("sign in")
    }

    #[tokio::test]
    async fn inserts_assign_ids_and_owner() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let rows = backend
            .insert(
                &session,
                Table::Folders,
                vec![json!({"name": "Cameras"}), json!({"name": "Lenses"})],
            )
            .await
            .expect("insert");
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[1]["id"], 2);
        assert_eq!(rows[1]["user_id"], json!(session.user_id()));
    }

    #[tokio::test]
    async fn selects_only_see_the_callers_rows_and_embed_children() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let uid = session.user_id().to_string();
        backend
            .seed_rows(
                Table::Folders,
                vec![
                    json!({"id": 1, "user_id": uid, "name": "Cameras"}),
                    json!({"id": 2, "user_id": "someone-else", "name": "Hidden"}),
                ],
            )
            .await
            .expect("folders");
        backend
            .seed_rows(
                Table::Files,
                vec![
                    json!({"id": 11, "user_id": uid, "folder_id": 1, "name": "Nikon"}),
                    json!({"id": 10, "user_id": uid, "folder_id": 1, "name": "Fuji"}),
                ],
            )
            .await
            .expect("files");

        let rows = backend
            .select(
                &session,
                Query::table(Table::Folders)
                    .select("id, name, files(id, name)")
                    .eq("user_id", uid.as_str()),
            )
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["files"][0], json!({"id": 10, "name": "Fuji"}));
        assert!(rows[0].get("user_id").is_none());
    }

    #[tokio::test]
    async fn deletes_cascade_and_notify() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let uid = session.user_id().to_string();
        backend
            .seed_rows(Table::ScrapeJobs, vec![json!({"id": 5, "user_id": uid, "search_term": "x100v", "source": "ebay"})])
            .await
            .expect("jobs");
        backend
            .seed_rows(
                Table::Listings,
                vec![json!({"id": 1, "user_id": uid, "scrape_job_id": 5, "price": 900})],
            )
            .await
            .expect("listings");
        let mut feed = backend
            .subscribe(&session, ChannelSpec::owned("listings", Table::Listings, uid.as_str()))
            .await
            .expect("subscribe");

        backend
            .delete(&session, Table::ScrapeJobs, vec![Filter::eq("id", 5)])
            .await
            .expect("delete");

        assert!(backend.rows(Table::Listings).await.is_empty());
        let change = feed.events.try_recv().expect("cascade notification");
        assert_eq!(change.kind, ChangeKind::Delete);
        assert_eq!(change.old_record.expect("old")["id"], 1);
    }

    #[tokio::test]
    async fn current_low_groups_listings_per_job() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let uid = session.user_id().to_string();
        backend
            .seed_rows(
                Table::Listings,
                vec![
                    json!({"id": 1, "user_id": uid, "scrape_job_id": 5, "search_term": "x100v", "source": "ebay", "price": "1250.00", "url": "https://a", "date_inserted": "2025-03-01 10:00:00+00"}),
                    json!({"id": 2, "user_id": uid, "scrape_job_id": 5, "search_term": "x100v", "source": "ebay", "price": 1199, "url": "https://b", "condition": "used", "date_inserted": "2025-03-02T09:00:00Z"}),
                ],
            )
            .await
            .expect("listings");

        let rows = backend
            .rpc(&session, CURRENT_LOW_QUERY, json!({}))
            .await
            .expect("rpc");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["current_lowest_price"], json!(1199.0));
        assert_eq!(rows[0]["link"], "https://b");
        assert_eq!(rows[0]["offers"], 2);

        let timeline = backend
            .rpc(&session, PRICE_TIMELINE, json!({}))
            .await
            .expect("timeline");
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0]["the_date"], "2025-03-01");
    }

    #[tokio::test]
    async fn failures_are_injected_once_and_calls_counted() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        backend.fail_next("select:listings", "boom").await;

        let err = backend
            .select(&session, Query::table(Table::Listings))
            .await
            .expect_err("injected");
        assert_eq!(err.to_string(), "boom");
        backend
            .select(&session, Query::table(Table::Listings))
            .await
            .expect("second call succeeds");
        assert_eq!(backend.calls("select:listings").await, 2);
    }

    #[tokio::test]
    async fn upsert_updates_existing_row_on_conflict_column() {
        let backend = MemoryBackend::new();
        let session = signed_in(&backend).await;
        let uid = session.user_id().to_string();
        backend
            .upsert(&session, Table::AlertsData, json!({"user_id": uid, "email": "a@x"}), "user_id")
            .await
            .expect("first");
        backend
            .upsert(&session, Table::AlertsData, json!({"user_id": uid, "chat_id": "42"}), "user_id")
            .await
            .expect("second");
        let rows = backend.rows(Table::AlertsData).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["email"], "a@x");
        assert_eq!(rows[0]["chat_id"], "42");
    }

    #[tokio::test]
    async fn auth_events_follow_sign_in_refresh_and_sign_out() {
        let backend = MemoryBackend::new();
        backend.add_user("ana@example.com", "secret").await;
        let mut events = backend.on_auth_state_change().await.expect("listen");
        assert_eq!(events.recv().await.expect("initial").kind, AuthEventKind::InitialSession);

        let err = backend
            .sign_in_with_password("ana@example.com", "wrong")
            .await
            .expect_err("bad password");
        assert_eq!(err.to_string(), "Invalid login credentials");

        let first = backend
            .sign_in_with_password("ANA@example.com", "secret")
            .await
            .expect("sign in");
        assert_eq!(events.recv().await.expect("signed in").kind, AuthEventKind::SignedIn);

        let refreshed = backend.refresh_session().await.expect("refresh");
        assert_ne!(refreshed.access_token, first.access_token);
        assert_eq!(events.recv().await.expect("refreshed").kind, AuthEventKind::TokenRefreshed);
        assert!(matches!(
            backend.select(&first, Query::table(Table::Folders)).await,
            Err(BackendError::Unauthorized)
        ));
        assert!(backend
            .select(&refreshed, Query::table(Table::Folders))
            .await
            .is_ok());

        backend.sign_out().await.expect("sign out");
        let signed_out = events.recv().await.expect("signed out");
        assert_eq!(signed_out.kind, AuthEventKind::SignedOut);
        assert!(signed_out.session.is_none());
        assert!(backend
            .select(&refreshed, Query::table(Table::Folders))
            .await
            .is_err());
    }
}
