//! User labels attached to saved searches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use pricewatch_backend::{decode_rows, Backend, BackendError, ChannelSpec, Filter, Query, Table};
use pricewatch_core::{normalize_tags, ChangeKind, RowChange, RowId, Session, TagRow};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FetchOutcome, Result, StoreError};
use crate::live::{open_channel, ChannelSet, Journal, LoadFlags};

#[derive(Debug, Default)]
struct TagState {
    by_term: BTreeMap<RowId, Vec<String>>,
    dictionary: BTreeSet<String>,
    flags: LoadFlags,
    journal: Journal<RowChange>,
}

impl TagState {
    fn add(&mut self, term_id: RowId, tag: &str) {
        let tag = tag.trim();
        if tag.is_empty() {
            return;
        }
        let tags = self.by_term.entry(term_id).or_default();
        if let Err(pos) = tags.binary_search_by(|probe| probe.as_str().cmp(tag)) {
            tags.insert(pos, tag.to_string());
        }
        self.dictionary.insert(tag.to_string());
    }

    fn remove(&mut self, term_id: RowId, tag: &str) {
        if let Some(tags) = self.by_term.get_mut(&term_id) {
            tags.retain(|existing| existing != tag.trim());
            if tags.is_empty() {
                self.by_term.remove(&term_id);
            }
        }
    }

    fn replace(&mut self, term_id: RowId, tags: Vec<String>) {
        self.dictionary.extend(tags.iter().cloned());
        if tags.is_empty() {
            self.by_term.remove(&term_id);
        } else {
            self.by_term.insert(term_id, tags);
        }
    }

    fn apply(&mut self, change: &RowChange) {
        let old = match change.old_row::<TagRow>() {
            Ok(old) => old,
            Err(err) => {
                warn!(error = %err, "undecodable tag change");
                return;
            }
        };
        let new = match change.new_row::<TagRow>() {
            Ok(new) => new,
            Err(err) => {
                warn!(error = %err, "undecodable tag change");
                return;
            }
        };
        match change.kind {
            ChangeKind::Insert => {
                if let Some(row) = new {
                    self.add(row.scrape_job_id, &row.tag);
                }
            }
            ChangeKind::Update => {
                if let Some(row) = old {
                    self.remove(row.scrape_job_id, &row.tag);
                }
                if let Some(row) = new {
                    self.add(row.scrape_job_id, &row.tag);
                }
            }
            ChangeKind::Delete => match old {
                Some(row) => self.remove(row.scrape_job_id, &row.tag),
                None => warn!("tag delete without old row"),
            },
        }
    }
}

#[derive(Clone)]
pub struct TagIndex {
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<TagState>>,
    channels: ChannelSet,
}

impl TagIndex {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(TagState::default())),
            channels: ChannelSet::default(),
        }
    }

    pub async fn fetch_all(&self, session: &Session) -> FetchOutcome {
        let epoch = {
            let mut state = self.state.write().await;
            match state.flags.begin() {
                Some(epoch) => {
                    state.journal.open();
                    epoch
                }
                None => {
                    debug!("tags already loaded or loading");
                    return FetchOutcome::Skipped;
                }
            }
        };

        let mut opened = Vec::new();
        match self.load(session, epoch, &mut opened).await {
            Ok(Some(count)) => {
                info!(count, "tags loaded");
                FetchOutcome::Loaded
            }
            Ok(None) => {
                self.channels.close_only(&self.backend, &opened).await;
                FetchOutcome::Skipped
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to load tags");
                self.channels.close_only(&self.backend, &opened).await;
                let mut state = self.state.write().await;
                if state.flags.is_current(epoch) {
                    state.by_term.clear();
                    state.dictionary.clear();
                    state.journal.close();
                    state.flags.finish_err(message.clone());
                }
                FetchOutcome::Failed(message)
            }
        }
    }

    async fn load(
        &self,
        session: &Session,
        epoch: u64,
        opened: &mut Vec<Uuid>,
    ) -> Result<Option<usize>> {
        let owner = session.user_id();
        let store = self.clone();
        let channel = open_channel(
            &self.backend,
            session,
            ChannelSpec::owned(format!("search_tags:{owner}"), Table::SearchTags, owner),
            move |change| {
                let store = store.clone();
                async move {
                    let mut state = store.state.write().await;
                    state.journal.record(change.clone());
                    state.apply(&change);
                }
            },
        )
        .await?;
        opened.push(self.channels.add(channel).await);

        let rows = self
            .backend
            .select(
                session,
                Query::table(Table::SearchTags)
                    .select("scrape_job_id, tag")
                    .eq("user_id", owner),
            )
            .await?;
        let rows: Vec<TagRow> = decode_rows(Table::SearchTags.as_str(), rows)?;
        let count = rows.len();

        let mut state = self.state.write().await;
        if !state.flags.is_current(epoch) {
            return Ok(None);
        }
        state.by_term.clear();
        state.dictionary.clear();
        for row in &rows {
            state.add(row.scrape_job_id, &row.tag);
        }
        for change in state.journal.close() {
            state.apply(&change);
        }
        state.flags.finish_ok();
        Ok(Some(count))
    }

    /// Reloads one term's labels.
    pub async fn refresh_term(&self, session: &Session, term_id: RowId) -> FetchOutcome {
        let result = async {
            let rows = self
                .backend
                .select(
                    session,
                    Query::table(Table::SearchTags)
                        .select("scrape_job_id, tag")
                        .eq("scrape_job_id", term_id)
                        .eq("user_id", session.user_id()),
                )
                .await?;
            decode_rows::<TagRow>(Table::SearchTags.as_str(), rows)
        }
        .await;

        match result {
            Ok(rows) => {
                let tags = normalize_tags(rows.iter().map(|row| row.tag.as_str()));
                self.state.write().await.replace(term_id, tags);
                FetchOutcome::Loaded
            }
            Err(err) => {
                let message = err.to_string();
                error!(term_id, error = %message, "failed to refresh tags");
                self.state.write().await.flags.error = Some(message.clone());
                FetchOutcome::Failed(message)
            }
        }
    }

    /// Replaces a term's labels; returns the normalized list that was stored.
    pub async fn set_tags(
        &self,
        session: &Session,
        term_id: RowId,
        tags: &[String],
    ) -> Result<Vec<String>> {
        let normalized = normalize_tags(tags);
        let owner = session.user_id();

        let filters = vec![Filter::eq("scrape_job_id", term_id), Filter::eq("user_id", owner)];
        if let Err(err) = self.backend.delete(session, Table::SearchTags, filters).await {
            return Err(self.write_failed("clear tags", err).await);
        }
        if !normalized.is_empty() {
            let rows = normalized
                .iter()
                .map(|tag| json!({ "scrape_job_id": term_id, "tag": tag, "user_id": owner }))
                .collect();
            if let Err(err) = self.backend.insert(session, Table::SearchTags, rows).await {
                return Err(self.write_failed("insert tags", err).await);
            }
        }

        info!(term_id, count = normalized.len(), "tags saved");
        self.state.write().await.replace(term_id, normalized.clone());
        Ok(normalized)
    }

    /// Removes a label from every term of the user.
    pub async fn delete_tag(&self, session: &Session, tag: &str) -> Result<()> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(StoreError::Precondition("tag cannot be empty".to_string()));
        }
        let filters = vec![Filter::eq("tag", tag), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self.backend.delete(session, Table::SearchTags, filters).await {
            return Err(self.write_failed("delete tag", err).await);
        }

        let mut state = self.state.write().await;
        state.dictionary.remove(tag);
        state.by_term.retain(|_, tags| {
            tags.retain(|existing| existing != tag);
            !tags.is_empty()
        });
        info!(tag, "tag deleted");
        Ok(())
    }

    async fn write_failed(&self, action: &str, err: BackendError) -> StoreError {
        error!(action, error = %err, "tag write failed");
        self.state.write().await.flags.error = Some(err.to_string());
        StoreError::Backend(err)
    }

    pub async fn tags_for(&self, term_id: RowId) -> Vec<String> {
        self.state
            .read()
            .await
            .by_term
            .get(&term_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every label the user has used, sorted.
    pub async fn all_tags(&self) -> Vec<String> {
        self.state.read().await.dictionary.iter().cloned().collect()
    }

    pub async fn terms_with_tag(&self, tag: &str) -> Vec<RowId> {
        self.state
            .read()
            .await
            .by_term
            .iter()
            .filter(|(_, tags)| tags.iter().any(|t| t == tag))
            .map(|(term_id, _)| *term_id)
            .collect()
    }

    pub async fn flags(&self) -> LoadFlags {
        self.state.read().await.flags.clone()
    }

    pub async fn reset(&self) {
        self.channels.close_all(&self.backend).await;
        let mut state = self.state.write().await;
        state.by_term.clear();
        state.dictionary.clear();
        state.journal.close();
        state.flags.reset();
        debug!("tag cache reset");
    }
}
