//! Saved searches merged with their externally computed pricing.

use std::sync::Arc;

use pricewatch_backend::{
    decode_rows, Backend, BackendError, ChannelSpec, Filter, Query, Table, CURRENT_LOW_QUERY,
};
use pricewatch_core::{Change, PriceRow, RowChange, RowId, Session, Term, TermDraft, TermRow};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{FetchOutcome, Result, StoreError};
use crate::live::{decode_change, open_channel, ChannelSet, Journal, LiveRows, LoadFlags, Sequencer};

#[derive(Debug, Default)]
struct TermState {
    terms: LiveRows<Term>,
    flags: LoadFlags,
    journal: Journal<Change<Term>>,
    prices: Sequencer,
    /// Latest session seen, used by background price refreshes.
    session: Option<Session>,
}

/// Merges a price snapshot into the terms it matches. Returns the number of
/// (price row, term) matches.
pub fn merge_prices(terms: &mut LiveRows<Term>, prices: &[PriceRow]) -> usize {
    let mut matched = 0;
    for price in prices {
        terms.update_each(|term| {
            if !term.matches_price(price) {
                return false;
            }
            term.pricing.merge(price);
            matched += 1;
            true
        });
    }
    matched
}

#[derive(Clone)]
pub struct TermRegistry {
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<TermState>>,
    channels: ChannelSet,
}

impl TermRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(TermState::default())),
            channels: ChannelSet::default(),
        }
    }

    /// Loads the user's terms once per session and keeps them live.
    pub async fn fetch_all(&self, session: &Session) -> FetchOutcome {
        let epoch = {
            let mut state = self.state.write().await;
            match state.flags.begin() {
                Some(epoch) => {
                    state.journal.open();
                    state.session = Some(session.clone());
                    epoch
                }
                None => {
                    debug!("terms already loaded or loading");
                    return FetchOutcome::Skipped;
                }
            }
        };

        let mut opened = Vec::new();
        match self.load(session, epoch, &mut opened).await {
            Ok(Some(count)) => {
                info!(count, "terms loaded");
                FetchOutcome::Loaded
            }
            Ok(None) => {
                debug!("session changed while loading terms; discarding");
                self.channels.close_only(&self.backend, &opened).await;
                FetchOutcome::Skipped
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to load terms");
                self.channels.close_only(&self.backend, &opened).await;
                let mut state = self.state.write().await;
                if state.flags.is_current(epoch) {
                    state.terms.clear();
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
        let definitions = open_channel(
            &self.backend,
            session,
            ChannelSpec::owned(format!("scrape_jobs:{owner}"), Table::ScrapeJobs, owner),
            move |change| {
                let store = store.clone();
                async move { store.apply_change(change).await }
            },
        )
        .await?;
        opened.push(self.channels.add(definitions).await);

        let store = self.clone();
        let listings = open_channel(
            &self.backend,
            session,
            ChannelSpec::owned(format!("scrape_jobs_listings:{owner}"), Table::Listings, owner),
            move |_change| {
                let store = store.clone();
                async move {
                    let Some(session) = store.state.read().await.session.clone() else {
                        return;
                    };
                    if let FetchOutcome::Failed(message) = store.refresh_prices(&session).await {
                        debug!(error = %message, "price refresh after listing change failed");
                    }
                }
            },
        )
        .await?;
        opened.push(self.channels.add(listings).await);

        let rows = self
            .backend
            .select(
                session,
                Query::table(Table::ScrapeJobs)
                    .eq("user_id", owner)
                    .order("id", true),
            )
            .await?;
        let rows: Vec<TermRow> = decode_rows(Table::ScrapeJobs.as_str(), rows)?;
        let count = rows.len();

        {
            let mut state = self.state.write().await;
            if !state.flags.is_current(epoch) {
                return Ok(None);
            }
            state.terms.replace_all(rows.into_iter().map(Term::from).collect());
            let replay = state.journal.close();
            if !replay.is_empty() {
                debug!(events = replay.len(), "replaying term changes seen during snapshot");
            }
            for change in replay {
                state.terms.apply(change);
            }
        }

        if !self.merge_price_snapshot(session, Some(epoch)).await? {
            debug!("initial price snapshot superseded");
        }

        let mut state = self.state.write().await;
        if !state.flags.is_current(epoch) {
            return Ok(None);
        }
        state.flags.finish_ok();
        Ok(Some(count))
    }

    async fn apply_change(&self, change: RowChange) {
        let Some(change) = decode_change::<TermRow>(&change) else {
            return;
        };
        let change = match change {
            Change::Upsert(row) => Change::Upsert(Term::from(row)),
            Change::Delete(id) => Change::Delete(id),
        };
        let mut state = self.state.write().await;
        state.journal.record(change.clone());
        state.terms.apply(change);
    }

    /// Re-fetches the price snapshot and merges it.
    pub async fn refresh_prices(&self, session: &Session) -> FetchOutcome {
        match self.merge_price_snapshot(session, None).await {
            Ok(true) => FetchOutcome::Loaded,
            Ok(false) => FetchOutcome::Skipped,
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to refresh prices");
                self.state.write().await.flags.error = Some(message.clone());
                FetchOutcome::Failed(message)
            }
        }
    }

    /// Tickets are tied to the load epoch: a reset invalidates the snapshot
    /// even when it lands before the ticket is issued.
    async fn merge_price_snapshot(&self, session: &Session, epoch: Option<u64>) -> Result<bool> {
        let (epoch, ticket) = {
            let mut state = self.state.write().await;
            let epoch = epoch.unwrap_or_else(|| state.flags.epoch());
            if !state.flags.is_current(epoch) {
                debug!(epoch, "cache reset before price snapshot");
                return Ok(false);
            }
            (epoch, state.prices.issue())
        };
        let rows = self
            .backend
            .rpc(session, CURRENT_LOW_QUERY, json!({}))
            .await?;
        let prices: Vec<PriceRow> = decode_rows(CURRENT_LOW_QUERY, rows)?;

        let mut state = self.state.write().await;
        if !state.flags.is_current(epoch) || !state.prices.admit(ticket) {
            debug!(ticket, "discarding stale price snapshot");
            return Ok(false);
        }
        let matched = merge_prices(&mut state.terms, &prices);
        debug!(ticket, rows = prices.len(), matched, "merged price snapshot");
        Ok(true)
    }

    /// Hands a newer session (for example after a token refresh) to the
    /// background price refreshes.
    pub async fn use_session(&self, session: &Session) {
        let mut state = self.state.write().await;
        if state.session.is_some() {
            state.session = Some(session.clone());
        }
    }

    pub async fn add_term(&self, session: &Session, draft: TermDraft) -> Result<Term> {
        if draft.term.trim().is_empty() || draft.marketplace.trim().is_empty() {
            return Err(StoreError::Precondition(
                "search term and marketplace are required".to_string(),
            ));
        }
        let rows = match self
            .backend
            .insert(session, Table::ScrapeJobs, vec![draft.to_row(session.user_id())])
            .await
        {
            Ok(rows) => rows,
            Err(err) => return Err(self.write_failed("add term", err).await),
        };
        let row = decode_rows::<TermRow>(Table::ScrapeJobs.as_str(), rows)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Rejected("insert returned no term".to_string()))?;
        let term = Term::from(row);
        info!(term_id = term.id, "term added");

        let mut state = self.state.write().await;
        state.terms.apply(Change::Upsert(term.clone()));
        Ok(state.terms.get(term.id).cloned().unwrap_or(term))
    }

    pub async fn remove_term(&self, session: &Session, id: RowId) -> Result<()> {
        let filters = vec![Filter::eq("id", id), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self.backend.delete(session, Table::ScrapeJobs, filters).await {
            return Err(self.write_failed("remove term", err).await);
        }
        info!(term_id = id, "term removed");
        self.state.write().await.terms.apply(Change::Delete(id));
        Ok(())
    }

    async fn write_failed(&self, action: &str, err: BackendError) -> StoreError {
        error!(action, error = %err, "term write failed");
        self.state.write().await.flags.error = Some(err.to_string());
        StoreError::Backend(err)
    }

    pub async fn all(&self) -> Vec<Term> {
        self.state.read().await.terms.rows().to_vec()
    }

    pub async fn get(&self, id: RowId) -> Option<Term> {
        self.state.read().await.terms.get(id).cloned()
    }

    pub async fn by_marketplace(&self, marketplace: &str) -> Vec<Term> {
        self.state
            .read()
            .await
            .terms
            .rows()
            .iter()
            .filter(|term| term.marketplace == marketplace)
            .cloned()
            .collect()
    }

    pub async fn by_file(&self, file_id: RowId) -> Vec<Term> {
        self.state
            .read()
            .await
            .terms
            .rows()
            .iter()
            .filter(|term| term.file_id == Some(file_id))
            .cloned()
            .collect()
    }

    pub async fn flags(&self) -> LoadFlags {
        self.state.read().await.flags.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.terms.version()
    }

    /// Drops subscriptions, then clears the cache.
    pub async fn reset(&self) {
        self.channels.close_all(&self.backend).await;
        let mut state = self.state.write().await;
        state.terms.clear();
        state.journal.close();
        state.prices.reset();
        state.session = None;
        state.flags.reset();
        debug!("term cache reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, signed_in};
    use pricewatch_backend::{AuthProvider, MemoryBackend};
    use serde_json::Value as JsonValue;

    fn job(id: RowId, owner: &str, term: &str, source: &str) -> JsonValue {
        json!({"id": id, "user_id": owner, "file_id": 1, "source": source, "search_term": term})
    }

    async fn seeded() -> (Arc<MemoryBackend>, Session, TermRegistry) {
        let (backend, session) = signed_in().await;
        let owner = session.user_id().to_string();
        backend
            .seed_rows(
                Table::ScrapeJobs,
                vec![
                    job(1, &owner, "A", "m1"),
                    job(2, &owner, "B", "m2"),
                    job(3, "other", "C", "m1"),
                ],
            )
            .await
            .expect("seed");
        let registry = TermRegistry::new(backend.clone());
        (backend, session, registry)
    }

    #[tokio::test]
    async fn fetch_all_loads_user_terms_and_merges_prices() {
        let (backend, session, registry) = seeded().await;
        backend
            .set_rpc_rows(
                CURRENT_LOW_QUERY,
                vec![
                    json!({"search_term": "A", "source": "m1", "current_lowest_price": 100, "offers": 3}),
                    json!({"search_term": "Z", "source": "m9", "current_lowest_price": 1}),
                ],
            )
            .await;

        assert_eq!(registry.fetch_all(&session).await, FetchOutcome::Loaded);
        let terms = registry.all().await;
        assert_eq!(terms.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        let a = registry.get(1).await.expect("term 1");
        assert_eq!(a.pricing.lowest_price, Some(100.0));
        assert_eq!(a.pricing.current_price, Some(100.0));
        assert_eq!(a.pricing.offer_count, Some(3));
        assert!(registry.flags().await.loaded);
    }

    #[tokio::test]
    async fn second_fetch_is_skipped_without_network() {
        let (backend, session, registry) = seeded().await;
        let (first, second) =
            tokio::join!(registry.fetch_all(&session), registry.fetch_all(&session));
        assert_eq!(first, FetchOutcome::Loaded);
        assert_eq!(second, FetchOutcome::Skipped);
        assert_eq!(registry.fetch_all(&session).await, FetchOutcome::Skipped);
        assert_eq!(backend.calls("select:scrape_jobs").await, 1);
    }

    #[tokio::test]
    async fn price_refreshes_lower_but_never_raise_the_low() {
        let (backend, session, registry) = seeded().await;
        backend
            .set_rpc_rows(CURRENT_LOW_QUERY, vec![json!({"search_term": "A", "source": "m1", "current_lowest_price": 100})])
            .await;
        assert!(registry.fetch_all(&session).await.is_loaded());

        backend
            .set_rpc_rows(CURRENT_LOW_QUERY, vec![json!({"search_term": "A", "source": "m1", "current_lowest_price": 150})])
            .await;
        assert_eq!(registry.refresh_prices(&session).await, FetchOutcome::Loaded);
        let a = registry.get(1).await.expect("term");
        assert_eq!(a.pricing.lowest_price, Some(100.0));
        assert_eq!(a.pricing.current_price, Some(150.0));
    }

    #[tokio::test]
    async fn read_failure_records_error_and_clears() {
        let (backend, session, registry) = seeded().await;
        backend.fail_next("select:scrape_jobs", "connection reset").await;
        assert_eq!(
            registry.fetch_all(&session).await,
            FetchOutcome::Failed("connection reset".to_string())
        );
        let flags = registry.flags().await;
        assert!(!flags.loaded);
        assert_eq!(flags.error.as_deref(), Some("connection reset"));
        assert!(registry.all().await.is_empty());
        assert_eq!(backend.subscription_count().await, 0);

        assert!(registry.fetch_all(&session).await.is_loaded());
    }

    #[tokio::test]
    async fn changefeed_keeps_terms_live_and_preserves_pricing() {
        let (backend, session, registry) = seeded().await;
        backend
            .set_rpc_rows(CURRENT_LOW_QUERY, vec![json!({"scrape_job_id": 1, "search_term": "A", "source": "m1", "current_lowest_price": 80})])
            .await;
        assert!(registry.fetch_all(&session).await.is_loaded());

        backend
            .update(
                &session,
                Table::ScrapeJobs,
                vec![Filter::eq("id", 1)],
                json!({"exclude_zoom": true}),
            )
            .await
            .expect("update");
        backend
            .ingest(Table::ScrapeJobs, job(9, session.user_id(), "N", "m3"))
            .await
            .expect("ingest");
        backend
            .delete(&session, Table::ScrapeJobs, vec![Filter::eq("id", 2)])
            .await
            .expect("delete");

        let watched = registry.clone();
        eventually(|| {
            let registry = watched.clone();
            async move {
                let ids: Vec<RowId> = registry.all().await.iter().map(|t| t.id).collect();
                ids == vec![1, 9]
            }
        })
        .await;
        let a = registry.get(1).await.expect("term 1");
        assert!(a.prime_only);
        assert_eq!(a.pricing.lowest_price, Some(80.0));
    }

    #[tokio::test]
    async fn listing_changes_trigger_a_price_refetch() {
        let (backend, session, registry) = seeded().await;
        assert!(registry.fetch_all(&session).await.is_loaded());
        assert_eq!(backend.calls("rpc:current_low_query").await, 1);

        backend
            .ingest(
                Table::Listings,
                json!({"user_id": session.user_id(), "scrape_job_id": 2, "search_term": "B", "source": "m2", "price": 42}),
            )
            .await
            .expect("listing");

        let watched = registry.clone();
        eventually(|| {
            let registry = watched.clone();
            async move {
                registry
                    .get(2)
                    .await
                    .and_then(|t| t.pricing.lowest_price)
                    == Some(42.0)
            }
        })
        .await;
        assert!(backend.calls("rpc:current_low_query").await >= 2);
    }

    #[tokio::test]
    async fn price_snapshot_of_a_reset_load_is_discarded() {
        let (backend, session, registry) = seeded().await;
        assert!(registry.fetch_all(&session).await.is_loaded());
        let stale = registry.state.read().await.flags.epoch();
        registry.reset().await;
        assert!(registry.fetch_all(&session).await.is_loaded());
        let calls = backend.calls("rpc:current_low_query").await;

        let merged = registry
            .merge_price_snapshot(&session, Some(stale))
            .await
            .expect("no backend error");
        assert!(!merged);
        assert_eq!(backend.calls("rpc:current_low_query").await, calls);
        assert_eq!(registry.refresh_prices(&session).await, FetchOutcome::Loaded);
    }

    #[tokio::test]
    async fn listing_refreshes_use_the_latest_session() {
        let (backend, session, registry) = seeded().await;
        assert!(registry.fetch_all(&session).await.is_loaded());
        let refreshed = backend.refresh_session().await.expect("refresh");
        registry.use_session(&refreshed).await;

        backend
            .ingest(
                Table::Listings,
                json!({"user_id": session.user_id(), "scrape_job_id": 1, "search_term": "A", "source": "m1", "price": 7}),
            )
            .await
            .expect("listing");

        let watched = registry.clone();
        eventually(|| {
            let registry = watched.clone();
            async move {
                registry.get(1).await.and_then(|t| t.pricing.lowest_price) == Some(7.0)
            }
        })
        .await;
        assert!(registry.flags().await.error.is_none());
    }

    #[tokio::test]
    async fn add_and_remove_apply_locally() {
        let (backend, session, registry) = seeded().await;
        assert!(registry.fetch_all(&session).await.is_loaded());

        let err = registry
            .add_term(
                &session,
                TermDraft {
                    marketplace: "ebay".into(),
                    term: "  ".into(),
                    ..TermDraft::default()
                },
            )
            .await
            .expect_err("empty term");
        assert!(matches!(err, StoreError::Precondition(_)));
        assert_eq!(backend.calls("insert:scrape_jobs").await, 0);

        let added = registry
            .add_term(
                &session,
                TermDraft {
                    marketplace: "ebay".into(),
                    term: " Leica Q2 ".into(),
                    prime_only: true,
                    file_id: Some(3),
                    ..TermDraft::default()
                },
            )
            .await
            .expect("add");
        assert_eq!(added.term, "Leica Q2");
        assert_eq!(registry.by_file(3).await.len(), 1);
        assert_eq!(registry.by_marketplace("ebay").await.len(), 1);

        registry.remove_term(&session, 1).await.expect("remove");
        assert!(registry.get(1).await.is_none());
    }

    #[tokio::test]
    async fn write_failure_leaves_cache_untouched() {
        let (backend, session, registry) = seeded().await;
        assert!(registry.fetch_all(&session).await.is_loaded());
        backend.fail_next("delete:scrape_jobs", "permission denied").await;

        let err = registry.remove_term(&session, 1).await.expect_err("write fails");
        assert_eq!(err.to_string(), "permission denied");
        assert!(registry.get(1).await.is_some());
        assert_eq!(registry.flags().await.error.as_deref(), Some("permission denied"));
    }

    #[tokio::test]
    async fn reset_removes_subscriptions_and_data() {
        let (backend, session, registry) = seeded().await;
        assert!(registry.fetch_all(&session).await.is_loaded());
        assert_eq!(backend.subscription_count().await, 2);

        registry.reset().await;
        assert_eq!(backend.subscription_count().await, 0);
        assert!(registry.all().await.is_empty());
        assert!(!registry.flags().await.loaded);
    }
}
