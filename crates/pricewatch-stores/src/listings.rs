//! Flat cache of the user's scraped listings.

use std::sync::Arc;

use pricewatch_backend::{decode_rows, Backend, ChannelSpec, Filter, Query, Table};
use pricewatch_core::{Change, Listing, RowId, Session};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{FetchOutcome, Result, StoreError};
use crate::live::{decode_change, open_channel, ChannelSet, Journal, LiveRows, LoadFlags};

#[derive(Debug, Default)]
struct ListingState {
    listings: LiveRows<Listing>,
    flags: LoadFlags,
    journal: Journal<Change<Listing>>,
}

#[derive(Clone)]
pub struct ListingCache {
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<ListingState>>,
    channels: ChannelSet,
}

impl ListingCache {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(ListingState::default())),
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
                    debug!("listings already loaded or loading");
                    return FetchOutcome::Skipped;
                }
            }
        };

        let mut opened = Vec::new();
        match self.load(session, epoch, &mut opened).await {
            Ok(Some(count)) => {
                info!(count, "listings loaded");
                FetchOutcome::Loaded
            }
            Ok(None) => {
                self.channels.close_only(&self.backend, &opened).await;
                FetchOutcome::Skipped
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to load listings");
                self.channels.close_only(&self.backend, &opened).await;
                let mut state = self.state.write().await;
                if state.flags.is_current(epoch) {
                    state.listings.clear();
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
            ChannelSpec::owned(format!("listings:{owner}"), Table::Listings, owner),
            move |change| {
                let store = store.clone();
                async move {
                    if let Some(change) = decode_change::<Listing>(&change) {
                        let mut state = store.state.write().await;
                        state.journal.record(change.clone());
                        state.listings.apply(change);
                    }
                }
            },
        )
        .await?;
        opened.push(self.channels.add(channel).await);

        let rows = self
            .backend
            .select(
                session,
                Query::table(Table::Listings)
                    .eq("user_id", owner)
                    .order("search_term", false),
            )
            .await?;
        let rows: Vec<Listing> = decode_rows(Table::Listings.as_str(), rows)?;
        let count = rows.len();

        let mut state = self.state.write().await;
        if !state.flags.is_current(epoch) {
            return Ok(None);
        }
        state.listings.replace_all(rows);
        for change in state.journal.close() {
            state.listings.apply(change);
        }
        state.flags.finish_ok();
        Ok(Some(count))
    }

    /// Deletes a cached listing. Unknown ids are a no-op returning `false`.
    pub async fn delete_listing(&self, session: &Session, id: RowId) -> Result<bool> {
        if self.state.read().await.listings.get(id).is_none() {
            debug!(listing_id = id, "listing not cached; nothing to delete");
            return Ok(false);
        }
        let filters = vec![Filter::eq("id", id), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self.backend.delete(session, Table::Listings, filters).await {
            error!(listing_id = id, error = %err, "failed to delete listing");
            self.state.write().await.flags.error = Some(err.to_string());
            return Err(StoreError::Backend(err));
        }
        self.state.write().await.listings.remove(id);
        info!(listing_id = id, "listing deleted");
        Ok(true)
    }

    pub async fn all(&self) -> Vec<Listing> {
        self.state.read().await.listings.rows().to_vec()
    }

    pub async fn for_term(&self, term_id: RowId) -> Vec<Listing> {
        self.state
            .read()
            .await
            .listings
            .rows()
            .iter()
            .filter(|listing| listing.scrape_job_id == Some(term_id))
            .cloned()
            .collect()
    }

    pub async fn flags(&self) -> LoadFlags {
        self.state.read().await.flags.clone()
    }

    pub async fn reset(&self) {
        self.channels.close_all(&self.backend).await;
        let mut state = self.state.write().await;
        state.listings.clear();
        state.journal.close();
        state.flags.reset();
        debug!("listing cache reset");
    }
}
