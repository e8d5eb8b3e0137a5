//! Owns every store and ties their lifetime to the signed-in identity.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use pricewatch_backend::{AuthProvider, Backend, LocalStateStore, MemoryBackend, RestBackend};
use pricewatch_core::Session;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{FetchOutcome, Result, StoreError};
use crate::{
    AlertPreferences, AuthSession, ClientConfig, FolderTree, ListingCache, TagIndex,
    TermRegistry, TimelineAggregator,
};

#[derive(Clone)]
pub struct Dashboard {
    pub auth: AuthSession,
    pub terms: TermRegistry,
    pub tags: TagIndex,
    pub listings: ListingCache,
    pub alerts: AlertPreferences,
    pub folders: FolderTree,
    pub timeline: TimelineAggregator,
    watcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// The caches reset on sign-out. Auth itself is not part of it.
#[derive(Clone)]
struct Caches {
    terms: TermRegistry,
    tags: TagIndex,
    listings: ListingCache,
    alerts: AlertPreferences,
    folders: FolderTree,
    timeline: TimelineAggregator,
}

impl Caches {
    async fn reset(&self) {
        tokio::join!(
            self.terms.reset(),
            self.tags.reset(),
            self.listings.reset(),
            self.alerts.reset(),
            self.folders.reset(),
            self.timeline.reset(),
        );
    }
}

impl Dashboard {
    pub fn new(
        backend: Arc<dyn Backend>,
        provider: Arc<dyn AuthProvider>,
        local: Option<LocalStateStore>,
    ) -> Self {
        Self {
            auth: AuthSession::new(provider),
            terms: TermRegistry::new(backend.clone()),
            tags: TagIndex::new(backend.clone()),
            listings: ListingCache::new(backend.clone()),
            alerts: AlertPreferences::new(backend.clone()),
            folders: FolderTree::new(backend.clone(), local),
            timeline: TimelineAggregator::new(backend),
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// HTTP backend when a URL is configured, otherwise the in-memory backend
    /// seeded from the fixture file.
    pub async fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let local = config.local_state();
        match config.rest_config() {
            Some(rest) => {
                info!(url = %rest.base_url, "using http backend");
                let backend = Arc::new(RestBackend::new(rest)?);
                backend
                    .restore_session()
                    .await
                    .context("restoring persisted session")?;
                Ok(Self::new(backend.clone(), backend, Some(local)))
            }
            None => {
                info!(fixture = %config.fixture_path.display(), "using in-memory backend");
                let fixture = &config.fixture_path;
                let backend = Arc::new(
                    MemoryBackend::from_fixture(fixture)
                        .with_context(|| format!("seeding from {}", fixture.display()))?,
                );
                Ok(Self::new(backend.clone(), backend, Some(local)))
            }
        }
    }

    fn caches(&self) -> Caches {
        Caches {
            terms: self.terms.clone(),
            tags: self.tags.clone(),
            listings: self.listings.clone(),
            alerts: self.alerts.clone(),
            folders: self.folders.clone(),
            timeline: self.timeline.clone(),
        }
    }

    /// Restores folder expansion, initializes auth and starts resetting the
    /// caches whenever the identity goes away or changes user.
    pub async fn start(&self) -> bool {
        if let Err(err) = self.folders.restore_expansion().await {
            warn!(error = %err, "could not restore folder expansion");
        }
        let initialized = self.auth.init().await;

        let mut watcher = self.watcher.lock().await;
        if watcher.is_none() {
            let mut identity = self.auth.identity();
            let caches = self.caches();
            *watcher = Some(tokio::spawn(async move {
                let mut current = identity.borrow_and_update().as_ref().map(|user| user.id.clone());
                while identity.changed().await.is_ok() {
                    let next = identity.borrow_and_update().as_ref().map(|user| user.id.clone());
                    let switched = match (&current, &next) {
                        (_, None) => true,
                        (Some(before), Some(after)) => before != after,
                        (None, Some(_)) => false,
                    };
                    if switched {
                        info!(user_id = ?next, "identity changed; resetting caches");
                        caches.reset().await;
                    }
                    current = next;
                }
            }));
        }
        initialized
    }

    /// The signed-in session, refreshed first when it has expired.
    pub async fn require_session(&self) -> Result<Session> {
        let mut session = self.auth.session().await.ok_or(StoreError::NotAuthenticated)?;
        if session.is_expired_at(Utc::now()) {
            info!("session expired; refreshing");
            if !self.auth.refresh().await {
                return Err(StoreError::NotAuthenticated);
            }
            session = self.auth.session().await.ok_or(StoreError::NotAuthenticated)?;
        }
        self.terms.use_session(&session).await;
        Ok(session)
    }

    /// Fetches everything a freshly opened dashboard shows.
    pub async fn load_all(&self, session: &Session) -> Vec<(&'static str, FetchOutcome)> {
        let (terms, tags, listings, folders, timeline) = tokio::join!(
            self.terms.fetch_all(session),
            self.tags.fetch_all(session),
            self.listings.fetch_all(session),
            self.folders.fetch_folders(session),
            self.timeline.fetch_timeline(session),
        );
        vec![
            ("terms", terms),
            ("tags", tags),
            ("listings", listings),
            ("folders", folders),
            ("timeline", timeline),
        ]
    }

    pub async fn reset_all(&self) {
        self.caches().reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, EMAIL, PASSWORD};
    use pricewatch_backend::Table;
    use serde_json::json;

    async fn dashboard() -> (Arc<MemoryBackend>, Dashboard) {
        let backend = Arc::new(MemoryBackend::new());
        let user = backend.add_user(EMAIL, PASSWORD).await;
        backend
            .seed_rows(
                Table::ScrapeJobs,
                vec![json!({"id": 1, "user_id": user.id, "search_term": "x100v", "source": "ebay"})],
            )
            .await
            .expect("seed");
        let dashboard = Dashboard::new(backend.clone(), backend.clone(), None);
        (backend, dashboard)
    }

    #[tokio::test]
    async fn operations_require_a_session() {
        let (_backend, dashboard) = dashboard().await;
        assert!(dashboard.start().await);
        assert!(matches!(
            dashboard.require_session().await,
            Err(StoreError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn logout_resets_every_cache() {
        let (backend, dashboard) = dashboard().await;
        assert!(dashboard.start().await);
        assert!(dashboard.auth.login(EMAIL, PASSWORD).await);
        let session = dashboard.require_session().await.expect("session");
        let outcomes = dashboard.load_all(&session).await;
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_loaded()), "{outcomes:?}");
        assert_eq!(dashboard.terms.all().await.len(), 1);
        assert!(backend.subscription_count().await > 0);

        assert!(dashboard.auth.logout().await);
        let watched = dashboard.clone();
        eventually(|| {
            let dashboard = watched.clone();
            async move {
                !dashboard.terms.flags().await.loaded && dashboard.terms.all().await.is_empty()
            }
        })
        .await;
        let backend_watch = backend.clone();
        eventually(|| {
            let backend = backend_watch.clone();
            async move { backend.subscription_count().await == 0 }
        })
        .await;
        assert!(!dashboard.folders.flags().await.loaded);
    }
}
