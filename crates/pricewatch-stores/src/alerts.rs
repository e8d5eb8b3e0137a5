//! Per-term notification toggles and the user's delivery contact.

use std::sync::Arc;

use futures::future::try_join_all;
use pricewatch_backend::{decode_rows, Backend, Filter, Query, Table};
use pricewatch_core::{AlertContact, AlertSetting, AlertToggles, RowId, Session, TermRow};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::error::{FetchOutcome, Result, StoreError};

const ALERT_COLUMNS: &str = "id, file_id, source, search_term, alert_email, telegram_alert";

#[derive(Debug, Default)]
struct AlertState {
    settings: Vec<AlertSetting>,
    contact: AlertContact,
    loading: bool,
    error: Option<String>,
}

#[derive(Clone)]
pub struct AlertPreferences {
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<AlertState>>,
}

impl AlertPreferences {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(AlertState::default())),
        }
    }

    /// Loads the toggles of every term in one file and marketplace. Each call
    /// replaces the previous view.
    pub async fn fetch_alerts(
        &self,
        session: &Session,
        file_id: RowId,
        marketplace: &str,
    ) -> FetchOutcome {
        {
            let mut state = self.state.write().await;
            state.loading = true;
            state.error = None;
        }
        let query = Query::table(Table::ScrapeJobs)
            .select(ALERT_COLUMNS)
            .eq("user_id", session.user_id())
            .eq("file_id", file_id)
            .eq("source", marketplace)
            .order("id", true);
        let result = match self.backend.select(session, query).await {
            Ok(rows) => decode_rows::<TermRow>(Table::ScrapeJobs.as_str(), rows),
            Err(err) => Err(err),
        };

        let mut state = self.state.write().await;
        state.loading = false;
        match result {
            Ok(rows) => {
                state.settings = rows.into_iter().map(AlertSetting::from).collect();
                info!(file_id, marketplace, count = state.settings.len(), "alert settings loaded");
                FetchOutcome::Loaded
            }
            Err(err) => {
                let message = err.to_string();
                error!(file_id, marketplace, error = %message, "failed to load alert settings");
                state.settings.clear();
                state.error = Some(message.clone());
                FetchOutcome::Failed(message)
            }
        }
    }

    pub async fn update_alert(
        &self,
        session: &Session,
        term_id: RowId,
        toggles: AlertToggles,
    ) -> Result<AlertSetting> {
        let setting = match self.write_toggles(session, term_id, toggles).await {
            Ok(setting) => setting,
            Err(err) => return Err(self.write_failed(err).await),
        };
        let mut state = self.state.write().await;
        match state.settings.iter_mut().find(|existing| existing.id == term_id) {
            Some(existing) => *existing = setting.clone(),
            None => debug!(term_id, "updated term is outside the loaded view"),
        }
        info!(
            term_id,
            email = toggles.email_alert,
            telegram = toggles.telegram_alert,
            "alert updated"
        );
        Ok(setting)
    }

    /// Writes every setting concurrently. The local list becomes `settings`
    /// only when all of them succeed.
    pub async fn update_all(&self, session: &Session, settings: Vec<AlertSetting>) -> Result<()> {
        let writes = settings
            .iter()
            .map(|setting| self.write_toggles(session, setting.id, setting.toggles()));
        if let Err(err) = try_join_all(writes).await {
            return Err(self.write_failed(err).await);
        }
        let count = settings.len();
        self.state.write().await.settings = settings;
        info!(count, "alert settings saved");
        Ok(())
    }

    async fn write_toggles(
        &self,
        session: &Session,
        term_id: RowId,
        toggles: AlertToggles,
    ) -> Result<AlertSetting> {
        let filters = vec![Filter::eq("id", term_id), Filter::eq("user_id", session.user_id())];
        let rows = self
            .backend
            .update(session, Table::ScrapeJobs, filters, toggles.to_patch())
            .await?;
        let rows: Vec<TermRow> = decode_rows(Table::ScrapeJobs.as_str(), rows)?;
        rows.into_iter()
            .next()
            .map(AlertSetting::from)
            .ok_or(StoreError::NotFound {
                entity: "term",
                id: term_id,
            })
    }

    pub async fn fetch_contact(&self, session: &Session) -> FetchOutcome {
        let query = Query::table(Table::AlertsData)
            .select("chat_id, email")
            .eq("user_id", session.user_id());
        let result = match self.backend.select(session, query).await {
            Ok(rows) => decode_rows::<AlertContact>(Table::AlertsData.as_str(), rows),
            Err(err) => Err(err),
        };
        let mut state = self.state.write().await;
        match result {
            Ok(rows) => {
                state.contact = rows.into_iter().next().unwrap_or_default();
                FetchOutcome::Loaded
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to load alert contact");
                state.contact = AlertContact::default();
                state.error = Some(message.clone());
                FetchOutcome::Failed(message)
            }
        }
    }

    pub async fn save_contact(&self, session: &Session, contact: AlertContact) -> Result<()> {
        let row = json!({
            "user_id": session.user_id(),
            "chat_id": contact.chat_id.trim(),
            "email": contact.email.trim(),
        });
        if let Err(err) = self
            .backend
            .upsert(session, Table::AlertsData, row, "user_id")
            .await
        {
            return Err(self.write_failed(err.into()).await);
        }
        self.state.write().await.contact = AlertContact {
            chat_id: contact.chat_id.trim().to_string(),
            email: contact.email.trim().to_string(),
        };
        info!("alert contact saved");
        Ok(())
    }

    async fn write_failed(&self, err: StoreError) -> StoreError {
        error!(error = %err, "alert write failed");
        self.state.write().await.error = Some(err.to_string());
        err
    }

    pub async fn settings(&self) -> Vec<AlertSetting> {
        self.state.read().await.settings.clone()
    }

    pub async fn contact(&self) -> AlertContact {
        self.state.read().await.contact.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub async fn reset(&self) {
        *self.state.write().await = AlertState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::signed_in;
    use pricewatch_backend::MemoryBackend;

    async fn seeded() -> (Arc<MemoryBackend>, Session, AlertPreferences) {
        let (backend, session) = signed_in().await;
        let owner = session.user_id().to_string();
        backend
            .seed_rows(
                Table::ScrapeJobs,
                vec![
                    json!({"id": 1, "user_id": owner, "file_id": 7, "source": "ebay", "search_term": "a", "alert_email": true}),
                    json!({"id": 2, "user_id": owner, "file_id": 7, "source": "ebay", "search_term": "b", "telegram_alert": true}),
                    json!({"id": 3, "user_id": owner, "file_id": 7, "source": "amazon", "search_term": "c"}),
                    json!({"id": 4, "user_id": owner, "file_id": 8, "source": "ebay", "search_term": "d"}),
                ],
            )
            .await
            .expect("seed");
        let alerts = AlertPreferences::new(backend.clone());
        (backend, session, alerts)
    }

    #[tokio::test]
    async fn fetch_filters_by_file_and_marketplace() {
        let (_backend, session, alerts) = seeded().await;
        assert!(alerts.fetch_alerts(&session, 7, "ebay").await.is_loaded());
        let settings = alerts.settings().await;
        assert_eq!(settings.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(settings[0].email_alert && !settings[0].telegram_alert);
        assert_eq!(settings[1].term, "b");

        assert!(alerts.fetch_alerts(&session, 7, "amazon").await.is_loaded());
        assert_eq!(alerts.settings().await.len(), 1);
    }

    #[tokio::test]
    async fn update_alert_replaces_local_entry_with_returned_row() {
        let (backend, session, alerts) = seeded().await;
        assert!(alerts.fetch_alerts(&session, 7, "ebay").await.is_loaded());
        let updated = alerts
            .update_alert(
                &session,
                2,
                AlertToggles {
                    email_alert: true,
                    telegram_alert: false,
                },
            )
            .await
            .expect("update");
        assert!(updated.email_alert);
        assert_eq!(alerts.settings().await[1], updated);
        let stored = backend.rows(Table::ScrapeJobs).await;
        assert_eq!(stored[1]["alert_email"], json!(true));
        assert_eq!(stored[1]["telegram_alert"], json!(false));
    }

    #[tokio::test]
    async fn updating_a_term_outside_the_view_leaves_it_alone() {
        let (backend, session, alerts) = seeded().await;
        assert!(alerts.fetch_alerts(&session, 7, "ebay").await.is_loaded());
        let updated = alerts
            .update_alert(
                &session,
                3,
                AlertToggles {
                    email_alert: false,
                    telegram_alert: true,
                },
            )
            .await
            .expect("update");
        assert!(updated.telegram_alert);
        let ids: Vec<RowId> = alerts.settings().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(backend.rows(Table::ScrapeJobs).await[2]["telegram_alert"], json!(true));
    }

    #[tokio::test]
    async fn updating_a_missing_term_is_not_found() {
        let (_backend, session, alerts) = seeded().await;
        let err = alerts
            .update_alert(&session, 99, AlertToggles::default())
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound { entity: "term", id: 99 }));
    }

    #[tokio::test]
    async fn update_all_keeps_local_list_on_failure() {
        let (backend, session, alerts) = seeded().await;
        assert!(alerts.fetch_alerts(&session, 7, "ebay").await.is_loaded());
        let before = alerts.settings().await;
        let mut changed = before.clone();
        for setting in &mut changed {
            setting.telegram_alert = true;
        }

        backend.fail_next("update:scrape_jobs", "timeout").await;
        assert!(alerts.update_all(&session, changed.clone()).await.is_err());
        assert_eq!(alerts.settings().await, before);
        assert!(alerts.error().await.is_some());

        alerts.update_all(&session, changed.clone()).await.expect("save all");
        assert_eq!(alerts.settings().await, changed);
        assert_eq!(backend.calls("update:scrape_jobs").await, 3);
    }

    #[tokio::test]
    async fn contact_is_upserted_per_user() {
        let (backend, session, alerts) = seeded().await;
        assert!(alerts.fetch_contact(&session).await.is_loaded());
        assert_eq!(alerts.contact().await, AlertContact::default());

        let contact = AlertContact {
            chat_id: " 42 ".into(),
            email: "ana@example.com".into(),
        };
        alerts.save_contact(&session, contact.clone()).await.expect("save");
        alerts
            .save_contact(
                &session,
                AlertContact {
                    chat_id: "43".into(),
                    ..contact
                },
            )
            .await
            .expect("save again");
        assert_eq!(backend.rows(Table::AlertsData).await.len(), 1);

        let fresh = AlertPreferences::new(backend.clone());
        assert!(fresh.fetch_contact(&session).await.is_loaded());
        assert_eq!(fresh.contact().await.chat_id, "43");
    }
}
