use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pricewatch_backend::{MemoryBackend, Table};
use pricewatch_core::{AlertToggles, TermDraft};
use pricewatch_stores::{Dashboard, StoreError};
use serde_json::json;

const DEMO_EMAIL: &str = "demo@pricewatch.dev";
const DEMO_PASSWORD: &str = "demo-password";

fn seed_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/demo/seed.yaml")
}

async fn demo() -> (Arc<MemoryBackend>, Dashboard) {
    let backend = Arc::new(MemoryBackend::from_fixture(&seed_path()).expect("demo seed"));
    let dashboard = Dashboard::new(backend.clone(), backend.clone(), None);
    assert!(dashboard.start().await);
    assert!(dashboard.auth.login(DEMO_EMAIL, DEMO_PASSWORD).await);
    (backend, dashboard)
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn demo_user_sees_only_their_own_data() {
    let (_backend, dashboard) = demo().await;
    let session = dashboard.require_session().await.expect("session");
    for (name, outcome) in dashboard.load_all(&session).await {
        assert!(outcome.is_loaded(), "{name}: {outcome:?}");
    }

    let terms = dashboard.terms.all().await;
    assert_eq!(terms.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    let nikon = dashboard.terms.get(1).await.expect("term 1");
    assert_eq!(nikon.pricing.current_price, Some(175.5));
    assert_eq!(nikon.pricing.lowest_price, Some(175.5));
    assert_eq!(nikon.pricing.offer_count, Some(2));
    assert_eq!(dashboard.terms.by_file(1).await.len(), 2);

    assert_eq!(dashboard.tags.all_tags().await, vec!["compact", "nikon", "prime"]);
    assert_eq!(dashboard.tags.tags_for(1).await, vec!["nikon", "prime"]);

    let folders = dashboard.folders.folders().await;
    assert_eq!(
        folders.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        vec!["cameras", "Lenses"]
    );
    assert_eq!(
        folders[1].files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        vec!["Fuji X", "Nikon Z"]
    );

    assert_eq!(dashboard.listings.all().await.len(), 4);

    let chart = dashboard.timeline.chart_data().await;
    assert_eq!(chart.dates.len(), 2);
    assert_eq!(chart.series.len(), 3);
    assert_eq!(
        chart.series["Fujifilm X100V__ebay"].min_prices,
        vec![Some(1299.0), None]
    );
}

#[tokio::test]
async fn scraped_listing_lowers_the_historical_low() {
    let (backend, dashboard) = demo().await;
    let session = dashboard.require_session().await.expect("session");
    assert!(dashboard.terms.fetch_all(&session).await.is_loaded());
    assert_eq!(
        dashboard.terms.get(3).await.expect("x100v").pricing.lowest_price,
        Some(1299.0)
    );

    backend
        .ingest(
            Table::Listings,
            json!({
                "user_id": session.user_id(),
                "scrape_job_id": 3,
                "search_term": "Fujifilm X100V",
                "source": "ebay",
                "title": "X100V black",
                "price": 1100,
                "url": "https://www.ebay.example/itm/9"
            }),
        )
        .await
        .expect("ingest");

    let terms = dashboard.terms.clone();
    wait_until(|| {
        let terms = terms.clone();
        async move {
            terms
                .get(3)
                .await
                .is_some_and(|t| t.pricing.lowest_price == Some(1100.0))
        }
    })
    .await;
    let x100v = dashboard.terms.get(3).await.expect("x100v");
    assert_eq!(x100v.pricing.current_price, Some(1100.0));
    assert_eq!(x100v.pricing.offer_count, Some(2));
}

#[tokio::test]
async fn new_terms_get_alerts_and_tags() {
    let (backend, dashboard) = demo().await;
    let session = dashboard.require_session().await.expect("session");
    assert!(dashboard.terms.fetch_all(&session).await.is_loaded());
    assert!(dashboard.tags.fetch_all(&session).await.is_loaded());

    let term = dashboard
        .terms
        .add_term(
            &session,
            TermDraft {
                marketplace: "ebay".into(),
                term: " Nikon Z 24-70 f/4 ".into(),
                file_id: Some(1),
                ..TermDraft::default()
            },
        )
        .await
        .expect("add term");
    assert_eq!(term.term, "Nikon Z 24-70 f/4");

    let tags = dashboard
        .tags
        .set_tags(&session, term.id, &["zoom".to_string(), " Zoom ".to_string()])
        .await
        .expect("tags");
    assert_eq!(tags, vec!["Zoom", "zoom"]);

    assert!(dashboard.alerts.fetch_alerts(&session, 1, "ebay").await.is_loaded());
    assert_eq!(dashboard.alerts.settings().await.len(), 2);
    dashboard
        .alerts
        .update_alert(
            &session,
            term.id,
            AlertToggles {
                email_alert: true,
                telegram_alert: true,
            },
        )
        .await
        .expect("alert");
    let stored = backend.rows(Table::ScrapeJobs).await;
    let row = stored
        .iter()
        .find(|row| row["id"] == json!(term.id))
        .expect("stored term");
    assert_eq!(row["telegram_alert"], json!(true));

    assert!(dashboard.alerts.fetch_contact(&session).await.is_loaded());
    assert_eq!(dashboard.alerts.contact().await.chat_id, "123456789");
}

#[tokio::test]
async fn signing_out_resets_caches_but_keeps_expansion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(MemoryBackend::from_fixture(&seed_path()).expect("demo seed"));
    let local = pricewatch_backend::LocalStateStore::new(dir.path());
    let dashboard = Dashboard::new(backend.clone(), backend.clone(), Some(local));
    assert!(dashboard.start().await);
    assert!(matches!(
        dashboard.require_session().await,
        Err(StoreError::NotAuthenticated)
    ));

    assert!(dashboard.auth.login(DEMO_EMAIL, DEMO_PASSWORD).await);
    let session = dashboard.require_session().await.expect("session");
    assert!(dashboard.folders.fetch_folders(&session).await.is_loaded());
    dashboard
        .folders
        .set_expanded_keys([("1".to_string(), true)].into_iter().collect())
        .await
        .expect("expand");
    dashboard.folders.select_file(1, 2).await;

    assert!(dashboard.auth.logout().await);
    let folders = dashboard.folders.clone();
    wait_until(|| {
        let folders = folders.clone();
        async move { folders.folders().await.is_empty() }
    })
    .await;
    assert!(dashboard.folders.selection().await.is_none());
    assert_eq!(dashboard.folders.expanded_keys().await.len(), 1);

    let reopened = Dashboard::new(
        backend.clone(),
        backend.clone(),
        Some(pricewatch_backend::LocalStateStore::new(dir.path())),
    );
    reopened.start().await;
    assert_eq!(reopened.folders.expanded_keys().await.len(), 1);
}
