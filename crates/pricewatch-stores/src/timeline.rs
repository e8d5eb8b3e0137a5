//! Price timeline snapshot, its filter selections and the chart series
//! derived from them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use pricewatch_backend::{decode_rows, Backend, PRICE_TIMELINE};
use pricewatch_core::{Session, TimelinePoint};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::error::FetchOutcome;
use crate::live::LoadFlags;

/// Values of one `"{term}__{marketplace}"` series, parallel to [`ChartData::dates`].
/// `None` marks a date on which the series has no row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartSeries {
    pub min_prices: Vec<Option<f64>>,
    pub offers: Vec<Option<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub dates: Vec<NaiveDate>,
    pub series: BTreeMap<String, ChartSeries>,
}

/// Groups rows by date, then by series key. A later row for the same
/// (date, key) replaces an earlier one.
pub fn build_chart<'a>(rows: impl IntoIterator<Item = &'a TimelinePoint>) -> ChartData {
    let mut by_date: BTreeMap<NaiveDate, BTreeMap<String, &TimelinePoint>> = BTreeMap::new();
    for row in rows {
        by_date.entry(row.the_date).or_default().insert(row.series_key(), row);
    }
    let dates: Vec<NaiveDate> = by_date.keys().copied().collect();

    let mut series: BTreeMap<String, ChartSeries> = BTreeMap::new();
    for (date, keyed) in &by_date {
        let Ok(slot) = dates.binary_search(date) else {
            continue;
        };
        for (key, row) in keyed {
            let entry = series.entry(key.clone()).or_insert_with(|| ChartSeries {
                min_prices: vec![None; dates.len()],
                offers: vec![None; dates.len()],
            });
            entry.min_prices[slot] = row.min_price;
            entry.offers[slot] = row.offers;
        }
    }
    ChartData { dates, series }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .filter(|value| seen.insert(*value))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
struct TimelineState {
    rows: Vec<TimelinePoint>,
    selected_terms: Vec<String>,
    selected_sources: Vec<String>,
    chart: ChartData,
    flags: LoadFlags,
}

impl TimelineState {
    fn is_selected(&self, row: &TimelinePoint) -> bool {
        (self.selected_terms.is_empty() || self.selected_terms.contains(&row.search_term))
            && (self.selected_sources.is_empty() || self.selected_sources.contains(&row.source))
    }

    fn filtered(&self) -> Vec<&TimelinePoint> {
        self.rows.iter().filter(|row| self.is_selected(row)).collect()
    }

    fn rederive(&mut self) {
        self.chart = build_chart(self.filtered());
    }

    fn all_terms(&self) -> Vec<String> {
        distinct(self.rows.iter().map(|row| row.search_term.as_str()))
    }

    fn all_sources(&self) -> Vec<String> {
        distinct(self.rows.iter().map(|row| row.source.as_str()))
    }
}

#[derive(Clone)]
pub struct TimelineAggregator {
    backend: Arc<dyn Backend>,
    state: Arc<RwLock<TimelineState>>,
}

impl TimelineAggregator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: Arc::new(RwLock::new(TimelineState::default())),
        }
    }

    /// Fetches the snapshot once and selects every term and marketplace in it.
    pub async fn fetch_timeline(&self, session: &Session) -> FetchOutcome {
        let epoch = match self.state.write().await.flags.begin() {
            Some(epoch) => epoch,
            None => {
                debug!("timeline already loaded or loading");
                return FetchOutcome::Skipped;
            }
        };

        let result = match self.backend.rpc(session, PRICE_TIMELINE, json!({})).await {
            Ok(rows) => decode_rows::<TimelinePoint>(PRICE_TIMELINE, rows),
            Err(err) => Err(err),
        };

        let mut state = self.state.write().await;
        if !state.flags.is_current(epoch) {
            return FetchOutcome::Skipped;
        }
        match result {
            Ok(rows) => {
                let count = rows.len();
                state.rows = rows;
                state.selected_terms = state.all_terms();
                state.selected_sources = state.all_sources();
                state.rederive();
                state.flags.finish_ok();
                info!(count, "price timeline loaded");
                FetchOutcome::Loaded
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to load price timeline");
                state.rows.clear();
                state.selected_terms.clear();
                state.selected_sources.clear();
                state.rederive();
                state.flags.finish_err(message.clone());
                FetchOutcome::Failed(message)
            }
        }
    }

    /// Drops the current snapshot guard and fetches a fresh one.
    pub async fn reload(&self, session: &Session) -> FetchOutcome {
        self.state.write().await.flags.reset();
        self.fetch_timeline(session).await
    }

    pub async fn set_terms(&self, terms: Vec<String>) {
        let mut state = self.state.write().await;
        state.selected_terms = terms;
        state.rederive();
    }

    pub async fn set_sources(&self, sources: Vec<String>) {
        let mut state = self.state.write().await;
        state.selected_sources = sources;
        state.rederive();
    }

    pub async fn filtered(&self) -> Vec<TimelinePoint> {
        self.state.read().await.filtered().into_iter().cloned().collect()
    }

    pub async fn chart_data(&self) -> ChartData {
        self.state.read().await.chart.clone()
    }

    pub async fn all_terms(&self) -> Vec<String> {
        self.state.read().await.all_terms()
    }

    pub async fn all_sources(&self) -> Vec<String> {
        self.state.read().await.all_sources()
    }

    pub async fn selected_terms(&self) -> Vec<String> {
        self.state.read().await.selected_terms.clone()
    }

    pub async fn selected_sources(&self) -> Vec<String> {
        self.state.read().await.selected_sources.clone()
    }

    pub async fn flags(&self) -> LoadFlags {
        self.state.read().await.flags.clone()
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let flags = std::mem::take(&mut state.flags);
        *state = TimelineState {
            flags,
            ..TimelineState::default()
        };
        state.flags.reset();
    }
}
