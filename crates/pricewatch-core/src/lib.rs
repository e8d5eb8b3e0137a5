//! Core domain model for the pricewatch client state layer.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

pub const CRATE_NAME: &str = "pricewatch-core";

/// Primary key type shared by every backend table.
pub type RowId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Authenticated session as handed out by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: Identity,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// Session-change notification delivered by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One changefeed notification, with the raw new/old row payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<JsonValue>,
    #[serde(default)]
    pub old_record: Option<JsonValue>,
    #[serde(default, deserialize_with = "de::timestamp")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// Keyed local effect of a changefeed notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Upsert(T),
    Delete(RowId),
}

impl RowChange {
    pub fn insert(table: &str, record: JsonValue) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            record: Some(record),
            old_record: None,
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn update(table: &str, record: JsonValue, old_record: JsonValue) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Update,
            record: Some(record),
            old_record: Some(old_record),
            commit_timestamp: Some(Utc::now()),
        }
    }

    pub fn delete(table: &str, old_record: JsonValue) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Delete,
            record: None,
            old_record: Some(old_record),
            commit_timestamp: Some(Utc::now()),
        }
    }

    /// Decodes the notification into an upsert of `T` or a delete by id.
    ///
    /// Returns `Ok(None)` when the payload needed for the event kind is missing
    /// (e.g. a delete whose old record carries no id).
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<Change<T>>, serde_json::Error> {
        match self.kind {
            ChangeKind::Delete => Ok(self
                .old_record
                .as_ref()
                .and_then(|old| old.get("id"))
                .and_then(JsonValue::as_i64)
                .map(Change::Delete)),
            ChangeKind::Insert | ChangeKind::Update => self
                .new_row::<T>()
                .map(|row| row.map(Change::Upsert)),
        }
    }

    pub fn new_row<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.record
            .as_ref()
            .map(|record| serde_json::from_value(record.clone()))
            .transpose()
    }

    pub fn old_row<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.old_record
            .as_ref()
            .map(|record| serde_json::from_value(record.clone()))
            .transpose()
    }
}

/// Row with a stable backend id.
pub trait Keyed {
    fn key(&self) -> RowId;

    /// Folds a newer copy of the same row into `self`.
    fn absorb(&mut self, incoming: Self)
    where
        Self: Sized,
    {
        *self = incoming;
    }
}

/// Lenient deserializers for columns the backend may send as numbers, numeric
/// strings or nulls.
pub mod de {
    use super::*;
    use serde::Deserializer;

    pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberLike {
        Number(f64),
        Text(String),
    }

    pub fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumberLike>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberLike::Number(n)) => Ok(Some(n)),
            Some(NumberLike::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                text.parse::<f64>()
                    .map(Some)
                    .map_err(|e| serde::de::Error::custom(format!("invalid number {text:?}: {e}")))
            }
        }
    }

    pub fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match lenient_f64(deserializer)? {
            None => Ok(None),
            Some(n) if n.is_finite() && n >= 0.0 && n <= f64::from(u32::MAX) => {
                Ok(Some(n.round() as u32))
            }
            Some(n) => Err(serde::de::Error::custom(format!("count out of range: {n}"))),
        }
    }

    pub fn string_like<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<JsonValue>::deserialize(deserializer)? {
            None | Some(JsonValue::Null) => String::new(),
            Some(JsonValue::String(s)) => s,
            Some(other) => other.to_string(),
        })
    }

    pub fn timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}"))),
        }
    }

    pub fn date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .map(|ts| ts.date_naive())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date {raw:?}")))
    }
}

/// Parses RFC 3339, Postgres-style (`2024-05-01 10:00:00+00`) and bare-date
/// timestamps. Bare dates resolve to midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// `scrape_jobs` row: one saved search definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermRow {
    pub id: RowId,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<RowId>,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub search_term: String,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub include_terms: Vec<String>,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub exclude_terms: Vec<String>,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub exclude_zoom: bool,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub alert_email: bool,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub telegram_alert: bool,
}

/// `current_low_query` row: externally computed pricing for one search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    #[serde(default)]
    pub scrape_job_id: Option<RowId>,
    pub search_term: String,
    pub source: String,
    #[serde(default, deserialize_with = "de::lenient_f64")]
    pub current_lowest_price: Option<f64>,
    #[serde(default, deserialize_with = "de::timestamp")]
    pub latest_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "de::lenient_u32")]
    pub offers: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
}

/// Derived pricing fields merged into a [`Term`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TermPricing {
    pub current_price: Option<f64>,
    pub lowest_price: Option<f64>,
    pub last_changed: Option<DateTime<Utc>>,
    pub link: Option<String>,
    pub offer_count: Option<u32>,
    pub condition: Option<String>,
}

impl TermPricing {
    /// Overwrites the current snapshot fields and lowers the historical low
    /// when the new price undercuts it. The low is never raised and a null
    /// price leaves it untouched.
    pub fn merge(&mut self, row: &PriceRow) {
        self.current_price = row.current_lowest_price;
        self.last_changed = row.latest_date;
        self.link = row.link.clone();
        self.offer_count = row.offers;
        self.condition = row.condition.clone();

        if let Some(price) = row.current_lowest_price {
            if self.lowest_price.map_or(true, |low| price < low) {
                self.lowest_price = Some(price);
            }
        }
    }
}

/// Local shape of a saved search, merged with its derived pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub id: RowId,
    pub file_id: Option<RowId>,
    pub marketplace: String,
    pub term: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub prime_only: bool,
    #[serde(flatten)]
    pub pricing: TermPricing,
}

impl Term {
    /// Price rows carrying a job id join on it; older rows fall back to the
    /// (search string, marketplace) pair.
    pub fn matches_price(&self, row: &PriceRow) -> bool {
        match row.scrape_job_id {
            Some(id) => id == self.id,
            None => self.term == row.search_term && self.marketplace == row.source,
        }
    }
}

impl From<TermRow> for Term {
    fn from(row: TermRow) -> Self {
        Self {
            id: row.id,
            file_id: row.file_id,
            marketplace: row.source,
            term: row.search_term,
            include: row.include_terms,
            exclude: row.exclude_terms,
            prime_only: row.exclude_zoom,
            pricing: TermPricing::default(),
        }
    }
}

impl Keyed for Term {
    fn key(&self) -> RowId {
        self.id
    }

    // Definition changes never carry pricing; keep what was merged so far.
    fn absorb(&mut self, incoming: Self) {
        let pricing = std::mem::take(&mut self.pricing);
        *self = incoming;
        self.pricing = pricing;
    }
}

/// Input for creating a saved search.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TermDraft {
    pub marketplace: String,
    pub term: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub prime_only: bool,
    #[serde(default)]
    pub file_id: Option<RowId>,
}

impl TermDraft {
    pub fn to_row(&self, user_id: &str) -> JsonValue {
        json!({
            "user_id": user_id,
            "file_id": self.file_id,
            "source": self.marketplace.trim(),
            "search_term": self.term.trim(),
            "include_terms": self.include,
            "exclude_terms": self.exclude,
            "exclude_zoom": self.prime_only,
        })
    }
}

/// `listings` row: one scraped offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: RowId,
    #[serde(default)]
    pub scrape_job_id: Option<RowId>,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub search_term: String,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "de::lenient_f64")]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "de::timestamp")]
    pub date_inserted: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub source: String,
}

impl Keyed for Listing {
    fn key(&self) -> RowId {
        self.id
    }
}

/// `search_tags` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRow {
    pub scrape_job_id: RowId,
    pub tag: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Trims, drops empties, de-duplicates and sorts a tag list.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertToggles {
    pub email_alert: bool,
    pub telegram_alert: bool,
}

impl AlertToggles {
    pub fn to_patch(self) -> JsonValue {
        json!({
            "alert_email": self.email_alert,
            "telegram_alert": self.telegram_alert,
        })
    }
}

/// Per-term notification settings, stored on the `scrape_jobs` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSetting {
    pub id: RowId,
    pub file_id: Option<RowId>,
    pub marketplace: String,
    pub term: String,
    pub email_alert: bool,
    pub telegram_alert: bool,
}

impl AlertSetting {
    pub fn toggles(&self) -> AlertToggles {
        AlertToggles {
            email_alert: self.email_alert,
            telegram_alert: self.telegram_alert,
        }
    }
}

impl From<TermRow> for AlertSetting {
    fn from(row: TermRow) -> Self {
        Self {
            id: row.id,
            file_id: row.file_id,
            marketplace: row.source,
            term: row.search_term,
            email_alert: row.alert_email,
            telegram_alert: row.telegram_alert,
        }
    }
}

/// `alerts_data` row: where a user's alerts are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertContact {
    #[serde(default, deserialize_with = "de::string_like")]
    pub chat_id: String,
    #[serde(default, deserialize_with = "de::string_like")]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: RowId,
    pub name: String,
}

/// `files` row as delivered by the changefeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRow {
    pub id: RowId,
    pub folder_id: RowId,
    pub name: String,
}

impl From<FileRow> for FileEntry {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: RowId,
    pub name: String,
    #[serde(default, deserialize_with = "de::null_as_default")]
    pub files: Vec<FileEntry>,
}

impl Folder {
    pub fn sort_files(&mut self) {
        self.files.sort_by(|a, b| compare_names(&a.name, &b.name));
    }
}

impl Keyed for Folder {
    fn key(&self) -> RowId {
        self.id
    }

    // Folder rows from the changefeed arrive without their nested files.
    fn absorb(&mut self, incoming: Self) {
        let files = if incoming.files.is_empty() {
            std::mem::take(&mut self.files)
        } else {
            incoming.files
        };
        self.name = incoming.name;
        self.files = files;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSelection {
    pub folder_id: RowId,
    pub file_id: RowId,
}

/// Alphabetical order used for folder and file names: case-insensitive first,
/// raw byte order as the tie-break.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// `get_price_timeline` row: one (date, search, marketplace) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePoint {
    #[serde(deserialize_with = "de::date")]
    pub the_date: NaiveDate,
    pub search_term: String,
    pub source: String,
    #[serde(default, deserialize_with = "de::lenient_f64")]
    pub min_price: Option<f64>,
    #[serde(default, deserialize_with = "de::lenient_u32")]
    pub offers: Option<u32>,
}

impl TimelinePoint {
    pub fn series_key(&self) -> String {
        series_key(&self.search_term, &self.source)
    }
}

pub fn series_key(search_term: &str, source: &str) -> String {
    format!("{search_term}__{source}")
}
