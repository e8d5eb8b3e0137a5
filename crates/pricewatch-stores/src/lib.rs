//! Client-side caches of the pricewatch tables, kept live through the changefeed.

pub mod alerts;
pub mod auth;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod folders;
pub mod listings;
pub mod live;
pub mod tags;
pub mod terms;
pub mod timeline;

pub use alerts::AlertPreferences;
pub use auth::AuthSession;
pub use config::ClientConfig;
pub use dashboard::Dashboard;
pub use error::{FetchOutcome, Result, StoreError};
pub use folders::FolderTree;
pub use listings::ListingCache;
pub use live::LoadFlags;
pub use tags::TagIndex;
pub use terms::TermRegistry;
pub use timeline::{ChartData, ChartSeries, TimelineAggregator};

pub const CRATE_NAME: &str = "pricewatch-stores";
