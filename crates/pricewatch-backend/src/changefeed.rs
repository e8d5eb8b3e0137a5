//! Row-level changefeed plumbing: the SSE reader used over HTTP and the
//! in-process fan-out hub used by the memory backend.

use std::collections::HashMap;

use futures::StreamExt;
use pricewatch_core::RowChange;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ChannelSpec, Subscription};

/// SSE event name carrying row changes; other event names are ignored.
pub const CHANGE_EVENT: &str = "postgres_changes";

pub fn owner_filter(owner: &str) -> String {
    format!("user_id=eq.{owner}")
}

pub fn parse_message(event: &str, data: &str) -> Result<Option<RowChange>, serde_json::Error> {
    if event != CHANGE_EVENT {
        return Ok(None);
    }
    serde_json::from_str(data).map(Some)
}

/// Forwards decoded changes from an SSE connection until the stream ends, the
/// server rejects the connection, or the receiver is dropped.
pub(crate) async fn pump(
    mut source: EventSource,
    channel: String,
    tx: mpsc::UnboundedSender<RowChange>,
) {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => debug!(channel, "changefeed connection opened"),
            Ok(Event::Message(msg)) => match parse_message(&msg.event, &msg.data) {
                Ok(Some(change)) => {
                    if tx.send(change).is_err() {
                        debug!(channel, "changefeed receiver dropped");
                        break;
                    }
                }
                Ok(None) => debug!(channel, event = %msg.event, "ignoring changefeed event"),
                Err(err) => warn!(channel, error = %err, "undecodable changefeed payload"),
            },
            Err(reqwest_eventsource::Error::StreamEnded) => {
                info!(channel, "changefeed stream ended");
                break;
            }
            Err(
                err @ (reqwest_eventsource::Error::InvalidStatusCode(..)
                | reqwest_eventsource::Error::InvalidContentType(..)),
            ) => {
                warn!(channel, error = %err, "changefeed rejected by server");
                break;
            }
            Err(err) => warn!(channel, error = %err, "changefeed error, reconnecting"),
        }
    }
    source.close();
}

/// Does this change concern a row owned by `owner`?
pub fn owned_by(change: &RowChange, owner: &str) -> bool {
    change
        .record
        .as_ref()
        .or(change.old_record.as_ref())
        .and_then(|row| row.get("user_id"))
        .and_then(|id| id.as_str())
        == Some(owner)
}

#[derive(Debug)]
struct Feed {
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<RowChange>,
}

#[derive(Debug, Default)]
pub struct FeedHub {
    feeds: HashMap<Uuid, Feed>,
}

impl FeedHub {
    pub fn open(&mut self, spec: ChannelSpec) -> Subscription {
        let (tx, events) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let channel = spec.name.clone();
        self.feeds.insert(id, Feed { spec, tx });
        Subscription {
            id,
            channel,
            events,
        }
    }

    pub fn close(&mut self, id: Uuid) -> bool {
        self.feeds.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub fn publish(&mut self, change: &RowChange) {
        self.feeds.retain(|_, feed| {
            if feed.spec.table.as_str() != change.table {
                return true;
            }
            if let Some(owner) = &feed.spec.owner {
                if !owned_by(change, owner) {
                    return true;
                }
            }
            feed.tx.send(change.clone()).is_ok()
        });
    }
}
