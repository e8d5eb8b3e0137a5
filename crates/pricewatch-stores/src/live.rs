//! Building blocks shared by the live caches: keyed rows, load flags, the
//! snapshot journal, snapshot tickets and changefeed channel handling.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;

use pricewatch_backend::{Backend, BackendError, ChannelSpec, Subscription};
use pricewatch_core::{Change, Keyed, RowChange, RowId, Session};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Keyed rows in display order, with a version bumped on every mutation.
#[derive(Debug, Clone)]
pub struct LiveRows<T> {
    rows: Vec<T>,
    version: u64,
}

impl<T> Default for LiveRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            version: 0,
        }
    }
}

impl<T: Keyed> LiveRows<T> {
    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: RowId) -> Option<&T> {
        self.rows.iter().find(|row| row.key() == id)
    }

    pub fn get_mut(&mut self, id: RowId) -> Option<&mut T> {
        let row = self.rows.iter_mut().find(|row| row.key() == id)?;
        self.version += 1;
        Some(row)
    }

    /// Runs `update` on every row; it returns whether it changed the row.
    /// Returns true, and bumps the version, when any row changed.
    pub fn update_each(&mut self, mut update: impl FnMut(&mut T) -> bool) -> bool {
        let mut changed = false;
        for row in &mut self.rows {
            changed |= update(row);
        }
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Insert-or-replace by key. Returns true when the row was new.
    pub fn upsert(&mut self, row: T) -> bool {
        self.version += 1;
        match self.rows.iter_mut().find(|existing| existing.key() == row.key()) {
            Some(existing) => {
                existing.absorb(row);
                false
            }
            None => {
                self.rows.push(row);
                true
            }
        }
    }

    pub fn remove(&mut self, id: RowId) -> Option<T> {
        let idx = self.rows.iter().position(|row| row.key() == id)?;
        self.version += 1;
        Some(self.rows.remove(idx))
    }

    pub fn apply(&mut self, change: Change<T>) {
        match change {
            Change::Upsert(row) => {
                self.upsert(row);
            }
            Change::Delete(id) => {
                self.remove(id);
            }
        }
    }

    pub fn replace_all(&mut self, rows: Vec<T>) {
        self.version += 1;
        self.rows = rows;
    }

    pub fn clear(&mut self) {
        self.replace_all(Vec::new());
    }

    pub fn sort_by(&mut self, compare: impl FnMut(&T, &T) -> Ordering) {
        self.version += 1;
        self.rows.sort_by(compare);
    }
}

/// `loaded` / `loading` / `error` triple plus an epoch that invalidates
/// in-flight fetches when the cache is reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadFlags {
    pub loaded: bool,
    pub loading: bool,
    pub error: Option<String>,
    #[serde(skip)]
    epoch: u64,
}

impl LoadFlags {
    /// Claims the in-flight slot. `None` when already loaded or loading.
    pub fn begin(&mut self) -> Option<u64> {
        if self.loaded || self.loading {
            return None;
        }
        self.loading = true;
        self.error = None;
        Some(self.epoch)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn finish_ok(&mut self) {
        self.loading = false;
        self.loaded = true;
    }

    pub fn finish_err(&mut self, message: String) {
        self.loading = false;
        self.loaded = false;
        self.error = Some(message);
    }

    pub fn reset(&mut self) {
        self.epoch += 1;
        self.loaded = false;
        self.loading = false;
        self.error = None;
    }
}

/// Changes seen while a snapshot query is in flight, replayed on top of it.
#[derive(Debug)]
pub struct Journal<E> {
    entries: Option<Vec<E>>,
}

impl<E> Default for Journal<E> {
    fn default() -> Self {
        Self { entries: None }
    }
}

impl<E> Journal<E> {
    pub fn open(&mut self) {
        self.entries = Some(Vec::new());
    }

    pub fn is_open(&self) -> bool {
        self.entries.is_some()
    }

    pub fn record(&mut self, entry: E) {
        if let Some(entries) = &mut self.entries {
            entries.push(entry);
        }
    }

    pub fn close(&mut self) -> Vec<E> {
        self.entries.take().unwrap_or_default()
    }
}

/// Monotonic tickets for repeatable snapshot fetches: only a snapshot newer
/// than the last one applied may be merged.
#[derive(Debug, Default)]
pub struct Sequencer {
    issued: u64,
    applied: u64,
}

impl Sequencer {
    pub fn issue(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    pub fn admit(&mut self, ticket: u64) -> bool {
        if ticket > self.applied {
            self.applied = ticket;
            true
        } else {
            false
        }
    }

    /// Invalidates every outstanding ticket.
    pub fn reset(&mut self) {
        self.applied = self.issued;
    }
}

/// A subscription plus the task applying its events.
#[derive(Debug)]
pub struct LiveChannel {
    pub id: Uuid,
    pub name: String,
    task: JoinHandle<()>,
}

pub async fn open_channel<F, Fut>(
    backend: &Arc<dyn Backend>,
    session: &Session,
    spec: ChannelSpec,
    mut handler: F,
) -> Result<LiveChannel, BackendError>
where
    F: FnMut(RowChange) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Subscription {
        id,
        channel,
        mut events,
    } = backend.subscribe(session, spec).await?;
    let name = channel.clone();
    let task = tokio::spawn(async move {
        while let Some(change) = events.recv().await {
            debug!(channel = %name, table = %change.table, kind = ?change.kind, "changefeed event");
            handler(change).await;
        }
        debug!(channel = %name, "changefeed closed");
    });
    Ok(LiveChannel {
        id,
        name: channel,
        task,
    })
}

/// Live channels owned by one cache.
#[derive(Debug, Clone, Default)]
pub struct ChannelSet {
    inner: Arc<Mutex<Vec<LiveChannel>>>,
}

impl ChannelSet {
    pub async fn add(&self, channel: LiveChannel) -> Uuid {
        let id = channel.id;
        self.inner.lock().await.push(channel);
        id
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Asks the backend to drop each subscription, then stops and awaits its
    /// task so no handler can run against cleared state.
    pub async fn close_all(&self, backend: &Arc<dyn Backend>) {
        let channels = std::mem::take(&mut *self.inner.lock().await);
        close(backend, channels).await;
    }

    pub async fn close_only(&self, backend: &Arc<dyn Backend>, ids: &[Uuid]) {
        let channels = {
            let mut inner = self.inner.lock().await;
            let (closing, kept): (Vec<LiveChannel>, Vec<LiveChannel>) = std::mem::take(&mut *inner)
                .into_iter()
                .partition(|channel| ids.contains(&channel.id));
            *inner = kept;
            closing
        };
        close(backend, channels).await;
    }
}

async fn close(backend: &Arc<dyn Backend>, channels: Vec<LiveChannel>) {
    for channel in channels {
        if let Err(err) = backend.remove_subscription(channel.id).await {
            warn!(channel = %channel.name, error = %err, "failed to remove subscription");
        }
        channel.task.abort();
        let _ = channel.task.await;
        debug!(channel = %channel.name, "subscription removed");
    }
}

/// Decodes a changefeed event, logging and dropping undecodable ones.
pub fn decode_change<T>(change: &RowChange) -> Option<Change<T>>
where
    T: serde::de::DeserializeOwned,
{
    match change.decode::<T>() {
        Ok(Some(decoded)) => Some(decoded),
        Ok(None) => {
            warn!(
                table = %change.table,
                kind = ?change.kind,
                "change event without usable payload"
            );
            None
        }
        Err(err) => {
            warn!(table = %change.table, error = %err, "undecodable change event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: RowId,
        label: &'static str,
    }

    impl Keyed for Row {
        fn key(&self) -> RowId {
            self.id
        }
    }

    fn row(id: RowId, label: &'static str) -> Row {
        Row { id, label }
    }

    #[test]
    fn notification_sequences_converge_with_direct_application() {
        let changes = vec![
            Change::Upsert(row(1, "a")),
            Change::Upsert(row(2, "b")),
            Change::Upsert(row(1, "a2")),
            Change::Delete(2),
            Change::Delete(9),
            Change::Upsert(row(3, "c")),
        ];

        let mut live = LiveRows::default();
        for change in changes.clone() {
            live.apply(change);
        }

        let mut direct: Vec<Row> = Vec::new();
        for change in changes {
            match change {
                Change::Upsert(r) => match direct.iter_mut().find(|x| x.id == r.id) {
                    Some(existing) => *existing = r,
                    None => direct.push(r),
                },
                Change::Delete(id) => direct.retain(|x| x.id != id),
            }
        }
        assert_eq!(live.rows(), direct.as_slice());
    }

    #[test]
    fn versions_move_on_every_mutation() {
        let mut live = LiveRows::default();
        live.upsert(row(1, "a"));
        let v = live.version();
        assert!(live.remove(7).is_none());
        assert_eq!(live.version(), v);
        live.remove(1);
        assert!(live.version() > v);
    }

    #[test]
    fn lookups_that_miss_leave_the_version_alone() {
        let mut live = LiveRows::default();
        live.upsert(row(1, "a"));
        let v = live.version();
        assert!(live.get_mut(7).is_none());
        assert!(!live.update_each(|r| r.id == 7));
        assert_eq!(live.version(), v);

        assert!(live.get_mut(1).is_some());
        assert!(live.version() > v);
        let v = live.version();
        assert!(live.update_each(|r| {
            r.label = "b";
            true
        }));
        assert!(live.version() > v);
        assert_eq!(live.rows()[0].label, "b");
    }

    #[test]
    fn load_flags_guard_and_invalidate() {
        let mut flags = LoadFlags::default();
        let epoch = flags.begin().expect("first claim");
        assert!(flags.begin().is_none());
        flags.reset();
        assert!(!flags.is_current(epoch));
        let epoch = flags.begin().expect("claim after reset");
        flags.finish_ok();
        assert!(flags.is_current(epoch));
        assert!(flags.begin().is_none());
    }

    #[test]
    fn journal_only_records_while_open() {
        let mut journal = Journal::default();
        journal.record(1);
        journal.open();
        journal.record(2);
        journal.record(3);
        assert_eq!(journal.close(), vec![2, 3]);
        assert!(!journal.is_open());
        assert!(journal.close().is_empty());
    }

    #[test]
    fn stale_tickets_are_refused() {
        let mut seq = Sequencer::default();
        let slow = seq.issue();
        let fast = seq.issue();
        assert!(seq.admit(fast));
        assert!(!seq.admit(slow));

        let outstanding = seq.issue();
        seq.reset();
        assert!(!seq.admit(outstanding));
        let next = seq.issue();
        assert!(seq.admit(next));
    }
}
