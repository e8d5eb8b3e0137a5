//! Two-level folder/file tree used to organize saved searches, with the
//! current selection and the persisted expansion state.

use std::collections::BTreeMap;
use std::sync::Arc;

use pricewatch_backend::{
    decode_rows, Backend, BackendError, ChannelSpec, Filter, LocalStateStore, Query, Table,
};
use pricewatch_core::{
    compare_names, Change, FileEntry, FileRow, FileSelection, Folder, RowChange, RowId, Session,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FetchOutcome, Result, StoreError};
use crate::live::{decode_change, open_channel, ChannelSet, Journal, LiveRows, LoadFlags};

pub const EXPANSION_STATE_KEY: &str = "folder_tree.expanded";

/// Expanded tree nodes keyed by folder id.
pub type ExpandedKeys = BTreeMap<String, bool>;

#[derive(Debug, Default)]
struct FolderState {
    folders: LiveRows<Folder>,
    flags: LoadFlags,
    journal: Journal<RowChange>,
    selection: Option<FileSelection>,
    expanded: ExpandedKeys,
    /// Files whose folder event has not arrived yet, keyed by folder id.
    orphans: BTreeMap<RowId, Vec<FileRow>>,
}

impl FolderState {
    fn sort_folders(&mut self) {
        self.folders.sort_by(|a, b| compare_names(&a.name, &b.name));
    }

    /// Applies one changefeed event. Returns true when the expansion state changed.
    fn apply(&mut self, change: &RowChange) -> bool {
        match change.table.as_str() {
            "folders" => match decode_change::<Folder>(change) {
                Some(Change::Upsert(mut folder)) => {
                    let id = folder.id;
                    folder.sort_files();
                    self.folders.upsert(folder);
                    for row in self.orphans.remove(&id).unwrap_or_default() {
                        self.place_file(row);
                    }
                    self.sort_folders();
                    false
                }
                Some(Change::Delete(id)) => self.remove_folder(id),
                None => false,
            },
            "files" => {
                match decode_change::<FileRow>(change) {
                    Some(Change::Upsert(row)) => self.place_file(row),
                    Some(Change::Delete(id)) => self.remove_file(id),
                    None => {}
                }
                false
            }
            other => {
                warn!(table = other, "unexpected table on folder channel");
                false
            }
        }
    }

    fn remove_folder(&mut self, id: RowId) -> bool {
        self.folders.remove(id);
        self.orphans.remove(&id);
        if self.selection.is_some_and(|selected| selected.folder_id == id) {
            self.selection = None;
            debug!(folder_id = id, "selection cleared with its folder");
        }
        self.expanded.remove(&id.to_string()).is_some()
    }

    /// Drops a file from every folder except `keep` and from the orphan buffer.
    fn detach_file(&mut self, id: RowId, keep: Option<RowId>) -> bool {
        for rows in self.orphans.values_mut() {
            rows.retain(|row| row.id != id);
        }
        self.orphans.retain(|_, rows| !rows.is_empty());
        self.folders.update_each(|folder| {
            if Some(folder.id) == keep {
                return false;
            }
            let before = folder.files.len();
            folder.files.retain(|file| file.id != id);
            folder.files.len() < before
        })
    }

    /// Inserts or replaces a file under its folder, moving it if it changed
    /// folders. A file for a folder not seen yet waits for that folder.
    fn place_file(&mut self, row: FileRow) {
        self.detach_file(row.id, Some(row.folder_id));
        if self.folders.get(row.folder_id).is_none() {
            debug!(file_id = row.id, folder_id = row.folder_id, "file waiting for its folder");
            self.orphans.entry(row.folder_id).or_default().push(row);
            return;
        }
        if let Some(folder) = self.folders.get_mut(row.folder_id) {
            match folder.files.iter_mut().find(|file| file.id == row.id) {
                Some(file) => file.name = row.name,
                None => folder.files.push(row.into()),
            }
            folder.sort_files();
        }
    }

    fn rename_file(&mut self, id: RowId, name: &str) -> bool {
        self.folders.update_each(|folder| {
            let Some(file) = folder.files.iter_mut().find(|file| file.id == id) else {
                return false;
            };
            file.name = name.to_string();
            folder.sort_files();
            true
        })
    }

    fn remove_file(&mut self, id: RowId) {
        let found = self.detach_file(id, None);
        if self.selection.is_some_and(|selected| selected.file_id == id) {
            self.selection = None;
            debug!(file_id = id, "selection cleared with its file");
        }
        if !found {
            debug!(file_id = id, "removed file was not cached");
        }
    }
}

fn clean_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::Precondition("name must not be empty".into()));
    }
    Ok(name.to_string())
}

#[derive(Clone)]
pub struct FolderTree {
    backend: Arc<dyn Backend>,
    local: Option<LocalStateStore>,
    state: Arc<RwLock<FolderState>>,
    channels: ChannelSet,
}

impl FolderTree {
    pub fn new(backend: Arc<dyn Backend>, local: Option<LocalStateStore>) -> Self {
        Self {
            backend,
            local,
            state: Arc::new(RwLock::new(FolderState::default())),
            channels: ChannelSet::default(),
        }
    }

    pub async fn fetch_folders(&self, session: &Session) -> FetchOutcome {
        let epoch = {
            let mut state = self.state.write().await;
            match state.flags.begin() {
                Some(epoch) => {
                    state.journal.open();
                    epoch
                }
                None => {
                    debug!("folders already loaded or loading");
                    return FetchOutcome::Skipped;
                }
            }
        };

        let mut opened = Vec::new();
        match self.load(session, epoch, &mut opened).await {
            Ok(Some(count)) => {
                info!(count, "folders loaded");
                FetchOutcome::Loaded
            }
            Ok(None) => {
                self.channels.close_only(&self.backend, &opened).await;
                FetchOutcome::Skipped
            }
            Err(err) => {
                let message = err.to_string();
                error!(error = %message, "failed to load folders");
                self.channels.close_only(&self.backend, &opened).await;
                let mut state = self.state.write().await;
                if state.flags.is_current(epoch) {
                    state.folders.clear();
                    state.orphans.clear();
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
        for table in [Table::Folders, Table::Files] {
            let store = self.clone();
            let channel = open_channel(
                &self.backend,
                session,
                ChannelSpec::owned(format!("{table}:{owner}"), table, owner),
                move |change| {
                    let store = store.clone();
                    async move { store.apply_change(change).await }
                },
            )
            .await?;
            opened.push(self.channels.add(channel).await);
        }

        let rows = self
            .backend
            .select(
                session,
                Query::table(Table::Folders)
                    .select("id, name, files(id, name)")
                    .eq("user_id", owner)
                    .order("name", true),
            )
            .await?;
        let mut folders: Vec<Folder> = decode_rows(Table::Folders.as_str(), rows)?;
        for folder in &mut folders {
            folder.sort_files();
        }
        let count = folders.len();

        let mut state = self.state.write().await;
        if !state.flags.is_current(epoch) {
            return Ok(None);
        }
        state.folders.replace_all(folders);
        state.orphans.clear();
        let replay = state.journal.close();
        let mut expansion_changed = false;
        for change in &replay {
            expansion_changed |= state.apply(change);
        }
        state.sort_folders();
        state.flags.finish_ok();
        let expanded = expansion_changed.then(|| state.expanded.clone());
        drop(state);
        if let Some(expanded) = expanded {
            self.persist(&expanded).await;
        }
        Ok(Some(count))
    }

    async fn apply_change(&self, change: RowChange) {
        let expanded = {
            let mut state = self.state.write().await;
            let changed = state.apply(&change);
            state.journal.record(change);
            changed.then(|| state.expanded.clone())
        };
        if let Some(expanded) = expanded {
            self.persist(&expanded).await;
        }
    }

    pub async fn add_folder(&self, session: &Session, name: &str) -> Result<Folder> {
        let name = clean_name(name)?;
        let row = json!({"user_id": session.user_id(), "name": name});
        let rows = match self.backend.insert(session, Table::Folders, vec![row]).await {
            Ok(rows) => rows,
            Err(err) => return Err(self.write_failed(err.into()).await),
        };
        let folder = decode_rows::<Folder>(Table::Folders.as_str(), rows)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Rejected("insert returned no folder".into()))?;

        let mut state = self.state.write().await;
        state.folders.upsert(folder.clone());
        state.sort_folders();
        info!(folder_id = folder.id, "folder added");
        Ok(folder)
    }

    pub async fn rename_folder(&self, session: &Session, id: RowId, name: &str) -> Result<()> {
        let name = clean_name(name)?;
        let filters = vec![Filter::eq("id", id), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self
            .backend
            .update(session, Table::Folders, filters, json!({"name": name}))
            .await
        {
            return Err(self.write_failed(err.into()).await);
        }
        let mut state = self.state.write().await;
        match state.folders.get_mut(id) {
            Some(folder) => folder.name = name,
            None => warn!(folder_id = id, "renamed folder was not cached"),
        }
        state.sort_folders();
        info!(folder_id = id, "folder renamed");
        Ok(())
    }

    /// Deletes a folder and, remotely, everything under it.
    pub async fn delete_folder(&self, session: &Session, id: RowId) -> Result<()> {
        let filters = vec![Filter::eq("id", id), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self.backend.delete(session, Table::Folders, filters).await {
            return Err(self.write_failed(err.into()).await);
        }
        let expanded = {
            let mut state = self.state.write().await;
            let changed = state.remove_folder(id);
            changed.then(|| state.expanded.clone())
        };
        if let Some(expanded) = expanded {
            self.persist(&expanded).await;
        }
        info!(folder_id = id, "folder deleted");
        Ok(())
    }

    pub async fn add_file(
        &self,
        session: &Session,
        folder_id: RowId,
        name: &str,
    ) -> Result<FileEntry> {
        let name = clean_name(name)?;
        let row = json!({"user_id": session.user_id(), "folder_id": folder_id, "name": name});
        let rows = match self.backend.insert(session, Table::Files, vec![row]).await {
            Ok(rows) => rows,
            Err(err) => return Err(self.write_failed(err.into()).await),
        };
        let file = decode_rows::<FileRow>(Table::Files.as_str(), rows)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Rejected("insert returned no file".into()))?;
        let entry = FileEntry::from(file.clone());

        self.state.write().await.place_file(file);
        info!(folder_id, file_id = entry.id, "file added");
        Ok(entry)
    }

    pub async fn rename_file(&self, session: &Session, id: RowId, name: &str) -> Result<()> {
        let name = clean_name(name)?;
        let filters = vec![Filter::eq("id", id), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self
            .backend
            .update(session, Table::Files, filters, json!({"name": name}))
            .await
        {
            return Err(self.write_failed(err.into()).await);
        }
        if !self.state.write().await.rename_file(id, &name) {
            warn!(file_id = id, "renamed file was not cached");
        }
        info!(file_id = id, "file renamed");
        Ok(())
    }

    pub async fn delete_file(&self, session: &Session, id: RowId) -> Result<()> {
        let filters = vec![Filter::eq("id", id), Filter::eq("user_id", session.user_id())];
        if let Err(err) = self.backend.delete(session, Table::Files, filters).await {
            return Err(self.write_failed(err.into()).await);
        }
        self.state.write().await.remove_file(id);
        info!(file_id = id, "file deleted");
        Ok(())
    }

    async fn write_failed(&self, err: StoreError) -> StoreError {
        error!(error = %err, "folder write failed");
        self.state.write().await.flags.error = Some(err.to_string());
        err
    }

    pub async fn select_file(&self, folder_id: RowId, file_id: RowId) {
        self.state.write().await.selection = Some(FileSelection { folder_id, file_id });
        debug!(folder_id, file_id, "file selected");
    }

    pub async fn reset_selection(&self) {
        self.state.write().await.selection = None;
    }

    pub async fn selection(&self) -> Option<FileSelection> {
        self.state.read().await.selection
    }

    /// Replaces the expansion state and persists it.
    pub async fn set_expanded_keys(&self, keys: ExpandedKeys) -> Result<()> {
        self.state.write().await.expanded = keys.clone();
        if let Some(local) = &self.local {
            local
                .save(EXPANSION_STATE_KEY, &keys)
                .await
                .map_err(|err| StoreError::LocalState(format!("{err:#}")))?;
        }
        Ok(())
    }

    /// Loads the persisted expansion state, if any.
    pub async fn restore_expansion(&self) -> Result<()> {
        let Some(local) = &self.local else {
            return Ok(());
        };
        let keys: Option<ExpandedKeys> = local
            .load(EXPANSION_STATE_KEY)
            .await
            .map_err(|err| StoreError::LocalState(format!("{err:#}")))?;
        if let Some(keys) = keys {
            debug!(count = keys.len(), "folder expansion restored");
            self.state.write().await.expanded = keys;
        }
        Ok(())
    }

    async fn persist(&self, keys: &ExpandedKeys) {
        if let Some(local) = &self.local {
            if let Err(err) = local.save(EXPANSION_STATE_KEY, keys).await {
                error!(error = %format!("{err:#}"), "failed to persist folder expansion");
            }
        }
    }

    pub async fn expanded_keys(&self) -> ExpandedKeys {
        self.state.read().await.expanded.clone()
    }

    pub async fn folders(&self) -> Vec<Folder> {
        self.state.read().await.folders.rows().to_vec()
    }

    pub async fn folder(&self, id: RowId) -> Option<Folder> {
        self.state.read().await.folders.get(id).cloned()
    }

    pub async fn flags(&self) -> LoadFlags {
        self.state.read().await.flags.clone()
    }

    /// Drops subscriptions, folders and the selection. Expansion survives.
    pub async fn reset(&self) {
        self.channels.close_all(&self.backend).await;
        let mut state = self.state.write().await;
        state.folders.clear();
        state.orphans.clear();
        state.journal.close();
        state.selection = None;
        state.flags.reset();
        debug!("folder tree reset");
    }
}
