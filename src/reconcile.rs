//! Reconciliation Engine
//!
//! Brings the synced block tree in line with freshly parsed records:
//!
//! ```text
//! <container>                      status block, first on the sync page
//!   ## Title        authors:: ..   one block per book
//!     ### Bookmarks
//!       > excerpt   page:: ..      one block per highlight
//!         personal note            at most one child
//! ```
//!
//! Unknown books are inserted as a whole subtree. Known books are walked:
//! new highlights are added, personal notes are created, rewritten or
//! removed, and the book properties are overwritten. Highlights that are no
//! longer in the source are never deleted.

use std::collections::HashMap;

use crate::error::{StoreError, SyncError};
use crate::identity::bookmark_identity;
use crate::index::{StoreIndex, build_index};
use crate::model::{BOOKMARKS_CONTAINER, BookRecord, ProjectionSettings};
use crate::store::{BlockStore, NodeHandle, Placement, Properties, StoreNode};
use crate::sync::{
    SyncReport, SyncResult, log_create_error, log_delete_error, log_find_error, log_update_error,
};

struct StoredBookmark {
    handle: NodeHandle,
    note: Option<(NodeHandle, String)>,
}

fn stored_bookmarks(container: &StoreNode) -> HashMap<String, StoredBookmark> {
    let mut existing = HashMap::new();
    for child in &container.children {
        existing.entry(child.content.clone()).or_insert_with(|| StoredBookmark {
            handle: child.uuid.clone(),
            note: child.children.first().map(|n| (n.uuid.clone(), n.content.clone())),
        });
    }
    existing
}

pub struct Reconciler<'a> {
    store: &'a dyn BlockStore,
    settings: ProjectionSettings,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn BlockStore, settings: ProjectionSettings) -> Self {
        Self { store, settings }
    }

    /// Indexes the blocks under `container` once, then reconciles every
    /// record in order. Only the index query can fail the whole call.
    pub async fn reconcile<I>(&self, container: &NodeHandle, records: I) -> Result<SyncReport, SyncError>
    where
        I: IntoIterator<Item = BookRecord>,
    {
        let index = self.index(container).await?;
        let mut report = SyncReport::default();
        for record in records {
            self.reconcile_book(container, &index, &record, &mut report).await;
        }
        Ok(report)
    }

    pub async fn index(&self, container: &NodeHandle) -> Result<StoreIndex, SyncError> {
        build_index(self.store, container)
            .await
            .map_err(SyncError::StoreQuery)
    }

    /// Reconciles one book and records the outcome. Failures are logged and
    /// added to `report`; they never abort the run.
    ///
    /// The index is not updated with inserted books, so the same identity
    /// appearing twice in one run is inserted twice.
    pub async fn reconcile_book(
        &self,
        container: &NodeHandle,
        index: &StoreIndex,
        record: &BookRecord,
        report: &mut SyncReport,
    ) -> SyncResult {
        let key = record.identity();
        let result = match index.get(&key) {
            None => self.insert_book(container, &key, record, report).await,
            Some(handle) => self.update_book(handle, &key, record, report).await,
        };
        result.record(report);
        result
    }

    async fn insert_book(
        &self,
        container: &NodeHandle,
        key: &str,
        record: &BookRecord,
        report: &mut SyncReport,
    ) -> SyncResult {
        if record.is_empty() {
            tracing::debug!(book = %key, "no highlights or document properties, skipping");
            return SyncResult::Skipped;
        }

        let block = record.to_block(&self.settings);
        match self.store.insert_subtree(container, &block, Placement::LastChild).await {
            Ok(handle) => {
                let bookmarks = record.distinct_bookmarks();
                let notes = bookmarks.iter().filter(|b| b.note.is_some()).count();
                report.bookmarks_created += bookmarks.len() as u32;
                report.notes_created += notes as u32;
                tracing::info!(
                    book = %key,
                    block = %handle,
                    bookmarks = bookmarks.len(),
                    "inserted book"
                );
                SyncResult::Created
            }
            Err(e) => {
                log_create_error("book", key, &e);
                report.push_error(format!("{}: {}", key, e));
                SyncResult::Error
            }
        }
    }

    async fn update_book(
        &self,
        handle: &NodeHandle,
        key: &str,
        record: &BookRecord,
        report: &mut SyncReport,
    ) -> SyncResult {
        let node = match self.store.get_node(handle).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                tracing::warn!(book = %key, block = %handle, "indexed book block disappeared, skipping");
                report.push_error(format!("{}: block {} disappeared during sync", key, handle));
                return SyncResult::Error;
            }
            Err(e) => {
                log_find_error("book", key, &e);
                report.push_error(format!("{}: {}", key, e));
                return SyncResult::Error;
            }
        };

        if !record.bookmarks.is_empty() {
            let Some(container) = node.find_child(BOOKMARKS_CONTAINER) else {
                let err = SyncError::StoreCorruption(format!(
                    "{}: block {} has no \"{}\" child",
                    key, handle, BOOKMARKS_CONTAINER
                ));
                tracing::error!(book = %key, block = %handle, "{}", err);
                report.push_error(err.to_string());
                return SyncResult::Error;
            };

            if let Err(e) = self.sync_bookmarks(key, container, record, report).await {
                report.push_error(format!("{}: {}", key, e));
                return SyncResult::Error;
            }
        }

        let properties = record.book_properties(&self.settings);
        match self.store.update_node(handle, &record.header(), Some(&properties)).await {
            Ok(()) => {
                tracing::debug!(book = %key, block = %handle, "updated book");
                SyncResult::Updated
            }
            Err(e) => {
                log_update_error("book", key, &e);
                report.push_error(format!("{}: {}", key, e));
                SyncResult::Error
            }
        }
    }

    async fn sync_bookmarks(
        &self,
        key: &str,
        container: &StoreNode,
        record: &BookRecord,
        report: &mut SyncReport,
    ) -> Result<(), StoreError> {
        let existing = stored_bookmarks(container);
        let bookmarks = record.distinct_bookmarks();
        if bookmarks.len() < record.bookmarks.len() {
            tracing::debug!(book = %key, "repeated highlights in source, keeping the first of each");
        }

        for bookmark in bookmarks {
            let id = bookmark_identity(bookmark);

            let Some(stored) = existing.get(&id) else {
                let block = bookmark.to_block(self.settings.collapse_blocks);
                self.store
                    .insert_subtree(&container.uuid, &block, Placement::LastChild)
                    .await
                    .inspect_err(|e| log_create_error("bookmark", &id, e))?;
                report.bookmarks_created += 1;
                if bookmark.note.is_some() {
                    report.notes_created += 1;
                }
                continue;
            };

            match (&bookmark.note, &stored.note) {
                (None, Some((note_handle, _))) => {
                    self.store
                        .remove_node(note_handle)
                        .await
                        .inspect_err(|e| log_delete_error("note", &id, e))?;
                    report.notes_deleted += 1;
                }
                (Some(note), None) => {
                    self.store
                        .insert_node(&stored.handle, note, &Properties::new())
                        .await
                        .inspect_err(|e| log_create_error("note", &id, e))?;
                    report.notes_created += 1;
                }
                (Some(note), Some((note_handle, content))) if note.trim() != content.trim() => {
                    self.store
                        .update_node(note_handle, note, None)
                        .await
                        .inspect_err(|e| log_update_error("note", &id, e))?;
                    report.notes_updated += 1;
                }
                (Some(_), Some(_)) => {
                    report.notes_unchanged += 1;
                    report.bookmarks_unchanged += 1;
                }
                (None, None) => report.bookmarks_unchanged += 1,
            }
        }

        Ok(())
    }
}
