//! Sync run orchestration
//!
//! A run moves through `Idle → Locating → Indexing → Reconciling → Done`,
//! or ends in `Failed`. Only one run may be in flight per [`Syncer`].
//!
//! The first block of the sync page doubles as a status marker. It shows a
//! locating message while sources are enumerated, gets its previous content
//! back if the run stops before touching any book, and finally records when
//! the last completed sync started.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::koreader;
use crate::model::{BookRecord, ProjectionSettings};
use crate::progress::Progress;
use crate::reconcile::Reconciler;
use crate::source::{SourceFile, SourceProvider};
use crate::store::{BlockStore, NodeHandle};
use crate::sync::SyncReport;

pub const LOCATING_MARKER: &str = "🚀 Locating KOReader metadata ...";
pub const CANCELLED_MARKER: &str = "KOReader sync cancelled";
const PROGRESS_LABEL: &str = "Syncing KOReader annotations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Locating,
    Indexing,
    Reconciling,
    Done,
    Failed,
}

impl Phase {
    pub fn is_running(self) -> bool {
        matches!(self, Phase::Locating | Phase::Indexing | Phase::Reconciling)
    }
}

pub fn completed_marker(started: &str) -> String {
    format!("# 📚 KOReader - Sync Started at {}", started)
}

/// End-of-run notice for a run that did not complete.
pub fn failure_notice(err: &SyncError) -> String {
    let message = crate::unpack_error(err);
    if err.is_pre_mutation() {
        format!("{}\nNo books were changed.", message)
    } else {
        message
    }
}

/// Marks the run failed if it is dropped before reaching a final phase.
struct RunGuard {
    phase: Arc<Mutex<Phase>>,
}

impl RunGuard {
    fn set(&self, next: Phase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if phase.is_running() {
            *phase = Phase::Failed;
        }
    }
}

async fn read_record(file: &SourceFile) -> anyhow::Result<Option<BookRecord>> {
    let text = tokio::fs::read_to_string(&file.path)
        .await
        .with_context(|| format!("failed to read {}", file.path.display()))?;
    let record = koreader::parse(&text)?;

    Ok(record.map(|mut record| {
        if record.title.trim().is_empty() {
            if let Some(title) = &file.fallback_title {
                record.title = title.clone();
            }
        }
        record
    }))
}

pub struct Syncer {
    store: Arc<dyn BlockStore>,
    page: String,
    settings: ProjectionSettings,
    phase: Arc<Mutex<Phase>>,
}

impl Syncer {
    pub fn new(store: Arc<dyn BlockStore>, page: impl Into<String>, settings: ProjectionSettings) -> Self {
        Self {
            store,
            page: page.into(),
            settings,
            phase: Arc::new(Mutex::new(Phase::Idle)),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<RunGuard, SyncError> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if phase.is_running() {
            tracing::warn!(phase = ?*phase, "sync requested while another is running");
            return Err(SyncError::ReentrancyRejected);
        }
        *phase = Phase::Locating;
        Ok(RunGuard {
            phase: self.phase.clone(),
        })
    }

    /// Runs one full sync of every file `source` yields.
    pub async fn run(
        &self,
        source: &dyn SourceProvider,
        progress: &mut dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let guard = self.begin()?;
        let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        match self.execute(&guard, source, progress, cancel, &started).await {
            Ok(report) => {
                guard.set(Phase::Done);
                Ok(report)
            }
            Err(e) => {
                guard.set(Phase::Failed);
                Err(e)
            }
        }
    }

    /// Resolves the status block, returning its handle and prior content.
    async fn prepare_container(&self) -> Result<(NodeHandle, Option<String>), SyncError> {
        match self.store.first_page_block(&self.page).await? {
            Some(handle) => {
                let prior = self.store.get_node(&handle).await?.map(|n| n.content);
                self.store.update_node(&handle, LOCATING_MARKER, None).await?;
                Ok((handle, prior))
            }
            None => {
                let handle = self.store.append_page_block(&self.page, LOCATING_MARKER).await?;
                Ok((handle, None))
            }
        }
    }

    async fn restore_marker(&self, container: &NodeHandle, prior: Option<&str>) {
        let content = prior.unwrap_or(CANCELLED_MARKER);
        if let Err(e) = self.store.update_node(container, content, None).await {
            tracing::error!(error = %e, "failed to restore status block");
        }
    }

    async fn execute(
        &self,
        guard: &RunGuard,
        source: &dyn SourceProvider,
        progress: &mut dyn Progress,
        cancel: &CancellationToken,
        started: &str,
    ) -> Result<SyncReport, SyncError> {
        let (container, prior) = self.prepare_container().await?;

        let files = match source.locate(cancel).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "could not locate metadata files");
                self.restore_marker(&container, prior.as_deref()).await;
                return Err(e);
            }
        };

        guard.set(Phase::Indexing);
        let reconciler = Reconciler::new(self.store.as_ref(), self.settings);
        let index = match reconciler.index(&container).await {
            Ok(index) => index,
            Err(e) => {
                tracing::error!(error = %crate::unpack_error(&e), "failed to index synced books");
                self.restore_marker(&container, prior.as_deref()).await;
                return Err(e);
            }
        };

        guard.set(Phase::Reconciling);
        let mut report = SyncReport::default();
        progress.start(PROGRESS_LABEL, files.len());

        for file in &files {
            if cancel.is_cancelled() {
                tracing::warn!("sync cancelled, leaving remaining files untouched");
                report.interrupted = true;
                break;
            }

            match read_record(file).await {
                Ok(Some(record)) => {
                    report.files_parsed += 1;
                    reconciler
                        .reconcile_book(&container, &index, &record, &mut report)
                        .await;
                }
                Ok(None) => {
                    report.files_parsed += 1;
                    tracing::debug!(path = ?file.path, "no book metadata in file");
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    report.files_failed += 1;
                    tracing::error!(path = ?file.path, error = %message, "failed to parse metadata");
                    report.push_error(format!("{}: {}", file.path.display(), message));
                }
            }
            progress.increment(1);
        }
        progress.finish();

        if let Err(e) = self
            .store
            .update_node(&container, &completed_marker(started), None)
            .await
        {
            tracing::error!(error = %e, "failed to update status block");
            report.push_error(format!("status block: {}", e));
        }

        tracing::info!(
            created = report.books_created,
            updated = report.books_updated,
            failed = report.books_failed + report.files_failed,
            "sync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LogProgress;
    use crate::source::DirectorySource;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::path::PathBuf;

    const PAGE: &str = "koreader";

    const DUNE: &str = r#"return {
    ["bookmarks"] = {
        [1] = { ["notes"] = "Fear is the mind-killer.", ["text"] = "litany", ["page"] = 8 },
    },
    ["doc_props"] = { ["authors"] = "Frank Herbert", ["title"] = "Dune" },
}"#;

    struct Refused;

    #[async_trait]
    impl SourceProvider for Refused {
        async fn locate(&self, _cancel: &CancellationToken) -> Result<Vec<SourceFile>, SyncError> {
            Err(SyncError::PermissionDenied(PathBuf::from("/mnt/reader")))
        }
    }

    struct Fixed(Vec<SourceFile>);

    #[async_trait]
    impl SourceProvider for Fixed {
        async fn locate(&self, _cancel: &CancellationToken) -> Result<Vec<SourceFile>, SyncError> {
            Ok(self.0.clone())
        }
    }

    fn library() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let dune = dir.path().join("Dune.sdr");
        std::fs::create_dir_all(&dune).unwrap();
        std::fs::write(dune.join("metadata.epub.lua"), DUNE).unwrap();

        let untitled = dir.path().join("Untitled Notes.sdr");
        std::fs::create_dir_all(&untitled).unwrap();
        std::fs::write(
            untitled.join("metadata.pdf.lua"),
            r#"return { bookmarks = { { notes = "A line" } }, doc_props = { authors = "Anon" } }"#,
        )
        .unwrap();

        let broken = dir.path().join("Broken.sdr");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("metadata.epub.lua"), "return { doc_props = ").unwrap();
        dir
    }

    fn syncer(store: Arc<MemoryStore>) -> Syncer {
        Syncer::new(store, PAGE, ProjectionSettings::default())
    }

    #[tokio::test]
    async fn test_run_syncs_library_and_marks_status() {
        let dir = library();
        let store = Arc::new(MemoryStore::new());
        let syncer = syncer(store.clone());
        let source = DirectorySource::new(dir.path());

        let report = syncer
            .run(&source, &mut LogProgress::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(syncer.phase(), Phase::Done);
        assert_eq!(report.files_parsed, 2);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.books_created, 2);
        assert!(report.errors[0].contains("Broken.sdr"));

        let page = store.page_tree(PAGE).await;
        assert_eq!(page.len(), 1);
        assert!(page[0].content.starts_with("# 📚 KOReader - Sync Started at "));
        let titles: Vec<_> = page[0].children.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(titles, vec!["## Dune", "## Untitled Notes"]);

        let again = syncer
            .run(&source, &mut LogProgress::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.books_created, 0);
        assert_eq!(again.books_updated, 2);
        assert_eq!(store.page_tree(PAGE).await[0].children.len(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_restores_prior_marker() {
        let store = Arc::new(MemoryStore::new());
        let status = store.append_page_block(PAGE, "# 📚 previous sync").await.unwrap();
        let syncer = syncer(store.clone());

        let result = syncer
            .run(&Refused, &mut LogProgress::new(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
        assert_eq!(syncer.phase(), Phase::Failed);
        let node = store.get_node(&status).await.unwrap().unwrap();
        assert_eq!(node.content, "# 📚 previous sync");
        assert!(node.children.is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_without_prior_writes_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let syncer = syncer(store.clone());

        let result = syncer
            .run(&Refused, &mut LogProgress::new(), &CancellationToken::new())
            .await;

        assert!(result.is_err());
        let page = store.page_tree(PAGE).await;
        assert_eq!(page[0].content, CANCELLED_MARKER);
    }

    #[tokio::test]
    async fn test_failure_notice_before_any_book() {
        let store = Arc::new(MemoryStore::new());
        let err = syncer(store)
            .run(&Refused, &mut LogProgress::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure_notice(&err), "PermissionDenied: /mnt/reader\nNo books were changed.");
        assert_eq!(
            failure_notice(&SyncError::ReentrancyRejected),
            "ReentrancyRejected: a sync is already running"
        );
    }

    #[tokio::test]
    async fn test_reentrant_run_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let syncer = syncer(store.clone());
        let _active = syncer.begin().unwrap();

        let result = syncer
            .run(&Fixed(vec![]), &mut LogProgress::new(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SyncError::ReentrancyRejected)));
        assert_eq!(syncer.phase(), Phase::Locating);
        assert_eq!(store.node_count().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_allows_next_run() {
        let store = Arc::new(MemoryStore::new());
        let syncer = syncer(store);
        drop(syncer.begin().unwrap());
        assert_eq!(syncer.phase(), Phase::Failed);

        let report = syncer
            .run(&Fixed(vec![]), &mut LogProgress::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(syncer.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn test_cancel_before_reconciling_leaves_books_untouched() {
        let dir = library();
        let store = Arc::new(MemoryStore::new());
        let syncer = syncer(store.clone());
        let files = DirectorySource::new(dir.path())
            .locate(&CancellationToken::new())
            .await
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let report = syncer
            .run(&Fixed(files), &mut LogProgress::new(), &token)
            .await
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.books_created, 0);
        assert!(store.page_tree(PAGE).await[0].children.is_empty());
    }
}
