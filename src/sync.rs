use std::fmt::Write;

use serde::Serialize;

/// Outcome of reconciling one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Created,
    Updated,
    Skipped,
    Error,
}

impl SyncResult {
    pub fn record(self, report: &mut SyncReport) {
        match self {
            SyncResult::Created => report.books_created += 1,
            SyncResult::Updated => report.books_updated += 1,
            SyncResult::Skipped => report.books_skipped += 1,
            SyncResult::Error => report.books_failed += 1,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub files_parsed: u32,
    pub files_failed: u32,
    pub books_created: u32,
    pub books_updated: u32,
    pub books_skipped: u32,
    pub books_failed: u32,
    pub bookmarks_created: u32,
    pub bookmarks_unchanged: u32,
    pub notes_created: u32,
    pub notes_updated: u32,
    pub notes_deleted: u32,
    pub notes_unchanged: u32,
    pub interrupted: bool,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The single human readable notice shown at the end of a run.
    pub fn notice(&self) -> String {
        let mut out = format!(
            "Synced {} file(s): {} book(s) created, {} updated, {} skipped; {} bookmark(s) added, {} unchanged; notes {} added, {} updated, {} removed",
            self.files_parsed,
            self.books_created,
            self.books_updated,
            self.books_skipped,
            self.bookmarks_created,
            self.bookmarks_unchanged,
            self.notes_created,
            self.notes_updated,
            self.notes_deleted,
        );
        if self.interrupted {
            out.push_str(" (interrupted)");
        }
        if self.has_errors() {
            let _ = write!(out, "\n{} problem(s):", self.errors.len());
            for e in &self.errors {
                let _ = write!(out, "\n  - {}", e);
            }
        }
        out
    }
}

pub fn log_find_error(entity: &str, key: &str, e: impl std::fmt::Display) {
    tracing::error!("Failed to read {} {}: {}", entity, key, e);
}

pub fn log_create_error(entity: &str, key: &str, e: impl std::fmt::Display) {
    tracing::error!("Failed to create {} {}: {}", entity, key, e);
}

pub fn log_update_error(entity: &str, key: &str, e: impl std::fmt::Display) {
    tracing::error!("Failed to update {} {}: {}", entity, key, e);
}

pub fn log_delete_error(entity: &str, key: &str, e: impl std::fmt::Display) {
    tracing::error!("Failed to delete {} {}: {}", entity, key, e);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_outcomes() {
        let mut report = SyncReport::default();
        SyncResult::Created.record(&mut report);
        SyncResult::Updated.record(&mut report);
        SyncResult::Updated.record(&mut report);
        SyncResult::Error.record(&mut report);
        assert_eq!(report.books_created, 1);
        assert_eq!(report.books_updated, 2);
        assert_eq!(report.books_failed, 1);
        assert_eq!(report.books_skipped, 0);
    }

    #[test]
    fn test_notice_lists_errors() {
        let mut report = SyncReport {
            files_parsed: 3,
            books_created: 1,
            ..Default::default()
        };
        assert!(!report.notice().contains("problem"));

        report.push_error("a.lua: ParseError at byte 3: expected '}'");
        report.interrupted = true;
        let notice = report.notice();
        assert!(notice.starts_with("Synced 3 file(s): 1 book(s) created"));
        assert!(notice.contains("0 bookmark(s) added, 0 unchanged;"));
        assert!(notice.contains("(interrupted)"));
        assert!(notice.ends_with("\n1 problem(s):\n  - a.lua: ParseError at byte 3: expected '}'"));
    }
}
