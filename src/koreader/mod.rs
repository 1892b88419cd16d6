//! KOReader Metadata Module
//!
//! KOReader keeps per-book state in a sidecar directory (`Book.sdr/`) next
//! to each document. The `metadata.<ext>.lua` file inside is a Lua table
//! with the document properties and the reader's highlights.
//!
//! # Layouts
//!
//! - Older releases store highlights under `bookmarks`, with the highlighted
//!   text in `notes` and the reader's own note in `text`
//! - Newer releases store them under `annotations`, with the highlighted
//!   text in `text` and the reader's own note in `note`
//!
//! The `stats` table (reading statistics) is never read.

pub mod lua;

use crate::error::ParseError;
use crate::model::{BookRecord, BookmarkRecord};

use lua::LuaValue;

const RESERVED_STATS_FIELD: &str = "stats";

#[derive(Debug, Clone, Copy)]
enum Layout {
    Bookmarks,
    Annotations,
}

fn text_field(table: &LuaValue, key: &str) -> Option<String> {
    table
        .get(key)
        .and_then(LuaValue::as_text)
        .filter(|v| !v.trim().is_empty())
}

/// Calibre writes multiple authors newline separated.
fn normalize_authors(authors: String) -> String {
    authors
        .split('\n')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

fn read_entry(entry: &LuaValue, layout: Layout) -> Option<BookmarkRecord> {
    let (excerpt, note, page) = match layout {
        Layout::Bookmarks => (
            text_field(entry, "notes"),
            text_field(entry, "text"),
            text_field(entry, "page"),
        ),
        Layout::Annotations => (
            text_field(entry, "text"),
            text_field(entry, "note"),
            text_field(entry, "pageno").or_else(|| text_field(entry, "page")),
        ),
    };

    let Some(excerpt) = excerpt else {
        tracing::debug!("skipping entry without highlighted text");
        return None;
    };

    // Some releases mirror the highlight into the note field.
    let note = note.filter(|n| n.trim() != excerpt.trim());

    Some(BookmarkRecord {
        excerpt_text: excerpt,
        note,
        page,
        chapter: text_field(entry, "chapter"),
        timestamp: text_field(entry, "datetime"),
    })
}

fn read_entries(table: &LuaValue, layout: Layout) -> Vec<BookmarkRecord> {
    table
        .items()
        .into_iter()
        .filter(|entry| entry.is_table())
        .filter_map(|entry| read_entry(entry, layout))
        .collect()
}

/// Converts a `metadata.*.lua` file into a [`BookRecord`].
///
/// Returns `Ok(None)` when the table carries neither document properties
/// nor highlights, which is the case for sidecars of never-opened files.
pub fn parse(text: &str) -> Result<Option<BookRecord>, ParseError> {
    let root = lua::parse(text)?;
    let LuaValue::Mapping(fields) = &root else {
        if matches!(root, LuaValue::Sequence(_)) {
            return Ok(None);
        }
        return Err(ParseError::new("metadata does not return a table", 0));
    };

    let mut doc_props = None;
    let mut bookmarks = None;
    let mut annotations = None;
    for (key, value) in fields {
        match key.as_str() {
            RESERVED_STATS_FIELD => continue,
            "doc_props" if value.is_table() => doc_props = Some(value),
            "bookmarks" if value.is_table() => bookmarks = Some(value),
            "annotations" if value.is_table() => annotations = Some(value),
            _ => {}
        }
    }

    if doc_props.is_none() && bookmarks.is_none() && annotations.is_none() {
        return Ok(None);
    }

    // When both are present the newer table supersedes the legacy one.
    let entries = match (annotations, bookmarks) {
        (Some(table), _) => read_entries(table, Layout::Annotations),
        (None, Some(table)) => read_entries(table, Layout::Bookmarks),
        (None, None) => Vec::new(),
    };

    let props = doc_props.cloned().unwrap_or(LuaValue::Mapping(Vec::new()));
    Ok(Some(BookRecord {
        title: text_field(&props, "title").unwrap_or_default(),
        authors: text_field(&props, "authors").map(normalize_authors),
        description: text_field(&props, "description").unwrap_or_default(),
        language: text_field(&props, "language"),
        bookmarks: entries,
    }))
}
