use std::collections::HashSet;

use serde::Serialize;

use crate::identity::{TITLE_PREFIX, book_identity, bookmark_identity};
use crate::store::{NewBlock, Properties};

pub const BOOKMARKS_CONTAINER: &str = "### Bookmarks";
pub const DEFAULT_DESCRIPTION_LENGTH: usize = 250;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookRecord {
    pub title: String,
    pub authors: Option<String>,
    pub description: String,
    pub language: Option<String>,
    pub bookmarks: Vec<BookmarkRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookmarkRecord {
    pub excerpt_text: String,
    pub note: Option<String>,
    pub page: Option<String>,
    pub chapter: Option<String>,
    pub timestamp: Option<String>,
}

/// How records are rendered into blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionSettings {
    pub description_max_length: usize,
    pub collapse_blocks: bool,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            description_max_length: DEFAULT_DESCRIPTION_LENGTH,
            collapse_blocks: true,
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn insert_opt(props: &mut Properties, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        props.insert(key.to_string(), v.clone());
    }
}

fn insert_collapsed(props: &mut Properties, collapse: bool) {
    if collapse {
        props.insert("collapsed".to_string(), "true".to_string());
    }
}

impl BookRecord {
    pub fn identity(&self) -> String {
        book_identity(self.authors.as_deref(), &self.title)
    }

    /// No bookmarks and nothing worth keeping in the document properties.
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
            && is_blank(&self.authors)
            && self.description.trim().is_empty()
            && is_blank(&self.language)
    }

    pub fn header(&self) -> String {
        format!("{}{}", TITLE_PREFIX, self.title)
    }

    /// Properties written on insert and overwritten on every matched run.
    /// `authors` is always present so the index query can find the block.
    pub fn book_properties(&self, settings: &ProjectionSettings) -> Properties {
        let mut props = Properties::new();
        props.insert("authors".to_string(), self.authors.clone().unwrap_or_default());
        props.insert(
            "description".to_string(),
            truncate_chars(&self.description, settings.description_max_length),
        );
        insert_opt(&mut props, "language", &self.language);
        insert_collapsed(&mut props, settings.collapse_blocks);
        props
    }

    /// Highlights keyed by their identity. A repeated excerpt is the same
    /// highlight; the first occurrence wins.
    pub fn distinct_bookmarks(&self) -> Vec<&BookmarkRecord> {
        let mut seen = HashSet::new();
        self.bookmarks
            .iter()
            .filter(|b| seen.insert(bookmark_identity(b)))
            .collect()
    }

    pub fn to_block(&self, settings: &ProjectionSettings) -> NewBlock {
        let block = NewBlock::new(self.header()).with_properties(self.book_properties(settings));
        if self.bookmarks.is_empty() {
            return block;
        }

        let bookmarks = self
            .distinct_bookmarks()
            .into_iter()
            .map(|b| b.to_block(settings.collapse_blocks))
            .collect();
        block.with_children(vec![NewBlock::new(BOOKMARKS_CONTAINER).with_children(bookmarks)])
    }
}

impl BookmarkRecord {
    pub fn bookmark_properties(&self, collapse: bool) -> Properties {
        let mut props = Properties::new();
        insert_opt(&mut props, "datetime", &self.timestamp);
        insert_opt(&mut props, "page", &self.page);
        insert_opt(&mut props, "chapter", &self.chapter);
        insert_collapsed(&mut props, collapse);
        props
    }

    pub fn note_block(&self) -> Option<NewBlock> {
        self.note.as_ref().map(NewBlock::new)
    }

    pub fn to_block(&self, collapse: bool) -> NewBlock {
        NewBlock::new(bookmark_identity(self))
            .with_properties(self.bookmark_properties(collapse))
            .with_children(self.note_block().into_iter().collect())
    }
}
