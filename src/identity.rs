//! Identity keys used to match parsed records against synced blocks.
//!
//! Both keys are plain strings so they can be recomputed from what is
//! already in the store: a book is keyed by its `authors` property and its
//! `## title` header, a bookmark by its rendered `> excerpt` content.
//!
//! The book key is `authors + "___" + title` with no normalization. Titles
//! or authors containing `___` can collide; the first synced block wins.

use crate::model::BookmarkRecord;

pub const BOOK_KEY_SEPARATOR: &str = "___";
pub const TITLE_PREFIX: &str = "## ";
pub const EXCERPT_PREFIX: &str = "> ";

pub fn book_identity(authors: Option<&str>, title: &str) -> String {
    format!("{}{}{}", authors.unwrap_or_default(), BOOK_KEY_SEPARATOR, title)
}

/// A leading `-` would turn the excerpt into a list item.
pub fn escape_excerpt(text: &str) -> String {
    match text.strip_prefix('-') {
        Some(rest) => format!("\\-{}", rest),
        None => text.to_string(),
    }
}

pub fn bookmark_identity(bookmark: &BookmarkRecord) -> String {
    format!("{}{}", EXCERPT_PREFIX, escape_excerpt(bookmark.excerpt_text.trim()))
}

/// Title from the first `## ` header line of a book block.
pub fn title_from_content(content: &str) -> Option<&str> {
    content.lines().find_map(|line| line.strip_prefix(TITLE_PREFIX))
}
