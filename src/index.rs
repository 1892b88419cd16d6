use std::collections::HashMap;

use crate::error::StoreError;
use crate::identity::{book_identity, title_from_content};
use crate::store::{BlockStore, NodeHandle};

pub const AUTHORS_PROPERTY: &str = "authors";

/// Book identity to the handle of its previously synced block.
#[derive(Debug, Default, Clone)]
pub struct StoreIndex {
    books: HashMap<String, NodeHandle>,
}

impl StoreIndex {
    pub fn get(&self, identity: &str) -> Option<&NodeHandle> {
        self.books.get(identity)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

/// Issues one query for the direct children of `container` that carry an
/// `authors` property and keys them by book identity. The first block wins
/// when two share an identity.
pub async fn build_index(store: &dyn BlockStore, container: &NodeHandle) -> Result<StoreIndex, StoreError> {
    let rows = store.query_children(container, AUTHORS_PROPERTY).await?;
    let mut index = StoreIndex::default();

    for row in rows {
        let Some(title) = title_from_content(&row.content) else {
            tracing::warn!(block = %row.handle, "synced block has no title header, skipping");
            continue;
        };

        let key = book_identity(Some(&row.value), title);
        if let Some(existing) = index.books.get(&key) {
            tracing::warn!(
                key = %key,
                kept = %existing,
                ignored = %row.handle,
                "duplicate synced book, keeping the first block"
            );
            continue;
        }
        index.books.insert(key, row.handle);
    }

    tracing::info!(books = index.len(), "indexed synced books");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Properties;
    use crate::store::memory::MemoryStore;

    fn authors(name: &str) -> Properties {
        [("authors".to_string(), name.to_string())].into_iter().collect()
    }

    #[tokio::test]
    async fn test_build_index_keys_by_identity() {
        let store = MemoryStore::new();
        let root = store.append_page_block("sync", "status").await.unwrap();
        let dune = store.insert_node(&root, "## Dune", &authors("Frank Herbert")).await.unwrap();
        let anon = store.insert_node(&root, "## Beowulf", &authors("")).await.unwrap();
        store.insert_node(&root, "user note", &Properties::new()).await.unwrap();

        let index = build_index(&store, &root).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("Frank Herbert___Dune"), Some(&dune));
        assert_eq!(index.get("___Beowulf"), Some(&anon));
    }

    #[tokio::test]
    async fn test_build_index_skips_headerless_and_keeps_first_duplicate() {
        let store = MemoryStore::new();
        let root = store.append_page_block("sync", "status").await.unwrap();
        store.insert_node(&root, "no header", &authors("A")).await.unwrap();
        let first = store.insert_node(&root, "## T", &authors("A")).await.unwrap();
        store.insert_node(&root, "## T", &authors("A")).await.unwrap();

        let index = build_index(&store, &root).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("A___T"), Some(&first));
    }

    #[tokio::test]
    async fn test_build_index_ignores_grandchildren() {
        let store = MemoryStore::new();
        let root = store.append_page_block("sync", "status").await.unwrap();
        let book = store.insert_node(&root, "## T", &authors("A")).await.unwrap();
        store.insert_node(&book, "## Nested", &authors("B")).await.unwrap();

        let index = build_index(&store, &root).await.unwrap();
        assert!(index.get("B___Nested").is_none());
    }

    #[tokio::test]
    async fn test_build_index_propagates_query_failure() {
        let store = MemoryStore::new();
        let missing = NodeHandle::new("missing");
        assert!(build_index(&store, &missing).await.is_err());
    }
}
