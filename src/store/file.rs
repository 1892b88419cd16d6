use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::memory::MemoryStore;
use super::{BlockStore, NewBlock, NodeHandle, Placement, Properties, QueryRow, StoreNode};
use crate::error::StoreError;

/// A [`MemoryStore`] persisted as a JSON snapshot. Every mutation is
/// written through, so an interrupted run keeps what it already applied.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = match tokio::fs::read_to_string(&path).await {
            Ok(json) => MemoryStore::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = ?path, "store file missing, starting empty");
                MemoryStore::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, inner })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let json = self.inner.to_json().await?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = ?self.path, "store snapshot written");
        Ok(())
    }
}

#[async_trait]
impl BlockStore for FileStore {
    async fn first_page_block(&self, page: &str) -> Result<Option<NodeHandle>, StoreError> {
        self.inner.first_page_block(page).await
    }

    async fn append_page_block(&self, page: &str, content: &str) -> Result<NodeHandle, StoreError> {
        let handle = self.inner.append_page_block(page, content).await?;
        self.persist().await?;
        Ok(handle)
    }

    async fn query_children(&self, parent: &NodeHandle, property: &str) -> Result<Vec<QueryRow>, StoreError> {
        self.inner.query_children(parent, property).await
    }

    async fn get_node(&self, handle: &NodeHandle) -> Result<Option<StoreNode>, StoreError> {
        self.inner.get_node(handle).await
    }

    async fn insert_node(
        &self,
        parent: &NodeHandle,
        content: &str,
        properties: &Properties,
    ) -> Result<NodeHandle, StoreError> {
        let handle = self.inner.insert_node(parent, content, properties).await?;
        self.persist().await?;
        Ok(handle)
    }

    async fn insert_subtree(
        &self,
        parent: &NodeHandle,
        block: &NewBlock,
        placement: Placement,
    ) -> Result<NodeHandle, StoreError> {
        let handle = self.inner.insert_subtree(parent, block, placement).await?;
        self.persist().await?;
        Ok(handle)
    }

    async fn update_node(
        &self,
        handle: &NodeHandle,
        content: &str,
        properties: Option<&Properties>,
    ) -> Result<(), StoreError> {
        self.inner.update_node(handle, content, properties).await?;
        self.persist().await
    }

    async fn remove_node(&self, handle: &NodeHandle) -> Result<(), StoreError> {
        self.inner.remove_node(handle).await?;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph").join("store.json");

        let store = FileStore::open(&path).await.unwrap();
        let root = store.append_page_block("sync", "status").await.unwrap();
        let child = store.insert_node(&root, "## T", &Properties::new()).await.unwrap();
        store.update_node(&root, "done", None).await.unwrap();
        assert!(path.exists());

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.first_page_block("sync").await.unwrap(), Some(root.clone()));
        let node = reopened.get_node(&root).await.unwrap().unwrap();
        assert_eq!(node.content, "done");
        assert_eq!(node.children[0].uuid, child);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
