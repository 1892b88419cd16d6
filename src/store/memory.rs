use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{BlockStore, NewBlock, NodeHandle, Placement, Properties, QueryRow, StoreNode};
use crate::error::StoreError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NodeRecord {
    content: String,
    #[serde(default)]
    properties: Properties,
    #[serde(default)]
    children: Vec<NodeHandle>,
    parent: Option<NodeHandle>,
    page: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tree {
    pages: BTreeMap<String, Vec<NodeHandle>>,
    nodes: BTreeMap<NodeHandle, NodeRecord>,
}

impl Tree {
    fn next_handle() -> NodeHandle {
        NodeHandle::new(uuid::Uuid::new_v4().to_string())
    }

    fn siblings_mut(&mut self, page: &str, parent: Option<&NodeHandle>) -> Option<&mut Vec<NodeHandle>> {
        match parent {
            Some(p) => self.nodes.get_mut(p).map(|n| &mut n.children),
            None => self.pages.get_mut(page),
        }
    }

    fn insert(
        &mut self,
        parent: &NodeHandle,
        content: &str,
        properties: &Properties,
        placement: Placement,
    ) -> Result<NodeHandle, StoreError> {
        let page = match self.nodes.get(parent) {
            Some(p) => p.page.clone(),
            None => return Err(StoreError::NotFound(parent.to_string())),
        };

        let handle = Self::next_handle();
        self.nodes.insert(
            handle.clone(),
            NodeRecord {
                content: content.to_string(),
                properties: properties.clone(),
                children: Vec::new(),
                parent: Some(parent.clone()),
                page,
            },
        );

        if let Some(p) = self.nodes.get_mut(parent) {
            match placement {
                Placement::FirstChild => p.children.insert(0, handle.clone()),
                Placement::LastChild => p.children.push(handle.clone()),
            }
        }

        Ok(handle)
    }

    fn insert_block(
        &mut self,
        parent: &NodeHandle,
        block: &NewBlock,
        placement: Placement,
    ) -> Result<NodeHandle, StoreError> {
        let handle = self.insert(parent, &block.content, &block.properties, placement)?;
        for child in &block.children {
            self.insert_block(&handle, child, Placement::LastChild)?;
        }
        Ok(handle)
    }

    fn build(&self, handle: &NodeHandle) -> Option<StoreNode> {
        let record = self.nodes.get(handle)?;
        Some(StoreNode {
            uuid: handle.clone(),
            content: record.content.clone(),
            properties: record.properties.clone(),
            children: record.children.iter().filter_map(|c| self.build(c)).collect(),
        })
    }

    fn remove(&mut self, handle: &NodeHandle) -> Result<(), StoreError> {
        let record = self
            .nodes
            .remove(handle)
            .ok_or_else(|| StoreError::NotFound(handle.to_string()))?;

        if let Some(siblings) = self.siblings_mut(&record.page, record.parent.as_ref()) {
            siblings.retain(|h| h != handle);
        }

        let mut pending = record.children;
        while let Some(child) = pending.pop() {
            if let Some(removed) = self.nodes.remove(&child) {
                pending.extend(removed.children);
            }
        }
        Ok(())
    }
}

/// An in-process block tree.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let tree: Tree = serde_json::from_str(json)?;
        Ok(Self { tree: Mutex::new(tree) })
    }

    pub async fn to_json(&self) -> Result<String, StoreError> {
        let tree = self.tree.lock().await;
        Ok(serde_json::to_string_pretty(&*tree)?)
    }

    /// Top-level blocks of `page` with their descendants.
    pub async fn page_tree(&self, page: &str) -> Vec<StoreNode> {
        let tree = self.tree.lock().await;
        tree.pages
            .get(page)
            .map(|roots| roots.iter().filter_map(|h| tree.build(h)).collect())
            .unwrap_or_default()
    }

    pub async fn node_count(&self) -> usize {
        self.tree.lock().await.nodes.len()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn first_page_block(&self, page: &str) -> Result<Option<NodeHandle>, StoreError> {
        let tree = self.tree.lock().await;
        Ok(tree.pages.get(page).and_then(|roots| roots.first().cloned()))
    }

    async fn append_page_block(&self, page: &str, content: &str) -> Result<NodeHandle, StoreError> {
        let mut tree = self.tree.lock().await;
        let handle = Tree::next_handle();
        tree.nodes.insert(
            handle.clone(),
            NodeRecord {
                content: content.to_string(),
                page: page.to_string(),
                ..Default::default()
            },
        );
        tree.pages.entry(page.to_string()).or_default().push(handle.clone());
        Ok(handle)
    }

    async fn query_children(&self, parent: &NodeHandle, property: &str) -> Result<Vec<QueryRow>, StoreError> {
        let tree = self.tree.lock().await;
        let parent = tree
            .nodes
            .get(parent)
            .ok_or_else(|| StoreError::NotFound(parent.to_string()))?;

        Ok(parent
            .children
            .iter()
            .filter_map(|h| {
                let child = tree.nodes.get(h)?;
                let value = child.properties.get(property)?;
                Some(QueryRow {
                    content: child.content.clone(),
                    handle: h.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }

    async fn get_node(&self, handle: &NodeHandle) -> Result<Option<StoreNode>, StoreError> {
        Ok(self.tree.lock().await.build(handle))
    }

    async fn insert_node(
        &self,
        parent: &NodeHandle,
        content: &str,
        properties: &Properties,
    ) -> Result<NodeHandle, StoreError> {
        self.tree
            .lock()
            .await
            .insert(parent, content, properties, Placement::LastChild)
    }

    async fn insert_subtree(
        &self,
        parent: &NodeHandle,
        block: &NewBlock,
        placement: Placement,
    ) -> Result<NodeHandle, StoreError> {
        self.tree.lock().await.insert_block(parent, block, placement)
    }

    async fn update_node(
        &self,
        handle: &NodeHandle,
        content: &str,
        properties: Option<&Properties>,
    ) -> Result<(), StoreError> {
        let mut tree = self.tree.lock().await;
        let node = tree
            .nodes
            .get_mut(handle)
            .ok_or_else(|| StoreError::NotFound(handle.to_string()))?;

        node.content = content.to_string();
        if let Some(props) = properties {
            for (k, v) in props {
                node.properties.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn remove_node(&self, handle: &NodeHandle) -> Result<(), StoreError> {
        self.tree.lock().await.remove(handle)
    }
}
