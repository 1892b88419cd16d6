//! Block Store Adapters
//!
//! The reconciliation engine never owns the block tree it writes to. Every
//! read and write goes through [`BlockStore`], which exposes nodes by opaque
//! [`NodeHandle`]s handed out by the store itself.
//!
//! # Adapters
//!
//! - [`memory::MemoryStore`] keeps the tree in process (tests, file backend)
//! - [`file::FileStore`] persists a `MemoryStore` as a JSON snapshot
//! - [`logseq::LogseqApi`] talks to a running Logseq through its HTTP API

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub mod file;
pub mod logseq;
pub mod memory;

pub type Properties = BTreeMap<String, String>;

/// Opaque, store-issued node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(String);

impl NodeHandle {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node read back from the store, with its descendants.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreNode {
    pub uuid: NodeHandle,
    pub content: String,
    pub properties: Properties,
    pub children: Vec<StoreNode>,
}

impl StoreNode {
    pub fn find_child(&self, content: &str) -> Option<&StoreNode> {
        self.children.iter().find(|c| c.content == content)
    }
}

/// A payload to insert. The store assigns the handles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewBlock {
    pub content: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NewBlock>,
}

impl NewBlock {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_children(mut self, children: Vec<NewBlock>) -> Self {
        self.children = children;
        self
    }
}

/// One row of [`BlockStore::query_children`]: a direct child of the queried
/// parent that carries the requested property.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub content: String,
    pub handle: NodeHandle,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    FirstChild,
    #[default]
    LastChild,
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// First top-level block of `page`, if the page exists and has one.
    async fn first_page_block(&self, page: &str) -> Result<Option<NodeHandle>, StoreError>;

    /// Appends a top-level block to `page`, creating the page when missing.
    async fn append_page_block(&self, page: &str, content: &str) -> Result<NodeHandle, StoreError>;

    /// Direct children of `parent` that carry `property`, with its value.
    async fn query_children(&self, parent: &NodeHandle, property: &str) -> Result<Vec<QueryRow>, StoreError>;

    async fn get_node(&self, handle: &NodeHandle) -> Result<Option<StoreNode>, StoreError>;

    async fn insert_node(
        &self,
        parent: &NodeHandle,
        content: &str,
        properties: &Properties,
    ) -> Result<NodeHandle, StoreError>;

    /// Inserts `block` and all of its children under `parent` and returns
    /// the handle of `block` itself.
    async fn insert_subtree(
        &self,
        parent: &NodeHandle,
        block: &NewBlock,
        placement: Placement,
    ) -> Result<NodeHandle, StoreError>;

    /// Replaces the content. Given properties are set key by key; keys not
    /// mentioned keep their stored value.
    async fn update_node(
        &self,
        handle: &NodeHandle,
        content: &str,
        properties: Option<&Properties>,
    ) -> Result<(), StoreError>;

    async fn remove_node(&self, handle: &NodeHandle) -> Result<(), StoreError>;
}
