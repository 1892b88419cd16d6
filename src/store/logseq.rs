//! Logseq HTTP API adapter
//!
//! Logseq's desktop app exposes its plugin API over HTTP: every call is a
//! `POST` of `{"method": "logseq.Editor.getBlock", "args": [...]}` with a
//! bearer token, answered with the method's JSON return value.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{BlockStore, NewBlock, NodeHandle, Placement, Properties, QueryRow, StoreNode};
use crate::error::StoreError;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:12315/api";

pub struct LogseqApi {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl LogseqApi {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, StoreError> {
        tracing::debug!(method, "logseq api call");
        let mut request = self.client.post(&self.url).json(&json!({
            "method": method,
            "args": args,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Request(format!("{} returned {}: {}", method, status, body)));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        let value: Value = serde_json::from_str(&body)?;
        if let Some(err) = value.as_object().and_then(|o| o.get("error")) {
            return Err(StoreError::Request(format!("{}: {}", method, stringify(err))));
        }
        Ok(value)
    }

    async fn ensure_page(&self, page: &str) -> Result<(), StoreError> {
        if self.call("logseq.Editor.getPage", json!([page])).await?.is_null() {
            tracing::info!(page, "creating page");
            self.call(
                "logseq.Editor.createPage",
                json!([page, {}, {"redirect": false, "createFirstBlock": false}]),
            )
            .await?;
        }
        Ok(())
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn is_property_line(line: &str) -> bool {
    match line.split_once(":: ") {
        Some((key, _)) => {
            !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        None => false,
    }
}

/// Logseq inlines `key:: value` lines into block content; drop them so
/// content compares equal to what was inserted.
fn strip_property_lines(content: &str) -> String {
    content
        .lines()
        .filter(|l| !is_property_line(l))
        .collect::<Vec<_>>()
        .join("\n")
}

fn handle_of(block: &Value) -> Result<NodeHandle, StoreError> {
    block
        .get("uuid")
        .and_then(Value::as_str)
        .map(NodeHandle::new)
        .ok_or_else(|| StoreError::UnexpectedResponse(format!("block without uuid: {}", block)))
}

fn node_from_json(block: &Value) -> Result<StoreNode, StoreError> {
    let properties = block
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.iter().map(|(k, v)| (k.clone(), stringify(v))).collect())
        .unwrap_or_default();

    // Without includeChildren Logseq returns ["uuid", id] pairs; only expanded
    // children are objects.
    let children = block
        .get("children")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|c| c.is_object())
                .map(node_from_json)
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(StoreNode {
        uuid: handle_of(block)?,
        content: strip_property_lines(block.get("content").and_then(Value::as_str).unwrap_or_default()),
        properties,
        children,
    })
}

#[async_trait]
impl BlockStore for LogseqApi {
    async fn first_page_block(&self, page: &str) -> Result<Option<NodeHandle>, StoreError> {
        let tree = self.call("logseq.Editor.getPageBlocksTree", json!([page])).await?;
        match tree.as_array().and_then(|blocks| blocks.first()) {
            Some(block) => Ok(Some(handle_of(block)?)),
            None => Ok(None),
        }
    }

    async fn append_page_block(&self, page: &str, content: &str) -> Result<NodeHandle, StoreError> {
        self.ensure_page(page).await?;
        let block = self
            .call("logseq.Editor.appendBlockInPage", json!([page, content]))
            .await?;
        handle_of(&block)
    }

    async fn query_children(&self, parent: &NodeHandle, property: &str) -> Result<Vec<QueryRow>, StoreError> {
        let query = format!(
            r#"[:find (pull ?b [:block/content :block/uuid]) ?value
 :where
 [?b :block/parent ?p]
 [?p :block/uuid #uuid "{}"]
 [?b :block/properties ?props]
 [(get ?props :{}) ?value]]"#,
            parent, property
        );
        let rows = self.call("logseq.DB.datascriptQuery", json!([query])).await?;

        let Some(rows) = rows.as_array() else {
            return Ok(Vec::new());
        };

        rows.iter()
            .map(|row| {
                let block = row.get(0).unwrap_or(&Value::Null);
                Ok(QueryRow {
                    content: block
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    handle: handle_of(block)?,
                    value: row.get(1).map(stringify).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn get_node(&self, handle: &NodeHandle) -> Result<Option<StoreNode>, StoreError> {
        let block = self
            .call("logseq.Editor.getBlock", json!([handle.as_str(), {"includeChildren": true}]))
            .await?;
        if block.is_null() {
            return Ok(None);
        }
        node_from_json(&block).map(Some)
    }

    async fn insert_node(
        &self,
        parent: &NodeHandle,
        content: &str,
        properties: &Properties,
    ) -> Result<NodeHandle, StoreError> {
        let block = self
            .call(
                "logseq.Editor.insertBlock",
                json!([parent.as_str(), content, {"sibling": false, "properties": properties}]),
            )
            .await?;
        handle_of(&block)
    }

    async fn insert_subtree(
        &self,
        parent: &NodeHandle,
        block: &NewBlock,
        placement: Placement,
    ) -> Result<NodeHandle, StoreError> {
        let inserted = self
            .call(
                "logseq.Editor.insertBatchBlock",
                json!([
                    parent.as_str(),
                    [block],
                    {"sibling": false, "before": placement == Placement::FirstChild}
                ]),
            )
            .await?;

        match inserted.as_array().and_then(|blocks| blocks.first()) {
            Some(first) => handle_of(first),
            None => Err(StoreError::UnexpectedResponse(format!(
                "insertBatchBlock returned {}",
                inserted
            ))),
        }
    }

    async fn update_node(
        &self,
        handle: &NodeHandle,
        content: &str,
        properties: Option<&Properties>,
    ) -> Result<(), StoreError> {
        let args = match properties {
            Some(props) => json!([handle.as_str(), content, {"properties": props}]),
            None => json!([handle.as_str(), content]),
        };
        self.call("logseq.Editor.updateBlock", args).await?;
        Ok(())
    }

    async fn remove_node(&self, handle: &NodeHandle) -> Result<(), StoreError> {
        self.call("logseq.Editor.removeBlock", json!([handle.as_str()])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount(server: &MockServer, api_method: &str, response: Value) {
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(body_partial_json(json!({ "method": api_method })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(server)
            .await;
    }

    fn api(server: &MockServer) -> LogseqApi {
        LogseqApi::new(format!("{}/api", server.uri()), Some("secret".into()))
    }

    #[test]
    fn test_strip_property_lines() {
        assert_eq!(
            strip_property_lines("## Dune\nauthors:: Frank Herbert\ncollapsed:: true"),
            "## Dune"
        );
        assert_eq!(strip_property_lines("> a:: b is prose"), "> a:: b is prose");
    }

    #[tokio::test]
    async fn test_get_node_reads_nested_children() {
        let server = MockServer::start().await;
        mount(
            &server,
            "logseq.Editor.getBlock",
            json!({
                "uuid": "b-1",
                "content": "## Dune\nauthors:: Frank Herbert",
                "properties": {"authors": "Frank Herbert", "tags": ["scifi", "classic"]},
                "children": [
                    {"uuid": "c-1", "content": "### Bookmarks", "children": []}
                ]
            }),
        )
        .await;

        let node = api(&server)
            .get_node(&NodeHandle::new("b-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.content, "## Dune");
        assert_eq!(node.properties.get("tags").map(String::as_str), Some("scifi, classic"));
        assert_eq!(node.children[0].uuid, NodeHandle::new("c-1"));
    }

    #[tokio::test]
    async fn test_get_node_missing_is_none() {
        let server = MockServer::start().await;
        mount(&server, "logseq.Editor.getBlock", Value::Null).await;

        let node = api(&server).get_node(&NodeHandle::new("gone")).await.unwrap();
        assert!(node.is_none());
    }

    #[tokio::test]
    async fn test_query_children_sends_token_and_maps_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({ "method": "logseq.DB.datascriptQuery" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                [{"content": "## Dune\nauthors:: Frank Herbert", "uuid": "b-1"}, "Frank Herbert"]
            ])))
            .mount(&server)
            .await;

        let rows = api(&server)
            .query_children(&NodeHandle::new("root"), "authors")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].handle, NodeHandle::new("b-1"));
        assert_eq!(rows[0].value, "Frank Herbert");
    }

    #[tokio::test]
    async fn test_http_failure_is_request_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let result = api(&server).first_page_block("sync").await;
        assert!(matches!(result, Err(StoreError::Request(msg)) if msg.contains("401")));
    }

    #[tokio::test]
    async fn test_insert_subtree_returns_first_uuid() {
        let server = MockServer::start().await;
        mount(
            &server,
            "logseq.Editor.insertBatchBlock",
            json!([{"uuid": "new-1", "content": "## T"}]),
        )
        .await;

        let handle = api(&server)
            .insert_subtree(&NodeHandle::new("root"), &NewBlock::new("## T"), Placement::LastChild)
            .await
            .unwrap();
        assert_eq!(handle, NodeHandle::new("new-1"));
    }

    async fn mount_exact(server: &MockServer, api_method: &str, args: Value, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(body_json(json!({ "method": api_method, "args": args })))
            .respond_with(response)
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_update_node_with_properties() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(body_partial_json(json!({
                "method": "logseq.Editor.updateBlock",
                "args": ["b-1", "## Dune", {"properties": {"authors": "Frank Herbert", "collapsed": "true"}}]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let props: Properties = [("authors", "Frank Herbert"), ("collapsed", "true")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        api(&server)
            .update_node(&NodeHandle::new("b-1"), "## Dune", Some(&props))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_node_content_only() {
        let server = MockServer::start().await;
        mount_exact(
            &server,
            "logseq.Editor.updateBlock",
            json!(["b-1", "KOReader sync cancelled"]),
            ResponseTemplate::new(200),
        )
        .await;

        api(&server)
            .update_node(&NodeHandle::new("b-1"), "KOReader sync cancelled", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_node_as_child() {
        let server = MockServer::start().await;
        mount_exact(
            &server,
            "logseq.Editor.insertBlock",
            json!(["h-1", "my note", {"sibling": false, "properties": {}}]),
            ResponseTemplate::new(200).set_body_json(json!({"uuid": "n-1", "content": "my note"})),
        )
        .await;

        let handle = api(&server)
            .insert_node(&NodeHandle::new("h-1"), "my note", &Properties::new())
            .await
            .unwrap();
        assert_eq!(handle, NodeHandle::new("n-1"));
    }

    #[tokio::test]
    async fn test_remove_node() {
        let server = MockServer::start().await;
        mount_exact(
            &server,
            "logseq.Editor.removeBlock",
            json!(["n-1"]),
            ResponseTemplate::new(200),
        )
        .await;

        api(&server).remove_node(&NodeHandle::new("n-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_subtree_first_child() {
        let server = MockServer::start().await;
        mount_exact(
            &server,
            "logseq.Editor.insertBatchBlock",
            json!(["root", [{"content": "## T"}], {"sibling": false, "before": true}]),
            ResponseTemplate::new(200).set_body_json(json!([{"uuid": "new-1"}])),
        )
        .await;

        let handle = api(&server)
            .insert_subtree(&NodeHandle::new("root"), &NewBlock::new("## T"), Placement::FirstChild)
            .await
            .unwrap();
        assert_eq!(handle, NodeHandle::new("new-1"));
    }

    #[tokio::test]
    async fn test_append_page_block_creates_missing_page() {
        let server = MockServer::start().await;
        mount_exact(
            &server,
            "logseq.Editor.getPage",
            json!(["koreader"]),
            ResponseTemplate::new(200).set_body_json(Value::Null),
        )
        .await;
        mount_exact(
            &server,
            "logseq.Editor.createPage",
            json!(["koreader", {}, {"redirect": false, "createFirstBlock": false}]),
            ResponseTemplate::new(200).set_body_json(json!({"name": "koreader"})),
        )
        .await;
        mount_exact(
            &server,
            "logseq.Editor.appendBlockInPage",
            json!(["koreader", "status"]),
            ResponseTemplate::new(200).set_body_json(json!({"uuid": "s-1", "content": "status"})),
        )
        .await;

        let handle = api(&server).append_page_block("koreader", "status").await.unwrap();
        assert_eq!(handle, NodeHandle::new("s-1"));
    }

    #[tokio::test]
    async fn test_append_page_block_reuses_existing_page() {
        let server = MockServer::start().await;
        mount(&server, "logseq.Editor.getPage", json!({"name": "koreader"})).await;
        Mock::given(body_partial_json(json!({ "method": "logseq.Editor.createPage" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        mount(
            &server,
            "logseq.Editor.appendBlockInPage",
            json!({"uuid": "s-2", "content": "status"}),
        )
        .await;

        let handle = api(&server).append_page_block("koreader", "status").await.unwrap();
        assert_eq!(handle, NodeHandle::new("s-2"));
    }
}
