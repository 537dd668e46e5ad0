//! Retrieval callbacks over externally managed datastores.
//!
//! A discussion lists the datastores it wants consulted; each one becomes a
//! [`RagCallback`] that the model can call as `search_<name>`. Query permission is
//! re-checked against the share table on every call, so revoking a share takes effect
//! mid-discussion.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::database::{ChatDatabase, DatastoreRecord};
use crate::tools::{Tool, ToolCategory, ToolContext, ToolOutput};

/// One retrieved chunk, as returned by the vector service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

/// The external vector store behind datastore handles.
#[async_trait]
pub trait DatastoreBackend: Send + Sync {
    async fn query(
        &self,
        datastore: &DatastoreRecord,
        query: &str,
        top_k: usize,
        min_similarity_percent: f32,
    ) -> Result<Vec<RetrievedDocument>>;
}

/// Talks to the RAG service over HTTP: `POST {base}/datastores/{id}/query`.
pub struct HttpDatastoreBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDatastoreBackend {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<RetrievedDocument>,
}

#[async_trait]
impl DatastoreBackend for HttpDatastoreBackend {
    async fn query(
        &self,
        datastore: &DatastoreRecord,
        query: &str,
        top_k: usize,
        min_similarity_percent: f32,
    ) -> Result<Vec<RetrievedDocument>> {
        let url = format!("{}/datastores/{}/query", self.base_url, datastore.id);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "query": query,
                "top_k": top_k,
                "min_similarity_percent": min_similarity_percent,
            }))
            .send()
            .await
            .with_context(|| format!("Failed to reach RAG service at {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("RAG service error ({}): {}", status, body);
        }
        let parsed: QueryResponse = response
            .json()
            .await
            .context("Failed to parse RAG service response")?;
        Ok(parsed.results)
    }
}

/// A datastore bound to one user for one turn.
pub struct RagCallback {
    tool_name: String,
    pub name: String,
    pub description: String,
    pub datastore_id: String,
    user_id: i64,
    top_k: usize,
    min_similarity_percent: f32,
    db: Arc<ChatDatabase>,
    backend: Arc<dyn DatastoreBackend>,
}

/// Callbacks keyed by datastore id.
pub type RagCallbacks = BTreeMap<String, Arc<RagCallback>>;

impl RagCallback {
    pub fn new(
        datastore: &DatastoreRecord,
        user_id: i64,
        top_k: usize,
        min_similarity_percent: f32,
        db: Arc<ChatDatabase>,
        backend: Arc<dyn DatastoreBackend>,
    ) -> Self {
        let description = if datastore.description.trim().is_empty() {
            format!("Search the '{}' knowledge base.", datastore.name)
        } else {
            datastore.description.clone()
        };
        Self {
            tool_name: tool_name_for(&datastore.name),
            name: datastore.name.clone(),
            description,
            datastore_id: datastore.id.clone(),
            user_id,
            top_k: top_k.max(1),
            min_similarity_percent,
            db,
            backend,
        }
    }

    /// Runs `query` against the datastore after re-checking that the user may query it.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedDocument>> {
        if !self.db.can_query_datastore(self.user_id, &self.datastore_id)? {
            anyhow::bail!(
                "User {} may not query datastore {}",
                self.user_id,
                self.datastore_id
            );
        }
        let datastore = self
            .db
            .get_datastore(&self.datastore_id)?
            .with_context(|| format!("Datastore {} no longer exists", self.datastore_id))?;
        self.backend
            .query(&datastore, query, self.top_k, self.min_similarity_percent)
            .await
    }
}

/// `search_<name>` with everything outside `[a-z0-9_]` folded to `_`.
pub fn tool_name_for(datastore_name: &str) -> String {
    let slug: String = datastore_name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "search_datastore".to_string()
    } else {
        format!("search_{}", slug)
    }
}

#[async_trait]
impl Tool for RagCallback {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let Some(query) = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
        else {
            return Ok(ToolOutput::Error("Missing required 'query' parameter".to_string()));
        };
        match self.retrieve(query).await {
            Ok(docs) => Ok(ToolOutput::Documents(docs)),
            Err(e) => {
                tracing::warn!("RAG query on {} failed: {:#}", self.datastore_id, e);
                Ok(ToolOutput::Error(format!("{}", e)))
            }
        }
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Retrieval
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::UserPreferences;
    use crate::database::tests::temp_db_path;
    use crate::database::DatastorePermission;
    use std::sync::Mutex;

    /// Returns canned documents and records the queries it saw.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub docs: Vec<RetrievedDocument>,
        pub seen: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl DatastoreBackend for FakeBackend {
        async fn query(
            &self,
            datastore: &DatastoreRecord,
            query: &str,
            top_k: usize,
            _min_similarity_percent: f32,
        ) -> Result<Vec<RetrievedDocument>> {
            self.seen
                .lock()
                .unwrap()
                .push((datastore.id.clone(), query.to_string(), top_k));
            Ok(self.docs.clone())
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            user_id: 0,
            username: String::new(),
            discussion_id: String::new(),
            allowed_tools: None,
        }
    }

    #[test]
    fn tool_names_are_slugged() {
        assert_eq!(tool_name_for("Company Wiki"), "search_company_wiki");
        assert_eq!(tool_name_for("  ---  "), "search_datastore");
    }

    #[tokio::test]
    async fn permission_is_checked_on_every_query() {
        let path = temp_db_path("rag");
        let db = Arc::new(ChatDatabase::new(&path).unwrap());
        let owner = db
            .create_user("owner", "t1", false, &UserPreferences::default())
            .unwrap();
        let friend = db
            .create_user("friend", "t2", false, &UserPreferences::default())
            .unwrap();
        let store = DatastoreRecord {
            id: "ds1".to_string(),
            owner_user_id: owner.id,
            name: "Wiki".to_string(),
            description: String::new(),
        };
        db.save_datastore(&store).unwrap();
        db.share_datastore("ds1", owner.id, friend.id, DatastorePermission::ReadQuery)
            .unwrap();

        let backend = Arc::new(FakeBackend {
            docs: vec![RetrievedDocument {
                title: "Page".to_string(),
                content: "text".to_string(),
                score: 80.0,
                metadata: json!({}),
            }],
            ..Default::default()
        });
        let callback = RagCallback::new(&store, friend.id, 3, 0.0, db.clone(), backend.clone());
        assert_eq!(callback.name(), "search_wiki");

        let out = callback.execute(json!({"query": "holidays"}), &ctx()).await.unwrap();
        assert!(matches!(out, ToolOutput::Documents(ref d) if d.len() == 1));

        db.share_datastore("ds1", owner.id, friend.id, DatastorePermission::ReadWrite)
            .unwrap();
        let _ = callback.retrieve("again").await.unwrap();

        let conn = db.lock_conn().unwrap();
        conn.execute("DELETE FROM datastore_shares", []).unwrap();
        drop(conn);
        let denied = callback.execute(json!({"query": "again"}), &ctx()).await.unwrap();
        assert!(matches!(denied, ToolOutput::Error(ref e) if e.contains("may not query")));
        assert_eq!(backend.seen.lock().unwrap().len(), 2);

        let _ = std::fs::remove_file(path);
    }
}
