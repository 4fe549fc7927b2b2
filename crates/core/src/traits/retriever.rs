//! Document retrieval interface (backs `knowledge.ask`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A retrieved document fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    /// Relevance score from the retriever
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A document-grounded context bundle for the response prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalBundle {
    pub documents: Vec<Document>,
}

impl RetrievalBundle {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Render the bundle as prompt context.
    pub fn as_context(&self) -> String {
        self.documents
            .iter()
            .map(|d| match &d.title {
                Some(title) => format!("[{}]\n{}", title, d.content),
                None => d.content.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// External retrieval collaborator
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve the most relevant documents for `query`, optionally scoped
    /// to one knowledge base.
    async fn retrieve(
        &self,
        query: &str,
        knowledge_base: Option<&str>,
        limit: usize,
    ) -> Result<RetrievalBundle>;
}
