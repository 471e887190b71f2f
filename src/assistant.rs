//! Hosted document-assistant backend.
//!
//! The assistant owns chunking, retrieval, and answer generation over the
//! files uploaded to it. We send the question and receive a narrative answer
//! plus citations pointing back into those files; [`normalize`] folds that
//! into an [`AssistantAnswer`] with one score-less match per citation.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::AssistantConfig;
use crate::models::{AssistantAnswer, Filters, Match};
use crate::vector::{base_url, pinecone_filter};

/// Raw assistant reply before normalization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantReply {
    pub message: AssistantMessage,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Citation {
    /// Character offset in the narrative the citation attaches to.
    #[serde(default)]
    pub position: Option<u64>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Reference {
    pub file: CitedFile,
    #[serde(default)]
    pub pages: Vec<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CitedFile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub signed_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, Value>>,
}

/// A service that answers free-text questions with citations.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn ask(&self, question: &str, filters: &Filters) -> Result<AssistantReply>;
}

/// Client for a Pinecone Assistant.
pub struct PineconeAssistant {
    chat_url: String,
    api_key: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl PineconeAssistant {
    pub fn new(config: &AssistantConfig, api_key: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            chat_url: format!("{}/assistant/chat/{}", base_url(&config.host), config.name),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl AssistantBackend for PineconeAssistant {
    fn name(&self) -> &str {
        "pinecone-assistant"
    }

    async fn ask(&self, question: &str, filters: &Filters) -> Result<AssistantReply> {
        let mut body = json!({
            "messages": [{ "role": "user", "content": question }],
            "stream": false,
        });
        if let Some(ref model) = self.model {
            body["model"] = json!(model);
        }
        if let Some(filter) = pinecone_filter(filters) {
            body["filter"] = filter;
        }

        let resp = self
            .client
            .post(&self.chat_url)
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.chat_url))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            bail!("Assistant rejected the API key (HTTP {})", status);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Assistant chat failed (HTTP {}): {}",
                status,
                text.chars().take(300).collect::<String>()
            );
        }

        resp.json().await.context("Invalid assistant chat response")
    }
}

/// Fold an assistant reply into the common result shape.
///
/// Each citation becomes exactly one match with `score: None`. The match
/// takes its id and metadata from the citation's first referenced file and
/// lists every referenced file and page in its text. `source_uri` is set
/// from the file's signed URL when the service provides one.
pub fn normalize(reply: AssistantReply) -> AssistantAnswer {
    let matches = reply
        .citations
        .into_iter()
        .enumerate()
        .map(|(i, citation)| citation_to_match(i, citation))
        .collect();

    AssistantAnswer {
        narrative: reply.message.content,
        matches,
    }
}

fn citation_to_match(index: usize, citation: Citation) -> Match {
    let text = citation
        .references
        .iter()
        .map(|r| {
            if r.pages.is_empty() {
                r.file.name.clone()
            } else {
                let pages: Vec<String> = r.pages.iter().map(u64::to_string).collect();
                format!("{} (p. {})", r.file.name, pages.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("; ");

    let first = citation.references.into_iter().next();
    let mut metadata = BTreeMap::new();
    let mut id = format!("citation-{}", index + 1);

    if let Some(reference) = first {
        if let Some(file_id) = reference.file.id {
            id = file_id;
        }
        metadata.extend(reference.file.metadata.unwrap_or_default());
        metadata.insert("file_name".to_string(), json!(reference.file.name));
        if !reference.pages.is_empty() {
            metadata.insert("pages".to_string(), json!(reference.pages));
        }
        if let Some(url) = reference.file.signed_url {
            metadata.insert("source_uri".to_string(), json!(url));
        }
    }
    if let Some(pos) = citation.position {
        metadata.insert("position".to_string(), json!(pos));
    }

    Match {
        id,
        score: None,
        text,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply() -> AssistantReply {
        serde_json::from_value(json!({
            "message": {"role": "assistant", "content": "MFA is covered by IA-2 and CC6.1."},
            "citations": [
                {"position": 10, "references": [
                    {"file": {"id": "f1", "name": "nist.pdf", "signed_url": "https://signed/f1",
                              "metadata": {"framework": "NIST80053", "control_id": "IA-2"}},
                     "pages": [4, 5]}
                ]},
                {"position": 20, "references": [
                    {"file": {"name": "soc2.pdf"}, "pages": []},
                    {"file": {"name": "policy.md"}, "pages": [1]}
                ]},
                {"references": []}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_three_citations_become_three_unscored_matches() {
        let answer = normalize(reply());
        assert_eq!(answer.narrative, "MFA is covered by IA-2 and CC6.1.");
        assert_eq!(answer.matches.len(), 3);
        assert!(answer.matches.iter().all(|m| m.score.is_none()));
    }

    #[test]
    fn test_citation_fields() {
        let answer = normalize(reply());
        let first = &answer.matches[0];
        assert_eq!(first.id, "f1");
        assert_eq!(first.text, "nist.pdf (p. 4, 5)");
        assert_eq!(first.framework(), Some("NIST80053"));
        assert_eq!(first.metadata["source_uri"], "https://signed/f1");
        assert_eq!(first.metadata["position"], 10);

        let second = &answer.matches[1];
        assert_eq!(second.id, "citation-2");
        assert_eq!(second.text, "soc2.pdf; policy.md (p. 1)");

        assert_eq!(answer.matches[2].id, "citation-3");
        assert_eq!(answer.matches[2].text, "");
    }

    #[test]
    fn test_reply_without_citations() {
        let reply: AssistantReply =
            serde_json::from_value(json!({"message": {"content": "No idea."}})).unwrap();
        let answer = normalize(reply);
        assert!(answer.matches.is_empty());
    }
}
