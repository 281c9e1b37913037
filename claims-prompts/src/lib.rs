#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Smart-prompt workflow: one yes/no/review question per matched claim.
//!
//! Simplified from the multi-stage approval chain this crate is grounded
//! on — §4.7 of the routing contract only ever asks a single fixed-option
//! question per match, so there is no assignment/multi-approver routing
//! table here, just `Pending -> Answered`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type PromptId = String;
pub type ClaimId = String;
pub type DocumentId = String;

pub type PromptsResult<T> = Result<T, PromptsError>;

#[derive(Debug, Error)]
pub enum PromptsError {
    #[error("prompt {0} was not found")]
    NotFound(PromptId),
    #[error("prompt is already answered")]
    AlreadyAnswered,
    #[error("validation error: {0}")]
    Validation(String),
}

/// The three fixed options every smart-prompt offers. There is no
/// provision for a custom option set: §4.7 names exactly these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptAnswer {
    Yes,
    No,
    Review,
}

impl PromptAnswer {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PromptAnswer::Yes => "yes",
            PromptAnswer::No => "no",
            PromptAnswer::Review => "review",
        }
    }
}

#[must_use]
pub fn fixed_options() -> [PromptAnswer; 3] {
    [PromptAnswer::Yes, PromptAnswer::No, PromptAnswer::Review]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptStatus {
    Pending,
    Answered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartPrompt {
    pub id: PromptId,
    pub claim_id: ClaimId,
    pub document_id: DocumentId,
    pub status: PromptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<PromptAnswer>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    /// Creates a prompt for `(claim_id, document_id)` if one does not
    /// already exist; otherwise returns the existing prompt unchanged. This
    /// is what keeps a re-run matcher pass from minting duplicate prompts.
    async fn create_or_get(&self, claim_id: &ClaimId, document_id: &DocumentId) -> SmartPrompt;
    async fn answer(&self, prompt_id: &PromptId, answer: PromptAnswer) -> PromptsResult<SmartPrompt>;
    async fn get(&self, prompt_id: &PromptId) -> PromptsResult<SmartPrompt>;
    async fn count(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryPromptStore {
    by_id: RwLock<HashMap<PromptId, SmartPrompt>>,
    by_match: RwLock<HashMap<(ClaimId, DocumentId), PromptId>>,
}

impl InMemoryPromptStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PromptStore for InMemoryPromptStore {
    async fn create_or_get(&self, claim_id: &ClaimId, document_id: &DocumentId) -> SmartPrompt {
        let key = (claim_id.clone(), document_id.clone());
        let mut by_match = self.by_match.write().await;
        if let Some(existing_id) = by_match.get(&key) {
            let by_id = self.by_id.read().await;
            return by_id.get(existing_id).cloned().unwrap();
        }

        let prompt = SmartPrompt {
            id: Uuid::new_v4().to_string(),
            claim_id: claim_id.clone(),
            document_id: document_id.clone(),
            status: PromptStatus::Pending,
            answer: None,
            created_at: Utc::now(),
            answered_at: None,
        };
        by_match.insert(key, prompt.id.clone());
        self.by_id
            .write()
            .await
            .insert(prompt.id.clone(), prompt.clone());
        prompt
    }

    async fn answer(
        &self,
        prompt_id: &PromptId,
        answer: PromptAnswer,
    ) -> PromptsResult<SmartPrompt> {
        let mut by_id = self.by_id.write().await;
        let prompt = by_id
            .get_mut(prompt_id)
            .ok_or_else(|| PromptsError::NotFound(prompt_id.clone()))?;
        if prompt.status == PromptStatus::Answered {
            return Err(PromptsError::AlreadyAnswered);
        }
        prompt.status = PromptStatus::Answered;
        prompt.answer = Some(answer);
        prompt.answered_at = Some(Utc::now());
        Ok(prompt.clone())
    }

    async fn get(&self, prompt_id: &PromptId) -> PromptsResult<SmartPrompt> {
        self.by_id
            .read()
            .await
            .get(prompt_id)
            .cloned()
            .ok_or_else(|| PromptsError::NotFound(prompt_id.clone()))
    }

    async fn count(&self) -> usize {
        self.by_id.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn create_or_get_is_idempotent_per_match() {
        let store = InMemoryPromptStore::new();
        let first = store.create_or_get(&"C1".into(), &"D1".into()).await;
        let second = store.create_or_get(&"C1".into(), &"D1".into()).await;
        assert_eq!(first.id, second.id);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn answer_transitions_to_answered() {
        let store = InMemoryPromptStore::new();
        let prompt = store.create_or_get(&"C1".into(), &"D1".into()).await;
        let answered = store
            .answer(&prompt.id, PromptAnswer::Yes)
            .await
            .expect("answer");
        assert_eq!(answered.status, PromptStatus::Answered);
        assert_eq!(answered.answer, Some(PromptAnswer::Yes));
    }

    #[tokio::test]
    async fn answering_twice_fails() {
        let store = InMemoryPromptStore::new();
        let prompt = store.create_or_get(&"C1".into(), &"D1".into()).await;
        store
            .answer(&prompt.id, PromptAnswer::No)
            .await
            .expect("first answer");
        let result = store.answer(&prompt.id, PromptAnswer::Yes).await;
        assert!(matches!(result, Err(PromptsError::AlreadyAnswered)));
    }

    #[test]
    fn fixed_options_are_exactly_three() {
        let options = fixed_options();
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].as_str(), "yes");
        assert_eq!(options[1].as_str(), "no");
        assert_eq!(options[2].as_str(), "review");
    }
}
