#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Confidence Router: gates a Matcher outcome into `auto_submit`,
//! `smart_prompt`, or `hold`, and turns that decision into an idempotent
//! Evidence Link plus a Claim state transition.
//!
//! Grounded in the same "evaluate a ruleset over one input, get back a
//! decision plus its triggers" shape this workspace already uses for policy
//! evaluation, narrowed from a rule *set* to the two fixed thresholds the
//! spec calls for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use claims_match::MatchOutcome;
use thiserror::Error;
use tokio::sync::RwLock;

pub type ClaimId = String;
pub type DocumentId = String;

pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AutoSubmit,
    SmartPrompt,
    Hold,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AutoSubmit => "auto_submit",
            Action::SmartPrompt => "smart_prompt",
            Action::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    AutoMatch,
    MlSuggested,
    ManualReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Pending,
    Reviewed,
    Disputed,
}

/// Configurable thresholds; defaults match the spec (`AUTO_THRESHOLD`,
/// `PROMPT_THRESHOLD` environment variables, §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub auto: f64,
    pub prompt: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto: 0.85,
            prompt: 0.50,
        }
    }
}

impl Thresholds {
    #[must_use]
    pub fn route(&self, final_confidence: f64) -> Action {
        if final_confidence >= self.auto {
            Action::AutoSubmit
        } else if final_confidence >= self.prompt {
            Action::SmartPrompt
        } else {
            Action::Hold
        }
    }
}

fn link_kind_for(action: Action) -> LinkKind {
    match action {
        Action::AutoSubmit => LinkKind::AutoMatch,
        Action::SmartPrompt => LinkKind::MlSuggested,
        Action::Hold => LinkKind::ManualReview,
    }
}

fn claim_state_for(action: Action) -> ClaimState {
    match action {
        Action::AutoSubmit => ClaimState::Disputed,
        Action::SmartPrompt => ClaimState::Reviewed,
        Action::Hold => ClaimState::Pending,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceLink {
    pub claim_id: ClaimId,
    pub document_id: DocumentId,
    pub link_kind: LinkKind,
    pub updated_at: DateTime<Utc>,
}

/// The routed decision for one Matcher outcome: the action taken, the link
/// it was upserted as, the Claim's new state, and whether a smart-prompt
/// needs creating (the Router decides this; `claims-prompts` owns actually
/// creating it).
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub claim_id: ClaimId,
    pub document_id: DocumentId,
    pub action: Action,
    pub link_kind: LinkKind,
    pub claim_state: ClaimState,
    pub final_confidence: f64,
    pub should_create_prompt: bool,
    pub should_notify: bool,
}

/// Event emitted once per routed match, for telemetry/notification fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterEvent {
    pub claim_id: ClaimId,
    pub document_id: DocumentId,
    pub action: Action,
}

pub trait RouterEventSink: Send + Sync {
    fn record(&self, event: &RouterEvent);
}

#[derive(Default)]
pub struct NoopRouterEventSink;

impl RouterEventSink for NoopRouterEventSink {
    fn record(&self, _event: &RouterEvent) {}
}

/// Upserts Evidence Links keyed `(claim_id, document_id)`. The in-memory
/// implementation is the only one shipped; a durable backend swaps in
/// behind the same trait.
#[async_trait]
pub trait EvidenceLinkStore: Send + Sync {
    async fn upsert(&self, link: EvidenceLink) -> RouterResult<()>;
    async fn get(&self, claim_id: &ClaimId, document_id: &DocumentId) -> Option<EvidenceLink>;
    async fn count(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryEvidenceLinkStore {
    links: RwLock<HashMap<(ClaimId, DocumentId), EvidenceLink>>,
}

impl InMemoryEvidenceLinkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceLinkStore for InMemoryEvidenceLinkStore {
    async fn upsert(&self, link: EvidenceLink) -> RouterResult<()> {
        let mut guard = self.links.write().await;
        guard.insert((link.claim_id.clone(), link.document_id.clone()), link);
        Ok(())
    }

    async fn get(&self, claim_id: &ClaimId, document_id: &DocumentId) -> Option<EvidenceLink> {
        let guard = self.links.read().await;
        guard.get(&(claim_id.clone(), document_id.clone())).cloned()
    }

    async fn count(&self) -> usize {
        self.links.read().await.len()
    }
}

pub struct ConfidenceRouter {
    thresholds: Thresholds,
    store: Arc<dyn EvidenceLinkStore>,
    sink: Arc<dyn RouterEventSink>,
}

impl ConfidenceRouter {
    #[must_use]
    pub fn new(store: Arc<dyn EvidenceLinkStore>) -> Self {
        Self::with_thresholds(Thresholds::default(), store, Arc::new(NoopRouterEventSink))
    }

    #[must_use]
    pub fn with_thresholds(
        thresholds: Thresholds,
        store: Arc<dyn EvidenceLinkStore>,
        sink: Arc<dyn RouterEventSink>,
    ) -> Self {
        Self {
            thresholds,
            store,
            sink,
        }
    }

    /// Routes one Matcher outcome: decides the action, upserts the
    /// resulting link, and returns the full decision. Upserting on
    /// `(claim_id, document_id)` is what makes re-running the matcher
    /// converge instead of duplicating links or prompts.
    pub async fn route(&self, outcome: &MatchOutcome) -> RouterResult<RoutingDecision> {
        let action = self.thresholds.route(outcome.final_confidence);
        let link_kind = link_kind_for(action);
        let claim_state = claim_state_for(action);

        self.store
            .upsert(EvidenceLink {
                claim_id: outcome.claim_id.clone(),
                document_id: outcome.document_id.clone(),
                link_kind,
                updated_at: Utc::now(),
            })
            .await?;

        self.sink.record(&RouterEvent {
            claim_id: outcome.claim_id.clone(),
            document_id: outcome.document_id.clone(),
            action,
        });

        Ok(RoutingDecision {
            claim_id: outcome.claim_id.clone(),
            document_id: outcome.document_id.clone(),
            action,
            link_kind,
            claim_state,
            final_confidence: outcome.final_confidence,
            should_create_prompt: matches!(action, Action::SmartPrompt),
            should_notify: matches!(action, Action::AutoSubmit),
        })
    }

    pub async fn link_count(&self) -> usize {
        self.store.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn outcome(final_confidence: f64) -> MatchOutcome {
        MatchOutcome {
            claim_id: "C1".into(),
            document_id: "D1".into(),
            match_type: "order_id",
            matched_fields: vec!["order_id:X".into()],
            rule_score: 0.95,
            ml_score: None,
            final_confidence,
            reasoning: "test".into(),
        }
    }

    fn router() -> ConfidenceRouter {
        ConfidenceRouter::new(Arc::new(InMemoryEvidenceLinkStore::new()))
    }

    #[tokio::test]
    async fn high_confidence_auto_submits_and_disputes_claim() {
        let router = router();
        let decision = router.route(&outcome(0.90)).await.expect("route");
        assert_eq!(decision.action, Action::AutoSubmit);
        assert_eq!(decision.link_kind, LinkKind::AutoMatch);
        assert_eq!(decision.claim_state, ClaimState::Disputed);
        assert!(!decision.should_create_prompt);
    }

    #[tokio::test]
    async fn mid_confidence_creates_smart_prompt() {
        let router = router();
        let decision = router.route(&outcome(0.68)).await.expect("route");
        assert_eq!(decision.action, Action::SmartPrompt);
        assert_eq!(decision.link_kind, LinkKind::MlSuggested);
        assert_eq!(decision.claim_state, ClaimState::Reviewed);
        assert!(decision.should_create_prompt);
    }

    #[tokio::test]
    async fn low_confidence_holds_for_manual_review() {
        let router = router();
        let decision = router.route(&outcome(0.20)).await.expect("route");
        assert_eq!(decision.action, Action::Hold);
        assert_eq!(decision.link_kind, LinkKind::ManualReview);
        assert_eq!(decision.claim_state, ClaimState::Pending);
    }

    #[tokio::test]
    async fn rerunning_router_is_idempotent_on_claim_and_document() {
        let router = router();
        router.route(&outcome(0.90)).await.expect("first route");
        router.route(&outcome(0.90)).await.expect("second route");
        assert_eq!(router.link_count().await, 1);
    }

    #[tokio::test]
    async fn boundary_values_route_to_the_documented_tier() {
        let router = router();
        assert_eq!(
            router.route(&outcome(0.85)).await.expect("route").action,
            Action::AutoSubmit
        );
        assert_eq!(
            router.route(&outcome(0.50)).await.expect("route").action,
            Action::SmartPrompt
        );
    }
}
