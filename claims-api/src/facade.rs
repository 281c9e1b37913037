//! Pipeline facade: ingest -> normalize (upstream of this crate, inside the
//! Sync Orchestrator) -> ledger -> candidates -> document index -> match ->
//! router -> prompts/audit, composed behind one `Arc<dyn Service>`-per-stage
//! entry point the way `codex-accounting-api`'s `LedgerFacade` composes a
//! single domain service, generalized here to a whole pipeline instead of
//! one service.

use std::collections::HashMap;
use std::sync::Arc;

use claims_audit::AppendRequest;
use claims_audit::AuditLog;
use claims_candidates::CandidateGenerator;
use claims_docindex::DocumentIndex;
use claims_docindex::IndexableDocument;
use claims_docindex::ParserStatus as IndexParserStatus;
use claims_ingest::EvidenceDocument;
use claims_ingest::InMemoryQueue;
use claims_ingest::ParserStatus as IngestParserStatus;
use claims_ledger::LedgerStore;
use claims_ledger::ReportType;
use claims_match::Matcher;
use claims_orchestrator::JobId;
use claims_orchestrator::JobState;
use claims_orchestrator::OrchestratorError;
use claims_orchestrator::SellerId;
use claims_orchestrator::SyncJob;
use claims_orchestrator::SyncOrchestrator;
use claims_parser::ParserClient;
use claims_prompts::PromptStore;
use claims_router::ConfidenceRouter;
use claims_router::RoutingDecision;
use thiserror::Error;

use crate::ClaimsTelemetry;

pub type FacadeResult<T> = Result<T, FacadeError>;

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Ledger(#[from] claims_ledger::LedgerError),
    #[error(transparent)]
    Candidate(#[from] claims_candidates::CandidateError),
    #[error(transparent)]
    Parser(#[from] claims_parser::ParserError),
    #[error(transparent)]
    Router(#[from] claims_router::RouterError),
    #[error(transparent)]
    Audit(#[from] claims_audit::AuditLogError),
}

pub struct ClaimsFacade {
    ledger: Arc<dyn LedgerStore>,
    candidates: Arc<dyn CandidateGenerator>,
    documents: Arc<InMemoryQueue>,
    parser: Arc<dyn ParserClient>,
    matcher: Arc<dyn Matcher>,
    router: ConfidenceRouter,
    prompts: Arc<dyn PromptStore>,
    audit: Arc<dyn AuditLog>,
    orchestrator: Arc<SyncOrchestrator>,
    telemetry: ClaimsTelemetry,
}

impl ClaimsFacade {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        candidates: Arc<dyn CandidateGenerator>,
        documents: Arc<InMemoryQueue>,
        parser: Arc<dyn ParserClient>,
        matcher: Arc<dyn Matcher>,
        router: ConfidenceRouter,
        prompts: Arc<dyn PromptStore>,
        audit: Arc<dyn AuditLog>,
        orchestrator: Arc<SyncOrchestrator>,
        telemetry: ClaimsTelemetry,
    ) -> Self {
        Self {
            ledger,
            candidates,
            documents,
            parser,
            matcher,
            router,
            prompts,
            audit,
            orchestrator,
            telemetry,
        }
    }

    pub async fn start_sync(&self, seller_id: SellerId, priority: u8) -> JobId {
        self.orchestrator.submit(seller_id, priority).await
    }

    /// Runs a previously submitted job to completion, recording the outcome
    /// in telemetry and the audit trail. Intended to be awaited directly by
    /// a worker loop or the CLI harness, not spawned fire-and-forget.
    pub async fn run_sync(&self, job_id: &JobId) -> FacadeResult<JobState> {
        let state = self.orchestrator.run(job_id).await?;
        match state {
            JobState::Completed => self.telemetry.record_sync_completed(),
            JobState::Failed => self.telemetry.record_sync_failed(),
            JobState::Cancelled => self.telemetry.record_sync_cancelled(),
            JobState::Queued | JobState::Running => {}
        }
        self.audit
            .append(AppendRequest {
                entity_id: job_id.clone(),
                actor: "sync-orchestrator".into(),
                action: format!("sync_job_{}", state_label(state)),
                metadata: serde_json::Value::Null,
            })
            .await?;
        Ok(state)
    }

    pub async fn sync_status(&self, job_id: &JobId) -> FacadeResult<SyncJob> {
        Ok(self.orchestrator.status(job_id).await?)
    }

    pub async fn cancel_sync(&self, job_id: &JobId) -> FacadeResult<()> {
        Ok(self.orchestrator.cancel(job_id).await?)
    }

    /// Rebuilds the in-memory Document Index for `seller_id` from every
    /// Evidence Document whose Parser Service job has completed. Called
    /// both at the start of `run_match` and directly by the `reindex
    /// documents` CLI command.
    pub async fn rebuild_document_index(&self, seller_id: &SellerId) -> FacadeResult<DocumentIndex> {
        let all_documents = self.documents.documents().await;
        let mut indexable = Vec::new();
        for document in all_documents.into_iter().filter(|doc| &doc.seller_id == seller_id) {
            if let Some(entry) = self.indexable_document(document).await? {
                indexable.push(entry);
            }
        }
        let count = indexable.len();
        let index = DocumentIndex::build(seller_id.clone(), indexable);
        self.telemetry.record_documents_indexed(count);
        Ok(index)
    }

    async fn indexable_document(&self, document: EvidenceDocument) -> FacadeResult<Option<IndexableDocument>> {
        if document.parser_status != IngestParserStatus::Completed {
            return Ok(None);
        }
        let parsed = match self.parser.get_parsed(&document.document_id, &document.seller_id).await {
            Ok(parsed) => parsed,
            Err(claims_parser::ParserError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(IndexableDocument {
            document_id: document.document_id,
            seller_id: document.seller_id,
            filename: document.filename,
            parser_status: IndexParserStatus::Completed,
            parser_confidence: Some(parsed.confidence),
            extracted: parsed.extracted,
            raw_text: parsed.raw_text,
            ingested_at: document.ingested_at,
        }))
    }

    /// Forces a matching pass for `seller_id`: rebuilds the document index,
    /// regenerates Claim Candidates from every ledger record, matches each
    /// candidate, and routes every match to an action. Re-running this
    /// against unchanged state is idempotent — the router upserts links
    /// keyed `(claim_id, document_id)` and prompts are created-or-fetched,
    /// never duplicated.
    pub async fn run_match(&self, seller_id: &SellerId) -> FacadeResult<Vec<RoutingDecision>> {
        let index = self.rebuild_document_index(seller_id).await?;

        let mut records = Vec::new();
        for report_type in ReportType::all() {
            records.extend(self.ledger.list_records(seller_id, report_type).await?);
        }

        let candidates = self.candidates.generate(&records)?;
        self.telemetry.record_candidates(candidates.len());

        let outcomes = self.matcher.match_batch(&candidates, &index);

        let mut decisions = Vec::new();
        for outcome in &outcomes {
            let decision = self.router.route(outcome).await?;
            if decision.should_create_prompt {
                self.prompts
                    .create_or_get(&decision.claim_id, &decision.document_id)
                    .await;
                self.telemetry.record_prompt_created();
            }
            self.audit
                .append(AppendRequest {
                    entity_id: decision.claim_id.clone(),
                    actor: "confidence-router".into(),
                    action: decision.action.as_str().to_string(),
                    metadata: serde_json::json!({ "document_id": decision.document_id }),
                })
                .await?;
            decisions.push(decision);
        }

        Ok(decisions)
    }
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Running => "running",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
    }
}
