#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Matcher: for each Claim Candidate, finds the best Evidence Document in a
//! seller's Document Index.
//!
//! Priority is a fixed 17-tier list; the first family with a non-empty hit
//! wins. Ties within the winning family break on parser confidence, then
//! recency, then lexicographic `document_id` — entirely deterministic, so
//! the same candidate against the same index snapshot always yields the
//! same winner regardless of which process runs it.

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use claims_candidates::ClaimCandidate;
use claims_docindex::DocumentIndex;
use claims_docindex::IdentifierFamily;
use claims_docindex::IndexableDocument;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub type ClaimId = String;
pub type DocumentId = String;

pub type MatchResult<T> = Result<T, MatchError>;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// The 17 match families in priority order, each carrying its baseline
/// confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    OrderId,
    TransactionId,
    ReimbursementId,
    CaseId,
    TrackingNumber,
    ShipmentId,
    RemovalOrderId,
    AmazonReferenceId,
    RmaNumber,
    Lpn,
    Fnsku,
    Asin,
    Sku,
    Upc,
    BolNumber,
    InvoiceNumber,
    PoNumber,
}

/// Priority list, highest-ranked first, paired with the identifier family
/// it reads from the Document Index and its baseline confidence.
const RANKED: [(MatchType, IdentifierFamily, f64); 17] = [
    (MatchType::OrderId, IdentifierFamily::OrderId, 0.95),
    (MatchType::TransactionId, IdentifierFamily::TransactionId, 0.92),
    (
        MatchType::ReimbursementId,
        IdentifierFamily::ReimbursementId,
        0.92,
    ),
    (MatchType::CaseId, IdentifierFamily::CaseId, 0.90),
    (
        MatchType::TrackingNumber,
        IdentifierFamily::TrackingNumber,
        0.90,
    ),
    (MatchType::ShipmentId, IdentifierFamily::ShipmentId, 0.90),
    (
        MatchType::RemovalOrderId,
        IdentifierFamily::RemovalOrderId,
        0.90,
    ),
    (
        MatchType::AmazonReferenceId,
        IdentifierFamily::AmazonReferenceId,
        0.88,
    ),
    (MatchType::RmaNumber, IdentifierFamily::RmaNumber, 0.88),
    (MatchType::Lpn, IdentifierFamily::Lpn, 0.85),
    (MatchType::Fnsku, IdentifierFamily::Fnsku, 0.85),
    (MatchType::Asin, IdentifierFamily::Asin, 0.85),
    (MatchType::Sku, IdentifierFamily::Sku, 0.85),
    (MatchType::Upc, IdentifierFamily::Upc, 0.85),
    (MatchType::BolNumber, IdentifierFamily::BolNumber, 0.82),
    (
        MatchType::InvoiceNumber,
        IdentifierFamily::InvoiceNumber,
        0.80,
    ),
    (MatchType::PoNumber, IdentifierFamily::PoNumber, 0.80),
];

impl MatchType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::OrderId => "order_id",
            MatchType::TransactionId => "transaction_id",
            MatchType::ReimbursementId => "reimbursement_id",
            MatchType::CaseId => "case_id",
            MatchType::TrackingNumber => "tracking_number",
            MatchType::ShipmentId => "shipment_id",
            MatchType::RemovalOrderId => "removal_order_id",
            MatchType::AmazonReferenceId => "amazon_reference_id",
            MatchType::RmaNumber => "rma_number",
            MatchType::Lpn => "lpn",
            MatchType::Fnsku => "fnsku",
            MatchType::Asin => "asin",
            MatchType::Sku => "sku",
            MatchType::Upc => "upc",
            MatchType::BolNumber => "bol_number",
            MatchType::InvoiceNumber => "invoice_number",
            MatchType::PoNumber => "po_number",
        }
    }
}

/// The outcome of matching one Claim Candidate against a Document Index.
/// `action` is deliberately absent: routing a confidence into
/// auto-submit/smart-prompt/hold is the Confidence Router's job, not the
/// Matcher's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub claim_id: ClaimId,
    pub document_id: DocumentId,
    pub match_type: &'static str,
    pub matched_fields: Vec<String>,
    pub rule_score: f64,
    pub ml_score: Option<f64>,
    pub final_confidence: f64,
    pub reasoning: String,
}

fn clip_parser_confidence(parser_confidence: Option<f64>) -> f64 {
    match parser_confidence {
        Some(value) => value.clamp(0.5, 1.0),
        None => 1.0,
    }
}

/// Picks the winning document among every document tied on the same
/// identifier value: highest `parser_confidence`, then most recently
/// ingested, then lexicographically smallest `document_id`.
fn break_tie<'a>(candidates: &[&'a IndexableDocument]) -> &'a IndexableDocument {
    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if is_better(candidate, best) {
            best = candidate;
        }
    }
    best
}

fn is_better(candidate: &IndexableDocument, current_best: &IndexableDocument) -> bool {
    let candidate_confidence = candidate.parser_confidence.unwrap_or(0.0);
    let best_confidence = current_best.parser_confidence.unwrap_or(0.0);
    if candidate_confidence != best_confidence {
        return candidate_confidence > best_confidence;
    }
    if candidate.ingested_at != current_best.ingested_at {
        return candidate.ingested_at > current_best.ingested_at;
    }
    candidate.document_id < current_best.document_id
}

fn reasoning_for(document: &IndexableDocument, match_type: MatchType, value: &str) -> String {
    format!(
        "matched {} \"{value}\" against document \"{filename}\"",
        match_type.as_str(),
        filename = document.filename,
    )
}

pub trait Matcher: Send + Sync {
    fn match_candidate(
        &self,
        candidate: &ClaimCandidate,
        index: &DocumentIndex,
    ) -> Option<MatchOutcome>;

    /// Matches a batch (spec contract: batches of 1,000 candidates,
    /// pure-CPU, no cross-batch state) against one shared, read-only index.
    fn match_batch(
        &self,
        candidates: &[ClaimCandidate],
        index: &DocumentIndex,
    ) -> Vec<MatchOutcome> {
        candidates
            .iter()
            .filter_map(|candidate| self.match_candidate(candidate, index))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct PriorityMatcher;

impl PriorityMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Matcher for PriorityMatcher {
    fn match_candidate(
        &self,
        candidate: &ClaimCandidate,
        index: &DocumentIndex,
    ) -> Option<MatchOutcome> {
        for (match_type, family, baseline) in RANKED {
            let Some(value) = candidate.identifiers.get(&family) else {
                continue;
            };
            let hits = index.lookup(family, value);
            if hits.is_empty() {
                continue;
            }
            let winner = break_tie(&hits);
            let factor = clip_parser_confidence(winner.parser_confidence);
            let final_confidence = baseline * factor;
            return Some(MatchOutcome {
                claim_id: candidate.claim_id.clone(),
                document_id: winner.document_id.clone(),
                match_type: match_type.as_str(),
                matched_fields: vec![format!("{}:{value}", match_type.as_str())],
                rule_score: baseline,
                ml_score: None,
                final_confidence,
                reasoning: reasoning_for(winner, match_type, value),
            });
        }
        None
    }
}

/// Timestamp helper kept for callers that want to stamp a Match Result at
/// persistence time; the matcher itself never stores a timestamp.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
