#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Candidate Generator: turns Canonical Records into typed Claim
//! Candidates, one deterministic rule pass per sync completion.
//!
//! The four rules run in a fixed order and a record produces at most one
//! candidate per rule. Candidate identity is derived, never random
//! (`claim_id = seller:rule:source_record_id`), so re-running generation
//! over an unchanged ledger window converges on the same candidate set
//! instead of minting duplicates.

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use claims_docindex::IdentifierFamily;
use claims_ledger::CanonicalRecord;
use claims_ledger::RecordDetail;
use claims_ledger::ShipmentStatus;
use thiserror::Error;

pub type SellerId = String;
pub type ClaimId = String;

pub type CandidateResult<T> = Result<T, CandidateError>;

#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    FeeError,
    InventoryLoss,
    ReturnDiscrepancy,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::FeeError => "fee_error",
            Category::InventoryLoss => "inventory_loss",
            Category::ReturnDiscrepancy => "return_discrepancy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subcategory {
    OrderFee,
    SettlementFee,
    LostShipment,
    DamagedGoods,
    RefundMismatch,
}

impl Subcategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Subcategory::OrderFee => "order_fee",
            Subcategory::SettlementFee => "settlement_fee",
            Subcategory::LostShipment => "lost_shipment",
            Subcategory::DamagedGoods => "damaged_goods",
            Subcategory::RefundMismatch => "refund_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    PotentialFeeOvercharge,
    PotentialInventoryLoss,
    PotentialRefundDiscrepancy,
}

impl ReasonCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::PotentialFeeOvercharge => "POTENTIAL_FEE_OVERCHARGE",
            ReasonCode::PotentialInventoryLoss => "POTENTIAL_INVENTORY_LOSS",
            ReasonCode::PotentialRefundDiscrepancy => "POTENTIAL_REFUND_DISCREPANCY",
        }
    }
}

/// Default unit price (minor units, i.e. $10.00) substituted when a
/// shipment row is missing one. Flagged via `price_estimated` on the
/// resulting candidate so downstream consumers can discount it; whether to
/// discount further is left to product, per the open question this default
/// carries forward from the ledger.
pub const ESTIMATED_UNIT_PRICE_MINOR: i64 = 1_000;

const CLAIM_DEADLINE_DAYS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimCandidate {
    pub claim_id: ClaimId,
    pub seller_id: SellerId,
    pub category: Category,
    pub subcategory: Subcategory,
    pub reason_code: ReasonCode,
    pub identifiers: HashMap<IdentifierFamily, String>,
    pub amount_minor: i64,
    pub currency: String,
    pub discovery_date: DateTime<Utc>,
    pub deadline_date: DateTime<Utc>,
    pub price_estimated: bool,
    pub source_record_id: String,
}

impl ClaimCandidate {
    /// `days_remaining = max(0, deadline_date - now)`, evaluated at read
    /// time rather than stored, so it stays correct regardless of when the
    /// candidate is inspected.
    #[must_use]
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.deadline_date - now).num_days().max(0)
    }
}

fn claim_id(seller_id: &str, rule: &str, source_record_id: &str) -> ClaimId {
    format!("{seller_id}:{rule}:{source_record_id}")
}

/// Carries every identifier the source row named, per spec: the Normalizer
/// already derived the full family map onto the record, so this just starts
/// from that and fills in `order_id`/`sku` for a record that predates (or
/// bypassed) the Normalizer's own derivation.
fn carry_identifiers(record: &CanonicalRecord) -> HashMap<IdentifierFamily, String> {
    let mut identifiers = record.identifiers.clone();
    if let Some(order_id) = &record.order_id {
        identifiers.entry(IdentifierFamily::OrderId).or_insert_with(|| order_id.clone());
    }
    if let Some(sku) = &record.sku {
        identifiers.entry(IdentifierFamily::Sku).or_insert_with(|| sku.clone());
    }
    if let Some(external_id) = &record.external_id {
        identifiers
            .entry(IdentifierFamily::TransactionId)
            .or_insert_with(|| external_id.clone());
    }
    identifiers
}

fn base_candidate(
    record: &CanonicalRecord,
    rule: &str,
    category: Category,
    subcategory: Subcategory,
    reason_code: ReasonCode,
    amount_minor: i64,
    price_estimated: bool,
) -> ClaimCandidate {
    let discovery_date = record.record_date;
    ClaimCandidate {
        claim_id: claim_id(&record.seller_id, rule, &record.id),
        seller_id: record.seller_id.clone(),
        category,
        subcategory,
        reason_code,
        identifiers: carry_identifiers(record),
        amount_minor,
        currency: record.currency.clone(),
        discovery_date,
        deadline_date: discovery_date + Duration::days(CLAIM_DEADLINE_DAYS),
        price_estimated,
        source_record_id: record.id.clone(),
    }
}

/// Rule 1: a positive `total_fees` on an order row.
fn fee_anomaly(record: &CanonicalRecord) -> Option<ClaimCandidate> {
    let RecordDetail::Order { total_fees_minor } = record.detail else {
        return None;
    };
    if total_fees_minor <= 0 {
        return None;
    }
    Some(base_candidate(
        record,
        "fee_anomaly",
        Category::FeeError,
        Subcategory::OrderFee,
        ReasonCode::PotentialFeeOvercharge,
        total_fees_minor,
        false,
    ))
}

/// Rule 2: a positive `missing_quantity` on a shipment row.
fn inventory_loss(record: &CanonicalRecord) -> Option<ClaimCandidate> {
    let RecordDetail::Shipment {
        missing_quantity,
        unit_price_minor,
        status,
    } = record.detail
    else {
        return None;
    };
    if missing_quantity == 0 {
        return None;
    }
    let price_estimated = unit_price_minor.is_none();
    let unit_price = unit_price_minor.unwrap_or(ESTIMATED_UNIT_PRICE_MINOR);
    let amount_minor = i64::from(missing_quantity) * unit_price;
    let subcategory = match status {
        ShipmentStatus::LostInTransit => Subcategory::LostShipment,
        ShipmentStatus::Damaged => Subcategory::DamagedGoods,
        ShipmentStatus::Delivered => return None,
    };
    Some(base_candidate(
        record,
        "inventory_loss",
        Category::InventoryLoss,
        subcategory,
        ReasonCode::PotentialInventoryLoss,
        amount_minor,
        price_estimated,
    ))
}

/// Rule 3: a positive `refund_amount` on a return row.
fn return_discrepancy(record: &CanonicalRecord) -> Option<ClaimCandidate> {
    let RecordDetail::Return { refund_amount_minor } = record.detail else {
        return None;
    };
    if refund_amount_minor <= 0 {
        return None;
    }
    Some(base_candidate(
        record,
        "return_discrepancy",
        Category::ReturnDiscrepancy,
        Subcategory::RefundMismatch,
        ReasonCode::PotentialRefundDiscrepancy,
        refund_amount_minor,
        false,
    ))
}

/// Rule 4: a positive `fees` on a settlement row.
fn settlement_fee_anomaly(record: &CanonicalRecord) -> Option<ClaimCandidate> {
    let RecordDetail::Settlement { fees_minor } = record.detail else {
        return None;
    };
    if fees_minor <= 0 {
        return None;
    }
    Some(base_candidate(
        record,
        "settlement_fee_anomaly",
        Category::FeeError,
        Subcategory::SettlementFee,
        ReasonCode::PotentialFeeOvercharge,
        fees_minor,
        false,
    ))
}

/// Applies the four rules, in spec order, to one record. A record produces
/// at most one candidate per rule, but since each rule only matches its own
/// `RecordDetail` variant, a single record only ever matches one rule in
/// practice.
fn candidates_for_record(record: &CanonicalRecord) -> Vec<ClaimCandidate> {
    [
        fee_anomaly(record),
        inventory_loss(record),
        return_discrepancy(record),
        settlement_fee_anomaly(record),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub trait CandidateGenerator: Send + Sync {
    fn generate(&self, records: &[CanonicalRecord]) -> CandidateResult<Vec<ClaimCandidate>>;
}

#[derive(Debug, Default)]
pub struct RuleBasedCandidateGenerator;

impl RuleBasedCandidateGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl CandidateGenerator for RuleBasedCandidateGenerator {
    fn generate(&self, records: &[CanonicalRecord]) -> CandidateResult<Vec<ClaimCandidate>> {
        let mut candidates = Vec::new();
        for record in records {
            candidates.extend(candidates_for_record(record));
        }
        Ok(candidates)
    }
}
