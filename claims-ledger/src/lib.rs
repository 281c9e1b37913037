#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;

use async_trait::async_trait;
use claims_docindex::IdentifierFamily;

mod memory;

pub use memory::InMemoryLedgerStore;

pub type SellerId = String;
pub type RecordId = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportType {
    Orders,
    Shipments,
    Returns,
    Settlements,
    Inventory,
    Fees,
    Reimbursements,
}

impl ReportType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReportType::Orders => "orders",
            ReportType::Shipments => "shipments",
            ReportType::Returns => "returns",
            ReportType::Settlements => "settlements",
            ReportType::Inventory => "inventory",
            ReportType::Fees => "fees",
            ReportType::Reimbursements => "reimbursements",
        }
    }

    /// The seven report types a full sync always tiles over, in a fixed order
    /// so orchestrator plans are deterministic.
    #[must_use]
    pub fn all() -> [ReportType; 7] {
        [
            ReportType::Orders,
            ReportType::Shipments,
            ReportType::Returns,
            ReportType::Settlements,
            ReportType::Inventory,
            ReportType::Fees,
            ReportType::Reimbursements,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentStatus {
    LostInTransit,
    Damaged,
    Delivered,
}

/// Report-type-specific fields a Canonical Record carries. Kept as a
/// discriminated enum rather than a bag of optional fields so a Candidate
/// Generator rule can match on exactly the shape it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordDetail {
    Order {
        total_fees_minor: i64,
    },
    Shipment {
        missing_quantity: u32,
        unit_price_minor: Option<i64>,
        status: ShipmentStatus,
    },
    Return {
        refund_amount_minor: i64,
    },
    Settlement {
        fees_minor: i64,
    },
    Other,
}

/// A canonical ledger entry: one normalized row from a provider report.
/// Uniqueness: `(seller, report_type, external_id)` when `external_id` is
/// present.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub id: RecordId,
    pub seller_id: SellerId,
    pub report_type: ReportType,
    pub detail: RecordDetail,
    pub amount_minor: i64,
    pub currency: String,
    pub record_date: DateTime<Utc>,
    pub sku: Option<String>,
    pub order_id: Option<String>,
    pub description: Option<String>,
    pub source: String,
    pub external_id: Option<String>,
    pub source_checksum: String,
    pub degraded_date: bool,
    pub price_estimated: bool,
    /// Every strong identifier the source row carried (order id, sku,
    /// tracking number, shipment id, ...), keyed by family so the Candidate
    /// Generator can thread all of them into a Claim Candidate rather than
    /// only the handful this ledger also exposes through dedicated fields.
    pub identifiers: HashMap<IdentifierFamily, String>,
    pub sync_window_start: DateTime<Utc>,
    pub sync_window_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub seller_id: SellerId,
    pub report_type: ReportType,
    pub state: SyncState,
    pub records_processed: u64,
    pub records_total: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpsertBatchRequest {
    pub seller_id: SellerId,
    pub report_type: ReportType,
    pub records: Vec<CanonicalRecord>,
}

#[derive(Debug, Clone)]
pub struct UpsertBatchOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub skipped_duplicates: u64,
}

/// Idempotent, per-`(seller, report_type)` Sync Status bookkeeping sits
/// behind the same service trait as the record store: both are mutated
/// together inside one batch upsert, so a caller can never observe a ledger
/// write whose status wasn't advanced alongside it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn upsert_batch(&self, request: UpsertBatchRequest) -> LedgerResult<UpsertBatchOutcome>;

    async fn list_records(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
    ) -> LedgerResult<Vec<CanonicalRecord>>;

    async fn get_sync_status(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
    ) -> LedgerResult<SyncStatus>;

    async fn mark_sync_failed(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
        error: String,
    ) -> LedgerResult<SyncStatus>;
}
