#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Normalizer: converts heterogeneous provider report rows into Canonical
//! Records.
//!
//! Grounded in this workspace's bank-statement ingestion path (`parse_amount`
//! numeric coercion, `compute_checksum` over the raw row bytes, and a
//! dedup-by-composite-key pass) but retargeted from "parse a CSV/OFX file"
//! to "normalize one already-split provider row": the Provider Adapter
//! (out of scope here, §6) is the one that turns a report file into rows;
//! this crate only cleans, validates, and types what it is handed.

use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::TimeZone;
use chrono::Utc;
use claims_docindex::IdentifierFamily;
use claims_ledger::CanonicalRecord;
use claims_ledger::RecordDetail;
use claims_ledger::ReportType;
use claims_ledger::ShipmentStatus;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

pub type SellerId = String;

pub type NormalizeResult<T> = Result<T, NormalizeError>;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid field {field}: {message}")]
    InvalidField { field: String, message: String },
    #[error("row is missing currency and its source is not USD-scoped")]
    MissingCurrency,
}

/// One raw row as handed to the Normalizer by a Provider Adapter: already
/// split into fields, but with arbitrary key casing/whitespace and
/// string-typed values. `raw_bytes` is the row's original byte
/// representation, kept only so the Normalizer can fingerprint it —
/// `source_checksum` lets the Ledger Store detect a byte-identical
/// resubmission even when `external_id` is absent or unstable.
#[derive(Debug, Clone)]
pub struct RawReportRow {
    pub seller_id: SellerId,
    pub report_type: ReportType,
    pub source: String,
    pub external_id: Option<String>,
    /// Set by the Provider Adapter when an entire report type is known to
    /// always be denominated in USD for this source (e.g. a seller's
    /// US-marketplace orders report). The Normalizer never guesses this.
    pub currency_scoped_usd: bool,
    pub fields: HashMap<String, String>,
    pub raw_bytes: Vec<u8>,
}

fn clean_fields(fields: HashMap<String, String>) -> HashMap<String, String> {
    fields
        .into_iter()
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

/// Rejects non-numeric input with `InvalidField`; returns minor units
/// (`amount * 100`, rounded to the nearest cent).
fn parse_decimal(field: &str, value: &str) -> NormalizeResult<i64> {
    let cleaned = value.replace(',', "");
    if cleaned.is_empty() {
        return Ok(0);
    }
    let negative = cleaned.starts_with('-');
    let unsigned = cleaned.strip_prefix('-').unwrap_or(&cleaned);
    let mut parts = unsigned.splitn(2, '.');
    let integer_part = parts.next().unwrap_or("0");
    let fraction_part = parts.next().unwrap_or("");

    if integer_part.is_empty() && fraction_part.is_empty()
        || !integer_part.chars().all(|ch| ch.is_ascii_digit())
        || !fraction_part.chars().all(|ch| ch.is_ascii_digit())
    {
        return Err(NormalizeError::InvalidField {
            field: field.to_string(),
            message: format!("{value} is not numeric"),
        });
    }

    let integer: i64 = if integer_part.is_empty() {
        0
    } else {
        integer_part.parse().map_err(|_| NormalizeError::InvalidField {
            field: field.to_string(),
            message: format!("{value} overflows a 64-bit amount"),
        })?
    };
    let mut minor = integer
        .checked_mul(100)
        .ok_or_else(|| NormalizeError::InvalidField {
            field: field.to_string(),
            message: "amount overflow".into(),
        })?;

    if !fraction_part.is_empty() {
        let truncated: String = fraction_part.chars().take(2).collect();
        let scale = 10_i64.pow(2 - truncated.len() as u32);
        let fraction_value: i64 = truncated.parse().unwrap_or(0);
        minor = minor.saturating_add(fraction_value * scale);
    }

    Ok(if negative { -minor } else { minor })
}

fn parse_quantity(field: &str, value: &str) -> NormalizeResult<u32> {
    if value.is_empty() {
        return Ok(0);
    }
    value.parse::<u32>().map_err(|_| NormalizeError::InvalidField {
        field: field.to_string(),
        message: format!("{value} is not a non-negative integer"),
    })
}

/// Dates are normalized to UTC. An absent or unparseable date never fails
/// the row outright; it degrades to "record_date = ingestion time" with
/// `degraded_date = true` so downstream consumers can discount it, the same
/// forgiving-but-flagged treatment the spec gives a missing unit price.
fn parse_record_date(value: Option<&String>, now: DateTime<Utc>) -> (DateTime<Utc>, bool) {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return (now, true);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return (parsed.with_timezone(&Utc), false);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return (Utc.from_utc_datetime(&midnight), false);
        }
    }
    (now, true)
}

fn resolve_currency(row: &RawReportRow) -> NormalizeResult<String> {
    match row.fields.get("currency").filter(|v| !v.is_empty()) {
        Some(code) => Ok(code.to_ascii_uppercase()),
        None if row.currency_scoped_usd => Ok("USD".to_string()),
        None => Err(NormalizeError::MissingCurrency),
    }
}

fn shipment_status(value: Option<&String>) -> ShipmentStatus {
    match value.map(String::as_str) {
        Some("lost_in_transit") | Some("lost") => ShipmentStatus::LostInTransit,
        Some("damaged") => ShipmentStatus::Damaged,
        _ => ShipmentStatus::Delivered,
    }
}

fn detail_for(row: &RawReportRow) -> NormalizeResult<(RecordDetail, i64)> {
    match row.report_type {
        ReportType::Orders => {
            let total_fees_minor = match row.fields.get("total_fees") {
                Some(value) => parse_decimal("total_fees", value)?,
                None => 0,
            };
            let amount = match row.fields.get("amount") {
                Some(value) => parse_decimal("amount", value)?,
                None => total_fees_minor,
            };
            Ok((RecordDetail::Order { total_fees_minor }, amount))
        }
        ReportType::Shipments => {
            let missing_quantity = match row.fields.get("missing_quantity") {
                Some(value) => parse_quantity("missing_quantity", value)?,
                None => 0,
            };
            let unit_price_minor = row
                .fields
                .get("unit_price")
                .map(|value| parse_decimal("unit_price", value))
                .transpose()?;
            let status = shipment_status(row.fields.get("status"));
            let amount = match row.fields.get("amount") {
                Some(value) => parse_decimal("amount", value)?,
                None => i64::from(missing_quantity) * unit_price_minor.unwrap_or(0),
            };
            Ok((
                RecordDetail::Shipment {
                    missing_quantity,
                    unit_price_minor,
                    status,
                },
                amount,
            ))
        }
        ReportType::Returns => {
            let refund_amount_minor = match row.fields.get("refund_amount") {
                Some(value) => parse_decimal("refund_amount", value)?,
                None => 0,
            };
            let amount = match row.fields.get("amount") {
                Some(value) => parse_decimal("amount", value)?,
                None => refund_amount_minor,
            };
            Ok((RecordDetail::Return { refund_amount_minor }, amount))
        }
        ReportType::Settlements => {
            let fees_minor = match row.fields.get("fees") {
                Some(value) => parse_decimal("fees", value)?,
                None => 0,
            };
            let amount = match row.fields.get("amount") {
                Some(value) => parse_decimal("amount", value)?,
                None => fees_minor,
            };
            Ok((RecordDetail::Settlement { fees_minor }, amount))
        }
        ReportType::Inventory | ReportType::Fees | ReportType::Reimbursements => {
            let amount = match row.fields.get("amount") {
                Some(value) => parse_decimal("amount", value)?,
                None => 0,
            };
            Ok((RecordDetail::Other, amount))
        }
    }
}

fn record_id(seller_id: &str, report_type: ReportType, row: &RawReportRow, checksum: &str) -> String {
    match &row.external_id {
        Some(external_id) => format!("{seller_id}:{}:{external_id}", report_type.as_str()),
        None => format!("{seller_id}:{}:{checksum}", report_type.as_str()),
    }
}

fn compute_checksum(raw_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_bytes);
    format!("{:x}", hasher.finalize())
}

/// Field names (already lowercased by `clean_fields`) mapped to the
/// identifier family they carry. A row can legitimately carry more than
/// one — a return row routinely has both an `order_id` and an `rma_number`.
const IDENTIFIER_FIELDS: &[(&str, IdentifierFamily)] = &[
    ("order_id", IdentifierFamily::OrderId),
    ("sku", IdentifierFamily::Sku),
    ("asin", IdentifierFamily::Asin),
    ("fnsku", IdentifierFamily::Fnsku),
    ("upc", IdentifierFamily::Upc),
    ("transaction_id", IdentifierFamily::TransactionId),
    ("reimbursement_id", IdentifierFamily::ReimbursementId),
    ("case_id", IdentifierFamily::CaseId),
    ("tracking_number", IdentifierFamily::TrackingNumber),
    ("shipment_id", IdentifierFamily::ShipmentId),
    ("removal_order_id", IdentifierFamily::RemovalOrderId),
    ("amazon_reference_id", IdentifierFamily::AmazonReferenceId),
    ("rma_number", IdentifierFamily::RmaNumber),
    ("lpn", IdentifierFamily::Lpn),
    ("bol_number", IdentifierFamily::BolNumber),
    ("invoice_number", IdentifierFamily::InvoiceNumber),
    ("po_number", IdentifierFamily::PoNumber),
];

/// Carries every identifier the row names into the Canonical Record, so the
/// Candidate Generator and Matcher can key on any of them, not only the
/// handful this ledger also exposes through dedicated fields
/// (`sku`/`order_id`). Falls back to filing `external_id` as a
/// `TransactionId` when the row names no explicit transaction id of its own.
fn derive_identifiers(row: &RawReportRow) -> HashMap<IdentifierFamily, String> {
    let mut identifiers = HashMap::new();
    for (field, family) in IDENTIFIER_FIELDS {
        if let Some(value) = row.fields.get(*field).filter(|v| !v.is_empty()) {
            identifiers.insert(*family, value.clone());
        }
    }
    if !identifiers.contains_key(&IdentifierFamily::TransactionId)
        && let Some(external_id) = &row.external_id
    {
        identifiers.insert(IdentifierFamily::TransactionId, external_id.clone());
    }
    identifiers
}

/// Normalizes one row, given the current ledger window's known external ids
/// so the caller can drop exact resubmissions before they reach the Ledger
/// Store. Returns `Ok(None)` for a dropped duplicate, never an error.
pub fn normalize_row(
    row: RawReportRow,
    existing_external_ids: &HashSet<String>,
    window: (DateTime<Utc>, DateTime<Utc>),
    now: DateTime<Utc>,
) -> NormalizeResult<Option<CanonicalRecord>> {
    if let Some(external_id) = &row.external_id
        && existing_external_ids.contains(external_id)
    {
        return Ok(None);
    }

    let fields = clean_fields(row.fields.clone());
    let row = RawReportRow { fields, ..row };

    let currency = resolve_currency(&row)?;
    let (record_date, degraded_date) = parse_record_date(row.fields.get("record_date"), now);
    let (detail, amount_minor) = detail_for(&row)?;
    let checksum = compute_checksum(&row.raw_bytes);
    let id = record_id(&row.seller_id, row.report_type, &row, &checksum);
    let identifiers = derive_identifiers(&row);

    Ok(Some(CanonicalRecord {
        id,
        seller_id: row.seller_id,
        report_type: row.report_type,
        detail,
        amount_minor,
        currency,
        record_date,
        sku: row.fields.get("sku").cloned(),
        order_id: row.fields.get("order_id").cloned(),
        description: row.fields.get("description").cloned(),
        source: row.source,
        external_id: row.external_id,
        source_checksum: checksum,
        degraded_date,
        price_estimated: false,
        identifiers,
        sync_window_start: window.0,
        sync_window_end: window.1,
        created_at: now,
        updated_at: now,
    }))
}

/// Normalizes a whole batch, dropping rows already present in the ledger
/// window and stable-ordering the survivors by `(record_date, external_id)`
/// so downstream matching sees a deterministic sequence regardless of the
/// order the Provider Adapter handed rows over in.
pub fn normalize_batch(
    rows: Vec<RawReportRow>,
    existing_external_ids: &HashSet<String>,
    window: (DateTime<Utc>, DateTime<Utc>),
    now: DateTime<Utc>,
) -> NormalizeResult<Vec<CanonicalRecord>> {
    let mut records = Vec::new();
    for row in rows {
        if let Some(record) = normalize_row(row, existing_external_ids, window, now)? {
            records.push(record);
        }
    }
    records.sort_by(|left, right| {
        left.record_date
            .cmp(&right.record_date)
            .then_with(|| left.external_id.cmp(&right.external_id))
    });
    Ok(records)
}
