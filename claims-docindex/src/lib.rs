#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Document Index: the Matcher's read-only lookup table.
//!
//! Built once per matching run from every Evidence Document a seller owns,
//! this indexes documents by each of the 17 identifier families the Matcher
//! can key on. Construction is single-owner (`DocumentIndex::build`); once
//! built, the index is immutable and freely shared (`Arc`) read-only across
//! matcher batches, mirroring the "document index is shared read-only"
//! concurrency rule for a matching run.

use std::collections::HashMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;
use regex_lite::Regex;

pub type SellerId = String;
pub type DocumentId = String;

/// The 17 strong-identifier families the Matcher keys on, in the Matcher's
/// priority order (rank 1 first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentifierFamily {
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

impl IdentifierFamily {
    /// All 17 families, in Matcher priority order.
    #[must_use]
    pub fn all() -> [IdentifierFamily; 17] {
        [
            IdentifierFamily::OrderId,
            IdentifierFamily::TransactionId,
            IdentifierFamily::ReimbursementId,
            IdentifierFamily::CaseId,
            IdentifierFamily::TrackingNumber,
            IdentifierFamily::ShipmentId,
            IdentifierFamily::RemovalOrderId,
            IdentifierFamily::AmazonReferenceId,
            IdentifierFamily::RmaNumber,
            IdentifierFamily::Lpn,
            IdentifierFamily::Fnsku,
            IdentifierFamily::Asin,
            IdentifierFamily::Sku,
            IdentifierFamily::Upc,
            IdentifierFamily::BolNumber,
            IdentifierFamily::InvoiceNumber,
            IdentifierFamily::PoNumber,
        ]
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierFamily::OrderId => "order_id",
            IdentifierFamily::TransactionId => "transaction_id",
            IdentifierFamily::ReimbursementId => "reimbursement_id",
            IdentifierFamily::CaseId => "case_id",
            IdentifierFamily::TrackingNumber => "tracking_number",
            IdentifierFamily::ShipmentId => "shipment_id",
            IdentifierFamily::RemovalOrderId => "removal_order_id",
            IdentifierFamily::AmazonReferenceId => "amazon_reference_id",
            IdentifierFamily::RmaNumber => "rma_number",
            IdentifierFamily::Lpn => "lpn",
            IdentifierFamily::Fnsku => "fnsku",
            IdentifierFamily::Asin => "asin",
            IdentifierFamily::Sku => "sku",
            IdentifierFamily::Upc => "upc",
            IdentifierFamily::BolNumber => "bol_number",
            IdentifierFamily::InvoiceNumber => "invoice_number",
            IdentifierFamily::PoNumber => "po_number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// An Evidence Document as seen by the index builder. `extracted` already
/// has plural/singular structured fields folded together by the parser
/// (`order_ids`/`order_id` both land under `IdentifierFamily::OrderId`);
/// this crate never re-derives that merge, only raw-text regex salvage.
#[derive(Debug, Clone)]
pub struct IndexableDocument {
    pub document_id: DocumentId,
    pub seller_id: SellerId,
    pub filename: String,
    pub parser_status: ParserStatus,
    pub parser_confidence: Option<f64>,
    pub extracted: HashMap<IdentifierFamily, Vec<String>>,
    pub raw_text: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// Identifiers whose format is specific enough to salvage from `raw_text`
/// when structured extraction is absent or incomplete.
///
/// Per the spec's open question, `case_id` and `reimbursement_id` are loose
/// numeric patterns in the original provider docs; this crate does not
/// attempt raw-text salvage for either until those patterns are tightened
/// against real provider formats, so only the five families below get a
/// regex.
fn raw_text_patterns() -> &'static [(IdentifierFamily, &'static str)] {
    &[
        (IdentifierFamily::OrderId, r"\d{3}-\d{7}-\d{7}"),
        (
            IdentifierFamily::TrackingNumber,
            r"1Z[A-Z0-9]{16}|\d{20,22}|[A-Z]{2}\d{9}[A-Z]{2}",
        ),
        (IdentifierFamily::ShipmentId, r"FBA[A-Z0-9]{6,12}"),
        (IdentifierFamily::Fnsku, r"X[0-9A-Z]{9}"),
        (IdentifierFamily::Lpn, r"LPN[A-Z0-9]{6,12}"),
    ]
}

fn normalize_value(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Pulls every family's values out of one document: structured fields
/// first, then raw-text regex salvage for the five specific-format
/// families, normalized to upper-case and de-duplicated per document.
fn extract_document_values(
    document: &IndexableDocument,
    patterns: &[(IdentifierFamily, Regex)],
) -> HashMap<IdentifierFamily, HashSet<String>> {
    let mut values: HashMap<IdentifierFamily, HashSet<String>> = HashMap::new();

    for (family, raw_values) in &document.extracted {
        let entry = values.entry(*family).or_default();
        for value in raw_values {
            let normalized = normalize_value(value);
            if !normalized.is_empty() {
                entry.insert(normalized);
            }
        }
    }

    extract_raw_text_values(document, patterns, &mut values);

    values
}

/// Raw-text regex salvage only, with no structured-field extraction. Used
/// for documents the parser hasn't finished with yet: their `extracted` map
/// isn't trustworthy, but a strong-format identifier sitting in whatever
/// `raw_text` was already OCR'd is still worth indexing.
fn extract_raw_text_values(
    document: &IndexableDocument,
    patterns: &[(IdentifierFamily, Regex)],
    values: &mut HashMap<IdentifierFamily, HashSet<String>>,
) {
    let Some(raw_text) = document.raw_text.as_deref() else {
        return;
    };
    for (family, regex) in patterns {
        for found in regex.find_iter(raw_text) {
            let normalized = normalize_value(found.as_str());
            if !normalized.is_empty() {
                values.entry(*family).or_default().insert(normalized);
            }
        }
    }
}

/// Per-seller multi-key inverted index: `identifier_value -> [document_id]`
/// for each of the 17 families. Construction is the single builder; once
/// returned, every field is read-only.
#[derive(Debug, Default, Clone)]
pub struct DocumentIndex {
    seller_id: SellerId,
    maps: HashMap<IdentifierFamily, HashMap<String, Vec<DocumentId>>>,
    documents: HashMap<DocumentId, IndexableDocument>,
}

impl DocumentIndex {
    /// Builds the index for one seller. A `Completed` document contributes
    /// both its structured `extracted` fields and raw-text salvage; a
    /// document still pending/processing/failed contributes only
    /// raw-text-salvaged identifiers when it carries `raw_text` at all —
    /// its structured fields aren't trusted until parsing finishes.
    #[must_use]
    pub fn build(seller_id: impl Into<SellerId>, documents: Vec<IndexableDocument>) -> Self {
        let seller_id = seller_id.into();
        let compiled: Vec<(IdentifierFamily, Regex)> = raw_text_patterns()
            .iter()
            .map(|(family, pattern)| {
                (
                    *family,
                    Regex::new(pattern).unwrap(),
                )
            })
            .collect();

        let mut maps: HashMap<IdentifierFamily, HashMap<String, Vec<DocumentId>>> =
            IdentifierFamily::all()
                .into_iter()
                .map(|family| (family, HashMap::new()))
                .collect();
        let mut stored = HashMap::new();

        for document in documents {
            let completed = document.parser_status == ParserStatus::Completed;
            if document.seller_id != seller_id || (!completed && document.raw_text.is_none()) {
                continue;
            }
            let per_family = if completed {
                extract_document_values(&document, &compiled)
            } else {
                let mut salvaged = HashMap::new();
                extract_raw_text_values(&document, &compiled, &mut salvaged);
                salvaged
            };
            for (family, values) in per_family {
                let map = maps.entry(family).or_default();
                for value in values {
                    map.entry(value).or_default().push(document.document_id.clone());
                }
            }
            stored.insert(document.document_id.clone(), document);
        }

        Self {
            seller_id,
            maps,
            documents: stored,
        }
    }

    #[must_use]
    pub fn seller_id(&self) -> &str {
        &self.seller_id
    }

    /// Documents carrying `value` under `family`, in insertion order.
    #[must_use]
    pub fn lookup(&self, family: IdentifierFamily, value: &str) -> Vec<&IndexableDocument> {
        let normalized = normalize_value(value);
        self.maps
            .get(&family)
            .and_then(|map| map.get(&normalized))
            .into_iter()
            .flatten()
            .filter_map(|document_id| self.documents.get(document_id))
            .collect()
    }

    #[must_use]
    pub fn document(&self, document_id: &str) -> Option<&IndexableDocument> {
        self.documents.get(document_id)
    }

    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn document(id: &str, extracted: Vec<(IdentifierFamily, &str)>, raw_text: Option<&str>) -> IndexableDocument {
        let mut fields: HashMap<IdentifierFamily, Vec<String>> = HashMap::new();
        for (family, value) in extracted {
            fields.entry(family).or_default().push(value.to_string());
        }
        IndexableDocument {
            document_id: id.to_string(),
            seller_id: "seller-1".into(),
            filename: format!("{id}.pdf"),
            parser_status: ParserStatus::Completed,
            parser_confidence: Some(0.9),
            extracted: fields,
            raw_text: raw_text.map(ToString::to_string),
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn structured_fields_are_normalized_and_indexed() {
        let index = DocumentIndex::build(
            "seller-1",
            vec![document(
                "doc-1",
                vec![(IdentifierFamily::Sku, "  test-sku-001 ")],
                None,
            )],
        );
        let hits = index.lookup(IdentifierFamily::Sku, "TEST-SKU-001");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "doc-1");
    }

    #[test]
    fn raw_text_salvage_extracts_order_id() {
        let index = DocumentIndex::build(
            "seller-1",
            vec![document(
                "doc-2",
                vec![],
                Some("Reference order 111-2222222-3333333 was refunded"),
            )],
        );
        let hits = index.lookup(IdentifierFamily::OrderId, "111-2222222-3333333");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn incomplete_documents_never_contribute_identifiers() {
        let mut pending = document("doc-3", vec![(IdentifierFamily::Asin, "B09TEST123")], None);
        pending.parser_status = ParserStatus::Processing;
        let index = DocumentIndex::build("seller-1", vec![pending]);
        assert!(index.lookup(IdentifierFamily::Asin, "B09TEST123").is_empty());
        assert_eq!(index.document_count(), 0);
    }

    #[test]
    fn incomplete_document_with_raw_text_still_contributes_salvaged_identifiers() {
        let mut processing = document(
            "doc-6",
            vec![(IdentifierFamily::Asin, "B09TEST123")],
            Some("Reference order 111-2222222-3333333 was refunded"),
        );
        processing.parser_status = ParserStatus::Processing;
        let index = DocumentIndex::build("seller-1", vec![processing]);
        // Raw-text salvage still runs...
        assert_eq!(
            index
                .lookup(IdentifierFamily::OrderId, "111-2222222-3333333")
                .len(),
            1
        );
        // ...but the structured `extracted` field is not trusted pre-completion.
        assert!(index.lookup(IdentifierFamily::Asin, "B09TEST123").is_empty());
        assert_eq!(index.document_count(), 1);
    }

    #[test]
    fn cross_seller_documents_are_excluded() {
        let mut other = document("doc-4", vec![(IdentifierFamily::Sku, "SKU-X")], None);
        other.seller_id = "seller-2".into();
        let index = DocumentIndex::build("seller-1", vec![other]);
        assert!(index.lookup(IdentifierFamily::Sku, "SKU-X").is_empty());
    }

    #[test]
    fn case_id_and_reimbursement_id_get_no_raw_text_salvage() {
        let index = DocumentIndex::build(
            "seller-1",
            vec![document("doc-5", vec![], Some("case 1234567 reimbursement 7654321"))],
        );
        assert!(index.lookup(IdentifierFamily::CaseId, "1234567").is_empty());
        assert!(index
            .lookup(IdentifierFamily::ReimbursementId, "7654321")
            .is_empty());
    }
}
