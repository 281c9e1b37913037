use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::CanonicalRecord;
use crate::LedgerError;
use crate::LedgerResult;
use crate::LedgerStore;
use crate::ReportType;
use crate::SellerId;
use crate::SyncState;
use crate::SyncStatus;
use crate::UpsertBatchOutcome;
use crate::UpsertBatchRequest;

/// In-memory `LedgerStore`. A single `tokio::sync::Mutex` guards both the
/// record table and the sync-status table so a batch upsert and its status
/// advance commit as one atomic step, mirroring the single-critical-section
/// pattern the in-memory ledger service in this workspace has always used.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    records: HashMap<(SellerId, ReportType, Option<String>), CanonicalRecord>,
    checksums: HashMap<(SellerId, ReportType), std::collections::HashSet<String>>,
    statuses: HashMap<(SellerId, ReportType), SyncStatus>,
}

impl InMemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// On conflict, merges `incoming` over `existing` non-null field by non-null
/// field instead of replacing the whole record — a resubmitted row missing
/// an optional field (e.g. a second report dropping `description`) must
/// never blank out a value a prior report already established.
fn merge_on_conflict(existing: CanonicalRecord, incoming: CanonicalRecord) -> CanonicalRecord {
    let mut identifiers = existing.identifiers;
    identifiers.extend(incoming.identifiers);
    CanonicalRecord {
        sku: incoming.sku.or(existing.sku),
        order_id: incoming.order_id.or(existing.order_id),
        description: incoming.description.or(existing.description),
        identifiers,
        ..incoming
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_batch(&self, request: UpsertBatchRequest) -> LedgerResult<UpsertBatchOutcome> {
        let mut guard = self.state.lock().await;
        let mut inserted = 0u64;
        let mut updated = 0u64;
        let mut skipped_duplicates = 0u64;

        for record in request.records {
            let checksum_seen = guard
                .checksums
                .entry((request.seller_id.clone(), request.report_type))
                .or_default()
                .contains(&record.source_checksum);
            if record.external_id.is_none() && checksum_seen {
                skipped_duplicates += 1;
                continue;
            }

            let key = (
                request.seller_id.clone(),
                request.report_type,
                record.external_id.clone(),
            );
            guard
                .checksums
                .entry((request.seller_id.clone(), request.report_type))
                .or_default()
                .insert(record.source_checksum.clone());

            let merged = match guard.records.remove(&key) {
                Some(existing) => {
                    updated += 1;
                    merge_on_conflict(existing, record)
                }
                None => {
                    inserted += 1;
                    record
                }
            };
            guard.records.insert(key, merged);
        }

        let total = guard
            .records
            .keys()
            .filter(|(seller, report_type, _)| {
                *seller == request.seller_id && *report_type == request.report_type
            })
            .count() as u64;

        let status = SyncStatus {
            seller_id: request.seller_id.clone(),
            report_type: request.report_type,
            state: SyncState::Completed,
            records_processed: inserted + updated,
            records_total: total,
            last_error: None,
        };
        guard
            .statuses
            .insert((request.seller_id, request.report_type), status);

        Ok(UpsertBatchOutcome {
            inserted,
            updated,
            skipped_duplicates,
        })
    }

    async fn list_records(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
    ) -> LedgerResult<Vec<CanonicalRecord>> {
        let guard = self.state.lock().await;
        let mut records: Vec<_> = guard
            .records
            .iter()
            .filter(|((seller, rt, _), _)| seller == seller_id && *rt == report_type)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|left, right| {
            left.record_date
                .cmp(&right.record_date)
                .then_with(|| left.external_id.cmp(&right.external_id))
        });
        Ok(records)
    }

    async fn get_sync_status(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
    ) -> LedgerResult<SyncStatus> {
        let guard = self.state.lock().await;
        guard
            .statuses
            .get(&(seller_id.clone(), report_type))
            .cloned()
            .ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "sync status for seller {seller_id} report {}",
                    report_type.as_str()
                ))
            })
    }

    async fn mark_sync_failed(
        &self,
        seller_id: &SellerId,
        report_type: ReportType,
        error: String,
    ) -> LedgerResult<SyncStatus> {
        let mut guard = self.state.lock().await;
        let status = guard
            .statuses
            .entry((seller_id.clone(), report_type))
            .or_insert_with(|| SyncStatus {
                seller_id: seller_id.clone(),
                report_type,
                state: SyncState::Pending,
                records_processed: 0,
                records_total: 0,
                last_error: None,
            });
        status.state = SyncState::Failed;
        status.last_error = Some(error);
        Ok(status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordDetail;
    use crate::ShipmentStatus;
    use pretty_assertions::assert_eq;

    fn order_record(external_id: &str, checksum: &str) -> CanonicalRecord {
        let now = Utc::now();
        CanonicalRecord {
            id: format!("rec-{external_id}"),
            seller_id: "seller-1".into(),
            report_type: ReportType::Orders,
            detail: RecordDetail::Order {
                total_fees_minor: 250,
            },
            amount_minor: 10_000,
            currency: "USD".into(),
            record_date: now,
            sku: Some("SKU-1".into()),
            order_id: Some(external_id.into()),
            description: None,
            source: "amazon".into(),
            external_id: Some(external_id.into()),
            source_checksum: checksum.into(),
            degraded_date: false,
            price_estimated: false,
            identifiers: HashMap::new(),
            sync_window_start: now,
            sync_window_end: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_batch_is_idempotent_on_external_id() {
        let store = InMemoryLedgerStore::new();
        let request = UpsertBatchRequest {
            seller_id: "seller-1".into(),
            report_type: ReportType::Orders,
            records: vec![order_record("ORD-1", "chk-1")],
        };
        let first = store.upsert_batch(request.clone()).await.expect("first upsert");
        assert_eq!(first.inserted, 1);
        assert_eq!(first.updated, 0);

        let second = store.upsert_batch(request).await.expect("second upsert");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);

        let records = store
            .list_records(&"seller-1".to_string(), ReportType::Orders)
            .await
            .expect("list records");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_upsert_merges_instead_of_blanking_optional_fields() {
        let store = InMemoryLedgerStore::new();
        let mut first = order_record("ORD-2", "chk-first");
        first
            .identifiers
            .insert(claims_docindex::IdentifierFamily::Asin, "B09TEST123".into());
        store
            .upsert_batch(UpsertBatchRequest {
                seller_id: "seller-1".into(),
                report_type: ReportType::Orders,
                records: vec![first],
            })
            .await
            .expect("first upsert");

        let mut second = order_record("ORD-2", "chk-second");
        second.sku = None;
        second.description = None;
        second
            .identifiers
            .insert(claims_docindex::IdentifierFamily::TrackingNumber, "1Z999AA10123456784".into());
        store
            .upsert_batch(UpsertBatchRequest {
                seller_id: "seller-1".into(),
                report_type: ReportType::Orders,
                records: vec![second],
            })
            .await
            .expect("second upsert");

        let records = store
            .list_records(&"seller-1".to_string(), ReportType::Orders)
            .await
            .expect("list records");
        assert_eq!(records.len(), 1);
        let merged = &records[0];
        assert_eq!(merged.sku.as_deref(), Some("SKU-1"));
        assert_eq!(
            merged.identifiers.get(&claims_docindex::IdentifierFamily::Asin).map(String::as_str),
            Some("B09TEST123")
        );
        assert_eq!(
            merged
                .identifiers
                .get(&claims_docindex::IdentifierFamily::TrackingNumber)
                .map(String::as_str),
            Some("1Z999AA10123456784")
        );
    }

    #[tokio::test]
    async fn checksum_dedup_skips_external_id_less_duplicates() {
        let store = InMemoryLedgerStore::new();
        let mut record = order_record("", "chk-dup");
        record.external_id = None;
        let request = UpsertBatchRequest {
            seller_id: "seller-1".into(),
            report_type: ReportType::Orders,
            records: vec![record.clone(), record],
        };
        let outcome = store.upsert_batch(request).await.expect("upsert batch");
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.skipped_duplicates, 1);
    }

    #[tokio::test]
    async fn sync_status_tracks_last_batch() {
        let store = InMemoryLedgerStore::new();
        store
            .upsert_batch(UpsertBatchRequest {
                seller_id: "seller-1".into(),
                report_type: ReportType::Shipments,
                records: vec![CanonicalRecord {
                    detail: RecordDetail::Shipment {
                        missing_quantity: 2,
                        unit_price_minor: Some(500),
                        status: ShipmentStatus::LostInTransit,
                    },
                    report_type: ReportType::Shipments,
                    ..order_record("SHIP-1", "chk-ship")
                }],
            })
            .await
            .expect("upsert");

        let status = store
            .get_sync_status(&"seller-1".to_string(), ReportType::Shipments)
            .await
            .expect("status");
        assert_eq!(status.state, SyncState::Completed);
        assert_eq!(status.records_processed, 1);
    }
}
