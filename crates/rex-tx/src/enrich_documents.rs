//! Sales-document enricher.
//!
//! One bounded upstream listing for the whole record set, bucketed by
//! parent order id client-side. The newest document lands in the `ds1_*`
//! slot; a correction (or the second most recent) in `ds2_*`.

use std::collections::HashMap;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
    DOCUMENT_SLOTS,
};
use serde_json::{json, Map};
use tracing::debug;

pub struct DocumentsEnricher;

fn fill_slot(record: &mut Record, n: usize, document: &Value) {
    for (suffix, key) in [
        ("number", "number"),
        ("type", "type"),
        ("date", "date"),
        ("total_brutto", "total_brutto"),
    ] {
        let v = document.get(key).cloned().unwrap_or(Value::Null);
        value::set_if_absent(record, &format!("ds{n}_{suffix}"), v);
    }
}

fn fill_empty_slots(record: &mut Record) {
    for n in 1..=DOCUMENT_SLOTS {
        for suffix in ["number", "type", "date", "total_brutto"] {
            value::set_if_absent(record, &format!("ds{n}_{suffix}"), json!(""));
        }
    }
}

#[async_trait]
impl Enricher for DocumentsEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Documents
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();

        let mut order_ids: Vec<i64> = records
            .iter()
            .filter_map(|r| r.get("order_id").and_then(value::as_i64))
            .collect();
        order_ids.sort_unstable();
        order_ids.dedup();
        if order_ids.is_empty() {
            return Ok(report);
        }

        let mut params = Map::new();
        params.insert("order_ids".into(), order_ids.clone().into());
        let body = match ctx.api.call("getSalesDocuments", Value::Object(params)).await {
            Ok(body) => body,
            Err(e) => {
                // a single failed listing degrades the whole enricher softly
                report.warn(format!("documents: {e}"));
                for record in records.iter_mut() {
                    fill_empty_slots(record);
                }
                return Ok(report);
            }
        };

        let mut by_parent: HashMap<i64, Vec<Value>> = HashMap::new();
        for document in body
            .get("documents")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(order_id) = document.get("order_id").and_then(value::as_i64) {
                by_parent.entry(order_id).or_default().push(document.clone());
            }
        }
        debug!(parents = by_parent.len(), "sales documents bucketed");

        for documents in by_parent.values_mut() {
            // newest first
            documents.sort_by_key(|d| {
                std::cmp::Reverse(d.get("date").and_then(value::as_i64).unwrap_or(0))
            });
        }

        for record in records.iter_mut() {
            let Some(order_id) = record.get("order_id").and_then(value::as_i64) else {
                continue;
            };
            if let Some(documents) = by_parent.get(&order_id) {
                if let Some(main) = documents.first() {
                    fill_slot(record, 1, main);
                }
                let second = documents
                    .iter()
                    .skip(1)
                    .find(|d| d.get("type").and_then(Value::as_str) == Some("correction"))
                    .or_else(|| documents.get(1));
                if let Some(second) = second {
                    fill_slot(record, 2, second);
                }
            }
            fill_empty_slots(record);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{orders_config, TestCtx};

    fn order_record(id: i64) -> Record {
        let mut r = Record::new();
        r.insert("order_id".into(), json!(id));
        r
    }

    #[tokio::test]
    async fn newest_document_takes_the_first_slot() {
        let tc = TestCtx::new(orders_config());
        tc.api.push(
            "getSalesDocuments",
            json!({"status": "SUCCESS", "documents": [
                {"order_id": 1, "number": "FV/1", "type": "invoice", "date": 100, "total_brutto": 10.0},
                {"order_id": 1, "number": "FV/2", "type": "invoice", "date": 200, "total_brutto": 12.0},
            ]}),
        );
        let mut records = vec![order_record(1)];
        DocumentsEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(records[0]["ds1_number"], json!("FV/2"));
        assert_eq!(records[0]["ds2_number"], json!("FV/1"));
    }

    #[tokio::test]
    async fn correction_wins_the_second_slot() {
        let tc = TestCtx::new(orders_config());
        tc.api.push(
            "getSalesDocuments",
            json!({"status": "SUCCESS", "documents": [
                {"order_id": 1, "number": "KOR/1", "type": "correction", "date": 50, "total_brutto": -2.0},
                {"order_id": 1, "number": "FV/1", "type": "invoice", "date": 100, "total_brutto": 10.0},
                {"order_id": 1, "number": "FV/2", "type": "invoice", "date": 200, "total_brutto": 12.0},
            ]}),
        );
        let mut records = vec![order_record(1)];
        DocumentsEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(records[0]["ds1_number"], json!("FV/2"));
        assert_eq!(records[0]["ds2_number"], json!("KOR/1"));
    }

    #[tokio::test]
    async fn listing_failure_fills_empty_and_warns() {
        let tc = TestCtx::new(orders_config());
        let mut records = vec![order_record(1)];
        let report = DocumentsEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(records[0]["ds1_number"], json!(""));
    }
}
