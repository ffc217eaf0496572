//! Credit enricher.
//!
//! One upstream call per unique contractor (keyed by tax number): current
//! and overdue debt, available credit (limit minus current debt, floored at
//! zero), and aggregated order statistics.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
};
use serde_json::Map;

use crate::for_each_batched;

const BATCH: usize = 10;
const PAUSE: Duration = Duration::from_millis(100);

pub struct CreditEnricher;

fn contractor_key(record: &Record) -> Option<String> {
    record
        .get("invoice_nip")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Enricher for CreditEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Credit
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();

        let mut contractors: Vec<String> = records.iter().filter_map(contractor_key).collect();
        contractors.sort_unstable();
        contractors.dedup();
        if contractors.is_empty() {
            return Ok(report);
        }

        let results = for_each_batched(&contractors, BATCH, PAUSE, ctx.cancel, |nip| {
            let nip = nip.clone();
            async move {
                let mut params = Map::new();
                params.insert("nip".into(), nip.into());
                ctx.api.call("getContractorCredit", Value::Object(params)).await
            }
        })
        .await?;

        let mut credits: HashMap<String, Value> = HashMap::new();
        for (nip, result) in results {
            match result {
                Ok(body) => {
                    credits.insert(nip, body);
                }
                Err(e) => report.warn(format!("credit: contractor {nip}: {e}")),
            }
        }

        for record in records.iter_mut() {
            let Some(nip) = contractor_key(record) else { continue };
            let Some(body) = credits.get(&nip) else { continue };

            let credit = body.get("credit").cloned().unwrap_or(Value::Null);
            let limit = credit.get("limit").and_then(value::as_f64).unwrap_or(0.0);
            let current = credit
                .get("debt_current")
                .and_then(value::as_f64)
                .unwrap_or(0.0);
            let overdue = credit
                .get("debt_overdue")
                .and_then(value::as_f64)
                .unwrap_or(0.0);

            value::set_if_absent(record, "debt_current", value::num(value::round2(current)));
            value::set_if_absent(record, "debt_overdue", value::num(value::round2(overdue)));
            value::set_if_absent(
                record,
                "credit_available",
                value::num(value::round2((limit - current).max(0.0))),
            );

            if let Some(orders) = body.get("orders") {
                if let Some(count) = orders.get("count").and_then(value::as_i64) {
                    value::set_if_absent(record, "contractor_orders_count", count.into());
                }
                if let Some(sum) = orders.get("sum").and_then(value::as_f64) {
                    value::set_if_absent(
                        record,
                        "contractor_orders_sum",
                        value::num(value::round2(sum)),
                    );
                }
            }
        }
        Ok(report)
    }
}
