//! Payment enricher.
//!
//! Per-parent payment history in bounded-parallel batches; yields the last
//! payment's date and amount plus the sum and count of all payments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
};
use serde_json::Map;

use crate::for_each_batched;

const BATCH: usize = 20;
const PAUSE: Duration = Duration::from_millis(100);

pub struct PaymentsEnricher;

#[derive(Debug, Clone, Default)]
struct PaymentSummary {
    last_date: i64,
    last_amount: f64,
    sum: f64,
    count: usize,
}

fn summarize(body: &Value) -> PaymentSummary {
    let mut summary = PaymentSummary::default();
    for payment in body
        .get("payments")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let date = payment.get("date").and_then(value::as_i64).unwrap_or(0);
        let amount = payment.get("amount").and_then(value::as_f64).unwrap_or(0.0);
        summary.sum += amount;
        summary.count += 1;
        if date >= summary.last_date {
            summary.last_date = date;
            summary.last_amount = amount;
        }
    }
    summary
}

#[async_trait]
impl Enricher for PaymentsEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Payments
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

        let results = for_each_batched(&order_ids, BATCH, PAUSE, ctx.cancel, |order_id| {
            let order_id = *order_id;
            async move {
                let mut params = Map::new();
                params.insert("order_id".into(), order_id.into());
                ctx.api
                    .call("getOrderPaymentsHistory", Value::Object(params))
                    .await
            }
        })
        .await?;

        let mut summaries: HashMap<i64, PaymentSummary> = HashMap::new();
        for (order_id, result) in results {
            match result {
                Ok(body) => {
                    summaries.insert(order_id, summarize(&body));
                }
                Err(e) => report.warn(format!("payments: order {order_id}: {e}")),
            }
        }

        for record in records.iter_mut() {
            let Some(order_id) = record.get("order_id").and_then(value::as_i64) else {
                continue;
            };
            let Some(summary) = summaries.get(&order_id) else { continue };
            if summary.count > 0 {
                value::set_if_absent(record, "last_payment_date", summary.last_date.into());
                value::set_if_absent(
                    record,
                    "last_payment_amount",
                    value::num(value::round2(summary.last_amount)),
                );
            }
            value::set_if_absent(record, "payments_sum", value::num(value::round2(summary.sum)));
            value::set_if_absent(record, "payments_count", (summary.count as i64).into());
        }
        Ok(report)
    }
}
