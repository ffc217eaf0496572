//! Inventory enricher.
//!
//! Fetches product master data for every unique product id in batches of up
//! to 1 000 ids per call, then computes unit margin and margin percentage
//! from the record's net selling price and the inventory's average cost.

use std::collections::HashMap;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
};
use serde_json::Map;
use tracing::debug;

const IDS_PER_CALL: usize = 1_000;

pub struct InventoryEnricher;

fn product_id(record: &Record) -> Option<i64> {
    record
        .get("item_product_id")
        .or_else(|| record.get("product_id"))
        .and_then(value::as_i64)
}

#[async_trait]
impl Enricher for InventoryEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Inventory
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();

        let mut ids: Vec<i64> = records.iter().filter_map(product_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(report);
        }
        debug!(products = ids.len(), "fetching product master data");

        let mut costs: HashMap<i64, f64> = HashMap::new();
        for chunk in ids.chunks(IDS_PER_CALL) {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            let mut params = Map::new();
            params.insert("products".into(), chunk.to_vec().into());
            if let Some(inventory_id) = ctx.config.filters.get("inventory_id") {
                params.insert("inventory_id".into(), inventory_id.clone());
            }
            match ctx
                .api
                .call("getInventoryProductsData", Value::Object(params))
                .await
            {
                Ok(body) => {
                    if let Some(products) = body.get("products").and_then(Value::as_object) {
                        for (id, data) in products {
                            let (Ok(id), Some(cost)) = (
                                id.parse::<i64>(),
                                data.get("average_cost").and_then(value::as_f64),
                            ) else {
                                continue;
                            };
                            costs.insert(id, cost);
                        }
                    }
                }
                Err(e) => report.warn(format!("inventory: batch of {}: {e}", chunk.len())),
            }
        }

        for record in records.iter_mut() {
            let Some(id) = product_id(record) else { continue };
            let Some(&cost) = costs.get(&id) else { continue };
            value::set_if_absent(record, "product_avg_cost", value::num(value::round2(cost)));
            value::set_if_absent(record, "average_cost", value::num(value::round2(cost)));

            let Some(net) = record.get("item_price_netto").and_then(value::as_f64) else {
                continue;
            };
            let margin = value::round2(net - cost);
            value::set_if_absent(record, "unit_margin", value::num(margin));
            if net.abs() > f64::EPSILON {
                value::set_if_absent(
                    record,
                    "margin_percent",
                    value::num(value::round2(margin / net * 100.0)),
                );
            }
        }
        Ok(report)
    }
}
