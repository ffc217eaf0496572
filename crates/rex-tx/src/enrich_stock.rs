//! Stock enricher.
//!
//! Walks the inventory stock catalog page by page (up to 1 000 products per
//! page) until a short page is seen, then exposes per-warehouse quantities
//! under `stock_warehouse_<warehouseId>` keys plus a `stock_total` sum.

use std::collections::HashMap;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
};
use serde_json::Map;
use tracing::debug;

const PAGE_SIZE: usize = 1_000;

pub struct StockEnricher;

#[async_trait]
impl Enricher for StockEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Stock
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();

        // product id → warehouse id → quantity
        let mut stock: HashMap<i64, HashMap<String, f64>> = HashMap::new();
        let mut page = 1u32;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            let mut params = Map::new();
            params.insert("page".into(), page.into());
            if let Some(inventory_id) = ctx.config.filters.get("inventory_id") {
                params.insert("inventory_id".into(), inventory_id.clone());
            }
            let body = match ctx
                .api
                .call("getInventoryProductsStock", Value::Object(params))
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    report.warn(format!("stock: page {page}: {e}"));
                    break;
                }
            };

            let products = body
                .get("products")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let page_len = products.len();
            for (id, data) in products {
                let Ok(id) = id.parse::<i64>() else { continue };
                let per_warehouse = data
                    .get("stock")
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .filter_map(|(w, q)| Some((w.clone(), value::as_f64(q)?)))
                            .collect()
                    })
                    .unwrap_or_default();
                stock.insert(id, per_warehouse);
            }
            if page_len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        debug!(products = stock.len(), pages = page, "stock catalog walked");

        for record in records.iter_mut() {
            let Some(id) = record.get("product_id").and_then(value::as_i64) else {
                continue;
            };
            let Some(per_warehouse) = stock.get(&id) else { continue };
            let mut total = 0.0;
            for (warehouse, quantity) in per_warehouse {
                total += quantity;
                value::set_if_absent(
                    record,
                    &format!("stock_warehouse_{warehouse}"),
                    value::num(*quantity),
                );
            }
            value::set_if_absent(record, "stock_total", value::num(total));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{orders_config, TestCtx};
    use serde_json::json;

    fn product_record(id: i64) -> Record {
        let mut r = Record::new();
        r.insert("product_id".into(), json!(id));
        r
    }

    #[tokio::test]
    async fn exposes_per_warehouse_keys() {
        let tc = TestCtx::new(orders_config());
        tc.api.push(
            "getInventoryProductsStock",
            json!({"status": "SUCCESS", "products": {
                "5": {"stock": {"4": 7, "9": 3}},
            }}),
        );
        let mut records = vec![product_record(5)];
        StockEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(records[0]["stock_warehouse_4"], json!(7.0));
        assert_eq!(records[0]["stock_warehouse_9"], json!(3.0));
        assert_eq!(records[0]["stock_total"], json!(10.0));
        // a single short page ends the walk
        assert_eq!(tc.api.call_count("getInventoryProductsStock"), 1);
    }
}
