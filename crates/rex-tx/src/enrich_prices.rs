//! Price enricher.
//!
//! Same page walk as the stock enricher, exposing per-price-group prices
//! under `price_group_<groupId>` keys.

use std::collections::HashMap;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
};
use serde_json::Map;
use tracing::debug;

const PAGE_SIZE: usize = 1_000;

pub struct PricesEnricher;

#[async_trait]
impl Enricher for PricesEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Prices
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();

        // product id → price group id → price
        let mut prices: HashMap<i64, HashMap<String, f64>> = HashMap::new();
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
                .call("getInventoryProductsPrices", Value::Object(params))
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    report.warn(format!("prices: page {page}: {e}"));
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
                let per_group = data
                    .get("prices")
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .filter_map(|(g, p)| Some((g.clone(), value::as_f64(p)?)))
                            .collect()
                    })
                    .unwrap_or_default();
                prices.insert(id, per_group);
            }
            if page_len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        debug!(products = prices.len(), pages = page, "price catalog walked");

        for record in records.iter_mut() {
            let Some(id) = record.get("product_id").and_then(value::as_i64) else {
                continue;
            };
            let Some(per_group) = prices.get(&id) else { continue };
            for (group, price) in per_group {
                value::set_if_absent(
                    record,
                    &format!("price_group_{group}"),
                    value::num(value::round2(*price)),
                );
            }
        }
        Ok(report)
    }
}
