//! Orders fetcher (and its one-row-per-line expansion).
//!
//! `getOrders` pages by a last-id cursor on top of a confirmed-from date
//! filter. The order-items fetcher reuses the same listing and expands the
//! nested product array, preserving every parent key on each expanded
//! record so downstream enrichers can still key by `order_id`.

use async_trait::async_trait;
use rex_core::{value, EngineError, FetchRequest, Fetcher, Record, UpstreamApi, Value};
use serde_json::Map;
use tracing::debug;

use crate::fetch::{fetch_all_pages, filter_epoch, filter_i64, filter_str, PageToken, MAX_RECORDS, Page};

const PAGE_SIZE: usize = 100;

pub struct OrdersFetcher;

impl OrdersFetcher {
    /// Translate the configuration's filter shape into `getOrders`
    /// parameters. Unknown filter keys are ignored.
    fn base_params(req: &FetchRequest<'_>) -> Map<String, Value> {
        let mut params = Map::new();
        if let Some(from) = filter_epoch(req.filters, "date_from") {
            params.insert("date_confirmed_from".into(), from.into());
        }
        if let Some(to) = filter_epoch(req.filters, "date_to") {
            params.insert("date_confirmed_to".into(), to.into());
        }
        if let Some(status) = filter_i64(req.filters, "status") {
            params.insert("status_id".into(), status.into());
        }
        if let Some(source) = filter_str(req.filters, "source") {
            params.insert("filter_order_source".into(), source.into());
        }
        params.insert("get_unconfirmed_orders".into(), false.into());
        params
    }
}

fn normalize_order(raw: &Value) -> Option<Record> {
    let obj = raw.as_object()?;
    let mut record = obj.clone();
    // courier code arrives under the shipping-module key upstream
    if !record.contains_key("courier_code") {
        if let Some(module) = obj.get("delivery_package_module") {
            record.insert("courier_code".to_string(), module.clone());
        }
    }
    Some(record)
}

async fn list_orders(
    api: &dyn UpstreamApi,
    req: &FetchRequest<'_>,
) -> Result<Vec<Record>, EngineError> {
    let base = OrdersFetcher::base_params(req);
    let fetched = fetch_all_pages(req.cancel, MAX_RECORDS, |token| {
        let mut params = base.clone();
        if let Some(PageToken::LastId(id)) = token {
            params.insert("id_from".into(), (id + 1).into());
        }
        async move {
            let body = api.call("getOrders", Value::Object(params)).await?;
            let raw = body
                .get("orders")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let full_page = raw.len() >= PAGE_SIZE;
            let records: Vec<Record> = raw.iter().filter_map(normalize_order).collect();
            let next = if full_page {
                records
                    .iter()
                    .filter_map(|r| r.get("order_id").and_then(value::as_i64))
                    .max()
                    .map(PageToken::LastId)
            } else {
                None
            };
            Ok(Page { records, next })
        }
    })
    .await?;
    debug!(count = fetched.len(), "orders fetched");
    Ok(fetched)
}

#[async_trait]
impl Fetcher for OrdersFetcher {
    fn dataset(&self) -> &'static str {
        "orders"
    }

    async fn fetch(
        &self,
        api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError> {
        list_orders(api, req).await
    }
}

/// Same listing, one record per product line.
pub struct OrderItemsFetcher;

fn expand_lines(parents: Vec<Record>) -> Vec<Record> {
    let mut out = Vec::new();
    for parent in parents {
        let lines = parent
            .get("products")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if lines.is_empty() {
            out.push(parent);
            continue;
        }
        for line in &lines {
            let Some(fields) = line.as_object() else { continue };
            let mut record = parent.clone();
            for (key, val) in fields {
                record.insert(format!("item_{key}"), val.clone());
            }
            // net unit price derived at expansion time
            if !record.contains_key("item_price_netto") {
                let gross = record.get("item_price_brutto").and_then(value::as_f64);
                let vat = record
                    .get("item_tax_rate")
                    .and_then(value::as_f64)
                    .unwrap_or(23.0);
                if let Some(gross) = gross {
                    record.insert(
                        "item_price_netto".to_string(),
                        value::num(value::round2(gross / (1.0 + vat / 100.0))),
                    );
                }
            }
            out.push(record);
        }
    }
    out
}

#[async_trait]
impl Fetcher for OrderItemsFetcher {
    fn dataset(&self) -> &'static str {
        "order_items"
    }

    async fn fetch(
        &self,
        api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError> {
        Ok(expand_lines(list_orders(api, req).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockApi;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn order(id: i64, products: Value) -> Value {
        json!({
            "order_id": id,
            "date_add": 1705312800,
            "email": "a@x",
            "currency": "PLN",
            "delivery_package_module": "dpd",
            "products": products,
        })
    }

    fn request<'a>(
        filters: &'a HashMap<String, Value>,
        cancel: &'a CancellationToken,
    ) -> FetchRequest<'a> {
        FetchRequest { filters, cancel }
    }

    #[tokio::test]
    async fn single_short_page_stops_pagination() {
        let api = MockApi::new();
        api.push(
            "getOrders",
            json!({"status": "SUCCESS", "orders": [order(101, json!([])), order(102, json!([]))]}),
        );
        let filters = HashMap::new();
        let cancel = CancellationToken::new();
        let records = OrdersFetcher
            .fetch(&api, &request(&filters, &cancel))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(api.call_count("getOrders"), 1);
        assert_eq!(records[0]["courier_code"], json!("dpd"));
    }

    #[tokio::test]
    async fn date_filter_lands_in_upstream_vocabulary() {
        let api = MockApi::new();
        api.push("getOrders", json!({"status": "SUCCESS", "orders": []}));
        let mut filters = HashMap::new();
        filters.insert("date_from".to_string(), json!("2024-01-15"));
        filters.insert("unknown_key".to_string(), json!("ignored"));
        let cancel = CancellationToken::new();
        OrdersFetcher
            .fetch(&api, &request(&filters, &cancel))
            .await
            .unwrap();
        let calls = api.calls.lock().unwrap();
        let params = calls[0].1.as_object().unwrap();
        assert_eq!(params["date_confirmed_from"], json!(1705276800));
        assert!(!params.contains_key("unknown_key"));
    }

    #[tokio::test]
    async fn items_expansion_preserves_parent_keys() {
        let api = MockApi::new();
        api.push(
            "getOrders",
            json!({"status": "SUCCESS", "orders": [order(
                7,
                json!([
                    {"product_id": 1, "price_brutto": 12.30, "tax_rate": 23, "quantity": 2},
                    {"product_id": 2, "price_brutto": 5.00, "tax_rate": 23, "quantity": 1},
                ])
            )]}),
        );
        let filters = HashMap::new();
        let cancel = CancellationToken::new();
        let records = OrderItemsFetcher
            .fetch(&api, &request(&filters, &cancel))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record["order_id"], json!(7));
            assert_eq!(record["email"], json!("a@x"));
        }
        assert_eq!(records[0]["item_product_id"], json!(1));
        assert_eq!(records[0]["item_price_netto"], json!(10.0));
    }
}
