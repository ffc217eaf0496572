//! Products fetcher: `getInventoryProductsList`, numeric pages.
//!
//! The dataset is inventory-scoped; a missing `inventory_id` filter is a
//! configuration error raised before any upstream call.

use async_trait::async_trait;
use rex_core::{EngineError, FetchRequest, Fetcher, Record, UpstreamApi, Value};
use serde_json::Map;

use crate::fetch::{fetch_all_pages, filter_i64, Page, PageToken, MAX_RECORDS};

const PAGE_SIZE: usize = 1_000;

pub struct ProductsFetcher;

#[async_trait]
impl Fetcher for ProductsFetcher {
    fn dataset(&self) -> &'static str {
        "products"
    }

    async fn fetch(
        &self,
        api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError> {
        let inventory_id = filter_i64(req.filters, "inventory_id").ok_or_else(|| {
            EngineError::Configuration(
                "the products dataset requires an 'inventory_id' filter".to_string(),
            )
        })?;

        fetch_all_pages(req.cancel, MAX_RECORDS, |token| {
            let page = match token {
                Some(PageToken::Number(n)) => n,
                _ => 1,
            };
            let mut params = Map::new();
            params.insert("inventory_id".into(), inventory_id.into());
            params.insert("page".into(), page.into());
            async move {
                let body = api
                    .call("getInventoryProductsList", Value::Object(params))
                    .await?;
                let raw = body
                    .get("products")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let full_page = raw.len() >= PAGE_SIZE;
                let records: Vec<Record> = raw
                    .iter()
                    .filter_map(|p| {
                        let mut record = p.as_object()?.clone();
                        record
                            .entry("inventory_id".to_string())
                            .or_insert(inventory_id.into());
                        Some(record)
                    })
                    .collect();
                let next = full_page.then(|| PageToken::Number(page + 1));
                Ok(Page { records, next })
            }
        })
        .await
    }
}
