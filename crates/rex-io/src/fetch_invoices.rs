//! Invoices fetcher: `getInvoices`, date-watermark pagination.
//!
//! The upstream listing is ordered by issue time and capped per response;
//! the next page starts one second past the newest timestamp seen.

use async_trait::async_trait;
use rex_core::{value, EngineError, FetchRequest, Fetcher, Record, UpstreamApi, Value};
use serde_json::Map;

use crate::fetch::{fetch_all_pages, filter_epoch, Page, PageToken, MAX_RECORDS};

const PAGE_SIZE: usize = 100;

pub struct InvoicesFetcher;

#[async_trait]
impl Fetcher for InvoicesFetcher {
    fn dataset(&self) -> &'static str {
        "invoices"
    }

    async fn fetch(
        &self,
        api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError> {
        let start = filter_epoch(req.filters, "date_from").unwrap_or(0);

        fetch_all_pages(req.cancel, MAX_RECORDS, |token| {
            let from = match token {
                Some(PageToken::Watermark(ts)) => ts,
                _ => start,
            };
            let mut params = Map::new();
            params.insert("date_from".into(), from.into());
            async move {
                let body = api.call("getInvoices", Value::Object(params)).await?;
                let raw = body
                    .get("invoices")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let full_page = raw.len() >= PAGE_SIZE;
                let records: Vec<Record> =
                    raw.iter().filter_map(|r| r.as_object().cloned()).collect();
                let next = if full_page {
                    records
                        .iter()
                        .filter_map(|r| r.get("date_add").and_then(value::as_i64))
                        .max()
                        .map(|ts| PageToken::Watermark(ts + 1))
                } else {
                    None
                };
                Ok(Page { records, next })
            }
        })
        .await
    }
}
