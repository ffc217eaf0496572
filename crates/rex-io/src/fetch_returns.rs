//! Returns fetcher: `getOrderReturns`, last-id cursor.

use async_trait::async_trait;
use rex_core::{value, EngineError, FetchRequest, Fetcher, Record, UpstreamApi, Value};
use serde_json::Map;

use crate::fetch::{fetch_all_pages, filter_epoch, filter_i64, Page, PageToken, MAX_RECORDS};

const PAGE_SIZE: usize = 100;

pub struct ReturnsFetcher;

#[async_trait]
impl Fetcher for ReturnsFetcher {
    fn dataset(&self) -> &'static str {
        "returns"
    }

    async fn fetch(
        &self,
        api: &dyn UpstreamApi,
        req: &FetchRequest<'_>,
    ) -> Result<Vec<Record>, EngineError> {
        let mut base = Map::new();
        if let Some(from) = filter_epoch(req.filters, "date_from") {
            base.insert("date_from".into(), from.into());
        }
        if let Some(status) = filter_i64(req.filters, "status") {
            base.insert("status_id".into(), status.into());
        }

        fetch_all_pages(req.cancel, MAX_RECORDS, |token| {
            let mut params = base.clone();
            if let Some(PageToken::LastId(id)) = token {
                params.insert("id_from".into(), (id + 1).into());
            }
            async move {
                let body = api.call("getOrderReturns", Value::Object(params)).await?;
                let raw = body
                    .get("returns")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let full_page = raw.len() >= PAGE_SIZE;
                let records: Vec<Record> =
                    raw.iter().filter_map(|r| r.as_object().cloned()).collect();
                let next = if full_page {
                    records
                        .iter()
                        .filter_map(|r| r.get("return_id").and_then(value::as_i64))
                        .max()
                        .map(PageToken::LastId)
                } else {
                    None
                };
                Ok(Page { records, next })
            }
        })
        .await
    }
}
