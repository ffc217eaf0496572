//! Shared pagination machinery for fetchers.
//!
//! Each fetcher declares its pagination discipline through the continuation
//! token it hands back: cursor-by-last-id, numeric page, or date-watermark.
//! The helper stops when a page returns no continuation, the record ceiling
//! is reached, or the caller cancels.

use std::collections::HashMap;
use std::future::Future;

use rex_core::{value, EngineError, Record, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Operational default record ceiling per run.
pub const MAX_RECORDS: usize = 10_000;

/// Opaque continuation carried between pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageToken {
    /// Next page starts after this entity id.
    LastId(i64),
    /// Next numeric page.
    Number(u32),
    /// Next page starts at this epoch timestamp.
    Watermark(i64),
}

/// One fetched page plus the continuation for the next one.
pub struct Page {
    pub records: Vec<Record>,
    pub next: Option<PageToken>,
}

/// Drive `page_fn` until it stops producing a continuation, the ceiling is
/// reached, or the run is canceled.
pub async fn fetch_all_pages<F, Fut>(
    cancel: &CancellationToken,
    max_records: usize,
    mut page_fn: F,
) -> Result<Vec<Record>, EngineError>
where
    F: FnMut(Option<PageToken>) -> Fut,
    Fut: Future<Output = Result<Page, EngineError>>,
{
    let mut out: Vec<Record> = Vec::new();
    let mut token: Option<PageToken> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        let page = page_fn(token.take()).await?;
        let empty_page = page.records.is_empty();
        out.extend(page.records);

        if out.len() >= max_records {
            warn!(ceiling = max_records, "record ceiling reached, stopping pagination");
            out.truncate(max_records);
            return Ok(out);
        }
        match page.next {
            Some(next) if !empty_page => token = Some(next),
            // a continuation without progress would loop forever
            _ => return Ok(out),
        }
    }
}

/// String filter, tolerating non-string values.
pub fn filter_str<'a>(filters: &'a HashMap<String, Value>, key: &str) -> Option<String> {
    filters.get(key).and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Integer filter, tolerating numeric strings.
pub fn filter_i64(filters: &HashMap<String, Value>, key: &str) -> Option<i64> {
    filters.get(key).and_then(value::as_i64)
}

/// Date filter as seconds since epoch; accepts epoch numbers and
/// `YYYY-MM-DD` strings.
pub fn filter_epoch(filters: &HashMap<String, Value>, key: &str) -> Option<i64> {
    let v = filters.get(key)?;
    if let Some(n) = value::as_i64(v) {
        return Some(n);
    }
    let s = v.as_str()?;
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: i64) -> Record {
        let mut r = Record::new();
        r.insert("order_id".into(), json!(id));
        r
    }

    #[tokio::test]
    async fn follows_continuations_until_exhausted() {
        let cancel = CancellationToken::new();
        let out = fetch_all_pages(&cancel, MAX_RECORDS, |token| async move {
            Ok(match token {
                None => Page {
                    records: vec![rec(1), rec(2)],
                    next: Some(PageToken::LastId(2)),
                },
                Some(PageToken::LastId(2)) => Page {
                    records: vec![rec(3)],
                    next: None,
                },
                other => panic!("unexpected token {other:?}"),
            })
        })
        .await
        .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn ceiling_truncates_and_stops() {
        let cancel = CancellationToken::new();
        let out = fetch_all_pages(&cancel, 3, |token| async move {
            let start = match token {
                Some(PageToken::LastId(id)) => id,
                _ => 0,
            };
            Ok(Page {
                records: (start + 1..=start + 2).map(rec).collect(),
                next: Some(PageToken::LastId(start + 2)),
            })
        })
        .await
        .unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_page() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetch_all_pages(&cancel, MAX_RECORDS, |_| async move {
            Ok(Page {
                records: vec![rec(1)],
                next: None,
            })
        })
        .await;
        assert!(matches!(result, Err(EngineError::Canceled)));
    }

    #[test]
    fn epoch_filter_accepts_dates_and_numbers() {
        let mut filters = HashMap::new();
        filters.insert("date_from".to_string(), json!("2024-01-15"));
        filters.insert("raw".to_string(), json!(1705312800));
        assert_eq!(filter_epoch(&filters, "date_from"), Some(1705276800));
        assert_eq!(filter_epoch(&filters, "raw"), Some(1705312800));
        assert_eq!(filter_epoch(&filters, "absent"), None);
    }
}
