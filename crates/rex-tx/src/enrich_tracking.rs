//! Tracking enricher.
//!
//! One upstream call per shipment package: picks the newest status event
//! and counts the total. Keys by the private package ids the shipment
//! enricher left on each record, so it declares that enricher as a
//! prerequisite in the catalog.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
    PACKAGE_SLOTS,
};
use serde_json::Map;
use tracing::debug;

use crate::for_each_batched;

const BATCH: usize = 20;
const PAUSE: Duration = Duration::from_millis(100);

pub struct TrackingEnricher;

#[derive(Debug, Clone)]
struct TrackingSummary {
    status: String,
    status_date: i64,
    events: usize,
}

fn summarize(body: &Value) -> Option<TrackingSummary> {
    let history = body.get("history")?.as_array()?;
    let newest = history
        .iter()
        .max_by_key(|e| e.get("date").and_then(value::as_i64).unwrap_or(0))?;
    Some(TrackingSummary {
        status: newest
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status_date: newest.get("date").and_then(value::as_i64).unwrap_or(0),
        events: history.len(),
    })
}

#[async_trait]
impl Enricher for TrackingEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Tracking
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();

        // (package id, courier code) pairs from every filled slot
        let mut packages: Vec<(i64, String)> = Vec::new();
        for record in records.iter() {
            for n in 1..=PACKAGE_SLOTS {
                let Some(id) = record.get(&format!("_pkg{n}_id")).and_then(value::as_i64) else {
                    continue;
                };
                let courier = record
                    .get(&format!("_pkg{n}_courier"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                packages.push((id, courier));
            }
        }
        packages.sort();
        packages.dedup();
        if packages.is_empty() {
            return Ok(report);
        }
        debug!(packages = packages.len(), "fetching tracking history");

        let results = for_each_batched(&packages, BATCH, PAUSE, ctx.cancel, |(id, courier)| {
            let (id, courier) = (*id, courier.clone());
            async move {
                let mut params = Map::new();
                params.insert("package_id".into(), id.into());
                params.insert("courier_code".into(), courier.into());
                ctx.api
                    .call("getCourierPackagesStatusHistory", Value::Object(params))
                    .await
            }
        })
        .await?;

        let mut summaries: HashMap<i64, TrackingSummary> = HashMap::new();
        for ((id, _), result) in results {
            match result {
                Ok(body) => {
                    if let Some(summary) = summarize(&body) {
                        summaries.insert(id, summary);
                    }
                }
                Err(e) => report.warn(format!("tracking: package {id}: {e}")),
            }
        }

        for record in records.iter_mut() {
            for n in 1..=PACKAGE_SLOTS {
                let Some(id) = record.get(&format!("_pkg{n}_id")).and_then(value::as_i64) else {
                    continue;
                };
                let Some(summary) = summaries.get(&id) else { continue };
                value::set_if_absent(
                    record,
                    &format!("pkg{n}_tracking_status"),
                    summary.status.clone().into(),
                );
                value::set_if_absent(
                    record,
                    &format!("pkg{n}_tracking_status_date"),
                    summary.status_date.into(),
                );
                value::set_if_absent(
                    record,
                    &format!("pkg{n}_tracking_events"),
                    (summary.events as i64).into(),
                );
            }
        }
        Ok(report)
    }
}
