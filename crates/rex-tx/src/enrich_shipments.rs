//! Shipment enricher.
//!
//! For every parent order, collects its shipment packages and flattens them
//! to numbered column slots (`pkg1_*`, `pkg2_*`, ...). A public tracking URL
//! is synthesized per courier from a code → template table. Package ids are
//! stashed under private `_pkg{n}_id` keys for the tracking and label
//! enrichers downstream.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
    PACKAGE_SLOTS,
};
use serde_json::{json, Map};
use tracing::debug;

use crate::for_each_batched;

const BATCH: usize = 10;
const PAUSE: Duration = Duration::from_millis(200);

/// Public tracking page per courier code.
fn tracking_url(courier_code: &str, tracking_number: &str) -> Option<String> {
    let template = match courier_code {
        "dpd" => "https://tracktrace.dpd.com.pl/parcelDetails?typ=1&parcels={nr}",
        "inpost" => "https://inpost.pl/sledzenie-przesylek?number={nr}",
        "dhl" => "https://www.dhl.com/pl-pl/home/tracking.html?tracking-id={nr}",
        "gls" => "https://gls-group.eu/PL/pl/sledzenie-paczek?match={nr}",
        "ups" => "https://www.ups.com/track?tracknum={nr}",
        "fedex" => "https://www.fedex.com/fedextrack/?trknbr={nr}",
        "pocztapolska" => "https://emonitoring.poczta-polska.pl/?numer={nr}",
        _ => return None,
    };
    Some(template.replace("{nr}", tracking_number))
}

pub struct ShipmentsEnricher;

fn fill_slot(record: &mut Record, n: usize, package: &Value) {
    let courier = package
        .get("courier_code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let number = package
        .get("tracking_number")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let url = tracking_url(&courier, &number).unwrap_or_default();

    value::set_if_absent(record, &format!("pkg{n}_courier_code"), courier.into());
    value::set_if_absent(record, &format!("pkg{n}_tracking_number"), number.into());
    value::set_if_absent(record, &format!("pkg{n}_tracking_url"), url.into());
    if let Some(id) = package.get("package_id").and_then(value::as_i64) {
        record.insert(format!("_pkg{n}_id"), id.into());
        if let Some(courier) = package.get("courier_code") {
            record.insert(format!("_pkg{n}_courier"), courier.clone());
        }
    }
}

fn fill_empty_slots(record: &mut Record) {
    for n in 1..=PACKAGE_SLOTS {
        value::set_if_absent(record, &format!("pkg{n}_courier_code"), json!(""));
        value::set_if_absent(record, &format!("pkg{n}_tracking_number"), json!(""));
        value::set_if_absent(record, &format!("pkg{n}_tracking_url"), json!(""));
    }
}

#[async_trait]
impl Enricher for ShipmentsEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Packages
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
        debug!(parents = order_ids.len(), "fetching shipment packages");

        let results = for_each_batched(&order_ids, BATCH, PAUSE, ctx.cancel, |order_id| {
            let order_id = *order_id;
            async move {
                let mut params = Map::new();
                params.insert("order_id".into(), order_id.into());
                ctx.api.call("getOrderPackages", Value::Object(params)).await
            }
        })
        .await?;

        let mut by_parent: HashMap<i64, Vec<Value>> = HashMap::new();
        for (order_id, result) in results {
            match result {
                Ok(body) => {
                    let packages = body
                        .get("packages")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    by_parent.insert(order_id, packages);
                }
                Err(e) => report.warn(format!("packages: order {order_id}: {e}")),
            }
        }

        for record in records.iter_mut() {
            let Some(order_id) = record.get("order_id").and_then(value::as_i64) else {
                continue;
            };
            if let Some(packages) = by_parent.get(&order_id) {
                for (i, package) in packages.iter().take(PACKAGE_SLOTS).enumerate() {
                    fill_slot(record, i + 1, package);
                }
            }
            // absent shipments and failed lookups both read as empty cells
            fill_empty_slots(record);
        }
        Ok(report)
    }
}
