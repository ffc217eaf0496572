//! Label enricher.
//!
//! Two upstream calls per shipment package, label and pickup protocol, each
//! tolerated as absent. Exposes a ready flag plus a URL per document.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, Record, Value,
    PACKAGE_SLOTS,
};
use serde_json::Map;

use crate::for_each_batched;

const BATCH: usize = 10;
const PAUSE: Duration = Duration::from_millis(100);

pub struct LabelsEnricher;

#[derive(Debug, Clone, Default)]
struct LabelInfo {
    label_url: String,
    protocol_url: String,
}

async fn document_url(
    ctx: &EnrichContext<'_>,
    method: &str,
    package_id: i64,
) -> Option<String> {
    let mut params = Map::new();
    params.insert("package_id".into(), package_id.into());
    // absence (or any upstream refusal) simply reads as "not ready"
    let body = ctx.api.call(method, Value::Object(params)).await.ok()?;
    body.get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl Enricher for LabelsEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Labels
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let report = EnrichReport::default();

        let mut package_ids: Vec<i64> = Vec::new();
        for record in records.iter() {
            for n in 1..=PACKAGE_SLOTS {
                if let Some(id) = record.get(&format!("_pkg{n}_id")).and_then(value::as_i64) {
                    package_ids.push(id);
                }
            }
        }
        package_ids.sort_unstable();
        package_ids.dedup();
        if package_ids.is_empty() {
            return Ok(report);
        }

        let results = for_each_batched(&package_ids, BATCH, PAUSE, ctx.cancel, |id| {
            let id = *id;
            async move {
                let label = document_url(ctx, "getLabel", id).await;
                let protocol = document_url(ctx, "getProtocol", id).await;
                let mut info = Map::new();
                info.insert("label".into(), label.unwrap_or_default().into());
                info.insert("protocol".into(), protocol.unwrap_or_default().into());
                Ok(Value::Object(info))
            }
        })
        .await?;

        let infos: HashMap<i64, LabelInfo> = results
            .into_iter()
            .filter_map(|(id, result)| {
                let body = result.ok()?;
                Some((
                    id,
                    LabelInfo {
                        label_url: body.get("label")?.as_str()?.to_string(),
                        protocol_url: body.get("protocol")?.as_str()?.to_string(),
                    },
                ))
            })
            .collect();

        for record in records.iter_mut() {
            for n in 1..=PACKAGE_SLOTS {
                let Some(id) = record.get(&format!("_pkg{n}_id")).and_then(value::as_i64) else {
                    continue;
                };
                let info = infos.get(&id).cloned().unwrap_or_default();
                value::set_if_absent(
                    record,
                    &format!("pkg{n}_has_label"),
                    (!info.label_url.is_empty()).into(),
                );
                value::set_if_absent(record, &format!("pkg{n}_label_url"), info.label_url.into());
                value::set_if_absent(
                    record,
                    &format!("pkg{n}_has_protocol"),
                    (!info.protocol_url.is_empty()).into(),
                );
                value::set_if_absent(
                    record,
                    &format!("pkg{n}_protocol_url"),
                    info.protocol_url.into(),
                );
            }
        }
        Ok(report)
    }
}
