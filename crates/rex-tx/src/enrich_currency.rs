//! Currency enricher.
//!
//! Collects the unique `(source currency, anchor date)` pairs across the
//! record set, queries the exchange-rate service once per pair, and applies
//! the rate to every monetary field under a `converted_` twin key, rounded
//! to two decimals. Records whose currency already equals the target are
//! left alone. When no rate can be produced the enricher degrades to a unit
//! rate and records a warning against the run.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rex_core::{
    value, EngineError, EnrichContext, EnrichReport, Enricher, Enrichment, RateAnchor, RateQuote,
    Record, Value,
};
use tracing::debug;

pub struct CurrencyEnricher;

fn date_of(v: &Value) -> Option<NaiveDate> {
    if let Some(ts) = value::as_i64(v) {
        // epoch seconds
        return DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.date_naive());
    }
    let s = v.as_str()?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// The date a record's monetary values are converted at.
fn anchor_date(record: &Record, anchor: RateAnchor, today: NaiveDate) -> NaiveDate {
    let field = match anchor {
        RateAnchor::DocumentDate => record.get("ds1_date").filter(|v| !v.is_null()),
        RateAnchor::OrderDate => record.get("date_add"),
        RateAnchor::ShipDate => record.get("date_shipped").filter(|v| !v.is_null()),
        RateAnchor::Today => None,
    };
    field
        .and_then(date_of)
        .or_else(|| record.get("date_add").and_then(date_of))
        .unwrap_or(today)
}

fn source_currency(record: &Record) -> Option<String> {
    record
        .get("currency")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_uppercase)
}

#[async_trait]
impl Enricher for CurrencyEnricher {
    fn tag(&self) -> Enrichment {
        Enrichment::Currency
    }

    async fn enrich(
        &self,
        records: &mut [Record],
        ctx: &EnrichContext<'_>,
    ) -> Result<EnrichReport, EngineError> {
        let mut report = EnrichReport::default();
        let Some(conversion) = &ctx.config.currency_conversion else {
            return Ok(report);
        };
        let target = conversion.target_currency.to_uppercase();
        let today = Utc::now().date_naive();

        let monetary: Vec<String> = ctx
            .catalog
            .dataset(&ctx.config.dataset)
            .map(|ds| ds.monetary_keys().iter().map(|k| k.to_string()).collect())
            .unwrap_or_default();

        // one lookup per unique (currency, anchor date) pair
        let mut pairs: Vec<(String, NaiveDate)> = Vec::new();
        for record in records.iter() {
            let Some(source) = source_currency(record) else { continue };
            if source == target {
                continue;
            }
            let date = anchor_date(record, conversion.rate_source, today);
            if !pairs.contains(&(source.clone(), date)) {
                pairs.push((source, date));
            }
        }
        debug!(pairs = pairs.len(), target = %target, "resolving conversion rates");

        let mut quotes: HashMap<(String, NaiveDate), RateQuote> = HashMap::new();
        for (source, date) in &pairs {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            let quote = match ctx.rates.rate(source, &target, *date).await {
                Ok(quote) => quote,
                Err(e) => {
                    report.warn(format!("currency: {source} on {date}: {e}"));
                    RateQuote {
                        rate: 1.0,
                        effective_date: *date,
                    }
                }
            };
            quotes.insert((source.clone(), *date), quote);
        }

        for record in records.iter_mut() {
            let Some(source) = source_currency(record) else { continue };
            if source == target {
                continue;
            }
            let date = anchor_date(record, conversion.rate_source, today);
            let Some(quote) = quotes.get(&(source, date)) else { continue };

            value::set_if_absent(record, "converted_currency", target.clone().into());
            value::set_if_absent(record, "converted_rate", value::num(quote.rate));
            value::set_if_absent(
                record,
                "converted_rate_date",
                quote.effective_date.format("%Y-%m-%d").to_string().into(),
            );
            for key in &monetary {
                let Some(amount) = record.get(key.as_str()).and_then(value::as_f64) else {
                    continue;
                };
                value::set_if_absent(
                    record,
                    &format!("converted_{key}"),
                    value::num(value::round2(amount * quote.rate)),
                );
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{orders_config, FixedRates, TestCtx};
    use rex_core::CurrencyConversion;
    use serde_json::json;

    fn eur_record(order_value: f64) -> Record {
        let mut r = Record::new();
        r.insert("order_id".into(), json!(1));
        r.insert("currency".into(), json!("EUR"));
        r.insert("date_add".into(), json!(1704534000)); // 2024-01-06
        r.insert("order_value_brutto".into(), json!(order_value));
        r
    }

    fn converting_config() -> rex_core::ExportConfig {
        let mut config = orders_config();
        config.currency_conversion = Some(CurrencyConversion {
            target_currency: "PLN".to_string(),
            rate_source: RateAnchor::OrderDate,
        });
        config
    }

    #[tokio::test]
    async fn converts_monetary_fields_at_the_anchor_rate() {
        let mut tc = TestCtx::new(converting_config());
        tc.rates = FixedRates::at(4.5);
        let mut records = vec![eur_record(10.0)];
        CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(records[0]["converted_currency"], json!("PLN"));
        assert_eq!(records[0]["converted_order_value_brutto"], json!(45.0));
        assert_eq!(records[0]["converted_rate_date"], json!("2024-01-06"));
    }

    #[tokio::test]
    async fn weekend_anchor_reports_the_walked_back_date() {
        let mut tc = TestCtx::new(converting_config());
        tc.rates = FixedRates::at(4.5);
        tc.rates.effective = Some(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        let mut records = vec![eur_record(10.0)];
        CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(records[0]["converted_rate_date"], json!("2024-01-05"));
    }

    #[tokio::test]
    async fn same_currency_is_a_no_op() {
        let tc = TestCtx::new(converting_config());
        let mut record = eur_record(10.0);
        record.insert("currency".into(), json!("PLN"));
        let mut records = vec![record];
        CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert!(!records[0].contains_key("converted_currency"));
        assert_eq!(tc.rates.call_count(), 0);
    }

    #[tokio::test]
    async fn one_rate_lookup_per_unique_pair() {
        let mut tc = TestCtx::new(converting_config());
        tc.rates = FixedRates::at(4.5);
        let mut records = vec![eur_record(10.0), eur_record(20.0)];
        CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(tc.rates.call_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_rate_degrades_to_unit_with_warning() {
        let mut tc = TestCtx::new(converting_config());
        tc.rates = FixedRates::unavailable();
        let mut records = vec![eur_record(10.0)];
        let report = CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(records[0]["converted_rate"], json!(1.0));
        assert_eq!(records[0]["converted_order_value_brutto"], json!(10.0));
        assert_eq!(records[0]["converted_rate_date"], json!("2024-01-06"));
    }

    #[tokio::test]
    async fn second_application_is_a_no_op() {
        let mut tc = TestCtx::new(converting_config());
        tc.rates = FixedRates::at(4.5);
        let mut records = vec![eur_record(10.0)];
        CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        let snapshot = records.clone();

        tc.rates = FixedRates::at(9.9); // a different rate must not land
        CurrencyEnricher.enrich(&mut records, &tc.ctx()).await.unwrap();
        assert_eq!(records, snapshot);
    }
}
