//! Output transformer.
//!
//! Maps enriched records to ordered output rows. Columns derive from the
//! configuration's selected field keys against the dataset map; each column
//! carries a semantic type with one formatting function per type. Synthetic
//! `_empty_*` placeholders become blank columns, `_custom_*` keys resolve to
//! template columns, and unknown keys fall back to best-effort text columns
//! with the key echoed as the header.
//!
//! The transformer never performs I/O and never fails on user data;
//! malformed values are coerced to strings.

use chrono::{DateTime, Utc};
use regex::Regex;
use rex_core::{
    value, Catalog, Dictionaries, EngineError, ExportConfig, FieldType, Formatting, Record, Value,
};
use tracing::warn;

/// Default VAT rate applied when a line carries none.
const DEFAULT_VAT: f64 = 23.0;

/// Finished output of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
enum ColumnKind {
    Field(FieldType),
    Blank,
    Template(String),
    /// Key not found anywhere; echoed verbatim as a text column.
    Unknown,
}

#[derive(Debug, Clone)]
struct Column {
    key: String,
    label: String,
    kind: ColumnKind,
}

#[derive(Debug)]
pub struct Transformer {
    columns: Vec<Column>,
    formatting: Formatting,
    synthesize: bool,
    dicts: Dictionaries,
    template_re: Regex,
}

impl Transformer {
    pub fn from_config(
        catalog: &Catalog,
        config: &ExportConfig,
        dicts: Dictionaries,
    ) -> Result<Self, EngineError> {
        let dataset = catalog.dataset(&config.dataset).ok_or_else(|| {
            EngineError::Configuration(format!("unknown dataset '{}'", config.dataset))
        })?;

        let mut columns = Vec::with_capacity(config.selected_fields.len());
        for key in &config.selected_fields {
            let (kind, default_label) = if key.starts_with("_empty_") {
                (ColumnKind::Blank, String::new())
            } else if key.starts_with("_custom_") {
                match config.custom_fields.get(key) {
                    Some(custom) => (
                        ColumnKind::Template(custom.template.clone()),
                        custom.label.clone(),
                    ),
                    None => {
                        warn!(key = %key, "custom column without a definition");
                        (ColumnKind::Unknown, key.clone())
                    }
                }
            } else if let Some(field) = dataset.field(key) {
                (ColumnKind::Field(field.ftype), field.label.clone())
            } else if let Some(extra) = dataset.extra(key) {
                (ColumnKind::Field(extra.ftype), key.clone())
            } else {
                warn!(key = %key, dataset = %config.dataset, "unknown field key, emitting as text");
                (ColumnKind::Unknown, key.clone())
            };

            let label = config
                .custom_headers
                .get(key)
                .cloned()
                .unwrap_or(default_label);
            columns.push(Column {
                key: key.clone(),
                label,
                kind,
            });
        }

        Ok(Self {
            columns,
            formatting: config.formatting.clone(),
            synthesize: matches!(config.dataset.as_str(), "orders" | "order_items"),
            dicts,
            template_re: Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("template pattern compiles"),
        })
    }

    /// Shape records into `(headers, rows)`. Deterministic for fixed inputs.
    pub fn transform(&self, records: &[Record]) -> Table {
        if self.columns.is_empty() {
            return Table {
                headers: Vec::new(),
                rows: Vec::new(),
            };
        }

        let headers: Vec<String> = self.columns.iter().map(|c| c.label.clone()).collect();
        let rows = records
            .iter()
            .map(|record| {
                let record = if self.synthesize {
                    let mut r = record.clone();
                    synthesize_order_fields(&mut r, &self.dicts);
                    r
                } else {
                    record.clone()
                };
                self.columns.iter().map(|c| self.cell(&record, c)).collect()
            })
            .collect();

        Table { headers, rows }
    }

    fn cell(&self, record: &Record, column: &Column) -> String {
        match &column.kind {
            ColumnKind::Blank => String::new(),
            ColumnKind::Template(template) => self.render_template(template, record),
            ColumnKind::Unknown => self.format_value(value::get_path(record, &column.key), FieldType::Text),
            ColumnKind::Field(ftype) => {
                self.format_value(value::get_path(record, &column.key), *ftype)
            }
        }
    }

    /// Substitute every `{fieldKey}` occurrence with the record's value.
    /// Literal substitution only; missing keys become empty strings.
    fn render_template(&self, template: &str, record: &Record) -> String {
        self.template_re
            .replace_all(template, |caps: &regex::Captures<'_>| {
                value::get_path(record, &caps[1]).map(plain).unwrap_or_default()
            })
            .into_owned()
    }

    fn format_value(&self, v: Option<&Value>, ftype: FieldType) -> String {
        let Some(v) = v.filter(|v| !v.is_null()) else {
            return self.formatting.null_marker.clone();
        };
        match ftype {
            FieldType::DateTime => fmt_timestamp(v, "%Y-%m-%d %H:%M:%S"),
            FieldType::Date => fmt_timestamp(v, "%Y-%m-%d"),
            FieldType::Number => match value::as_f64(v) {
                Some(x) => fmt_number(x, self.formatting.decimal_places),
                None => coerce(v),
            },
            FieldType::Currency => match value::as_f64(v) {
                Some(x) => format!("{x:.2}"),
                None => coerce(v),
            },
            FieldType::Boolean => match truthiness(v) {
                Some(true) => self.formatting.bool_true.clone(),
                Some(false) => self.formatting.bool_false.clone(),
                None => coerce(v),
            },
            FieldType::Array => match v {
                Value::Array(items) => fmt_array(items),
                other => coerce(other),
            },
            FieldType::Object => serde_json::to_string(v).unwrap_or_default(),
            FieldType::Text | FieldType::Custom | FieldType::Empty => plain(v),
        }
    }
}

/// Scalars verbatim, compounds JSON-encoded.
fn plain(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Malformed value for the declared type: keep the data, lose the shape.
fn coerce(v: &Value) -> String {
    warn!(value = %v, "value does not match its declared type, coercing to text");
    plain(v)
}

/// Epoch seconds (≤ 10^10), epoch milliseconds, or a parseable string.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(n) = value::as_i64(v) {
        return if n <= 10_000_000_000 {
            DateTime::<Utc>::from_timestamp(n, 0)
        } else {
            DateTime::<Utc>::from_timestamp_millis(n)
        };
    }
    let s = v.as_str()?.trim();
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, pattern) {
            return Some(dt.and_utc());
        }
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn fmt_timestamp(v: &Value, pattern: &str) -> String {
    match parse_timestamp(v) {
        Some(dt) => dt.format(pattern).to_string(),
        None => coerce(v),
    }
}

fn fmt_number(x: f64, decimals: u32) -> String {
    let rendered = format!("{:.*}", decimals as usize, x);
    if rendered.contains('.') {
        rendered
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        rendered
    }
}

fn truthiness(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn fmt_array(items: &[Value]) -> String {
    items
        .iter()
        .map(|v| match v {
            Value::Array(_) | Value::Object(_) => serde_json::to_string(v).unwrap_or_default(),
            scalar => plain(scalar),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Synthesized computed fields for the orders datasets: status and
/// dictionary names, payment status, and value sums over the line items.
/// Everything goes through `set_if_absent`, so fetched or enriched values
/// win.
fn synthesize_order_fields(record: &mut Record, dicts: &Dictionaries) {
    let lines = record
        .get("products")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut gross = 0.0;
    let mut net = 0.0;
    let mut quantity = 0.0;
    for line in &lines {
        let price = line.get("price_brutto").and_then(value::as_f64).unwrap_or(0.0);
        let qty = line.get("quantity").and_then(value::as_f64).unwrap_or(0.0);
        let vat = line
            .get("tax_rate")
            .and_then(value::as_f64)
            .unwrap_or(DEFAULT_VAT);
        gross += price * qty;
        net += price / (1.0 + vat / 100.0) * qty;
        quantity += qty;
    }

    value::set_if_absent(record, "products_count", (lines.len() as i64).into());
    value::set_if_absent(record, "products_quantity", value::num(quantity));
    value::set_if_absent(record, "products_value_brutto", value::num(value::round2(gross)));
    value::set_if_absent(record, "products_value_netto", value::num(value::round2(net)));

    let delivery = record
        .get("delivery_price")
        .and_then(value::as_f64)
        .unwrap_or(0.0);
    let delivery_net = delivery / (1.0 + DEFAULT_VAT / 100.0);
    value::set_if_absent(
        record,
        "delivery_price_netto",
        value::num(value::round2(delivery_net)),
    );
    value::set_if_absent(
        record,
        "order_value_brutto",
        value::num(value::round2(gross + delivery)),
    );
    value::set_if_absent(
        record,
        "order_value_netto",
        value::num(value::round2(net + delivery_net)),
    );

    let paid = record
        .get("payment_done")
        .and_then(value::as_f64)
        .unwrap_or(0.0);
    let total = gross + delivery;
    let payment_status = if total > 0.0 && paid + 0.005 >= total {
        "paid"
    } else if paid > 0.0 {
        "partial"
    } else {
        "unpaid"
    };
    value::set_if_absent(record, "payment_status", payment_status.into());

    if let Some(status_id) = record.get("status_id").and_then(value::as_i64) {
        if let Some(name) = dicts.statuses.get(&status_id) {
            value::set_if_absent(record, "order_status_name", name.clone().into());
        }
    }
    if let Some(code) = record.get("courier_code").and_then(Value::as_str) {
        if let Some(name) = dicts.couriers.get(code) {
            value::set_if_absent(record, "courier_name", name.clone().into());
        }
    }
    if let Some(warehouse_id) = record.get("warehouse_id").and_then(value::as_i64) {
        if let Some(name) = dicts.warehouses.get(&warehouse_id) {
            value::set_if_absent(record, "warehouse_name", name.clone().into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::orders_config;
    use rex_core::CustomField;
    use serde_json::json;

    fn record(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn transformer(config: &ExportConfig) -> Transformer {
        Transformer::from_config(&Catalog::builtin(), config, Dictionaries::default()).unwrap()
    }

    #[test]
    fn minimal_orders_run_formats_rows() {
        let mut config = orders_config();
        config.selected_fields = vec![
            "order_id".to_string(),
            "date_add".to_string(),
            "email".to_string(),
        ];
        for key in &config.selected_fields {
            config.custom_headers.insert(key.clone(), key.clone());
        }
        let t = transformer(&config);
        let records = vec![
            record(json!({"order_id": 101, "date_add": 1705312800, "email": "a@x"})),
            record(json!({"order_id": 102, "date_add": 1705316400, "email": "b@x"})),
        ];
        let table = t.transform(&records);
        assert_eq!(table.headers, vec!["order_id", "date_add", "email"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["101", "2024-01-15 10:00:00", "a@x"],
                vec!["102", "2024-01-15 11:00:00", "b@x"],
            ]
        );
    }

    #[test]
    fn headers_fall_back_to_dataset_labels() {
        let mut config = orders_config();
        config.selected_fields = vec!["order_id".to_string(), "no_such_key".to_string()];
        let t = transformer(&config);
        let table = t.transform(&[]);
        assert_eq!(table.headers, vec!["Order ID", "no_such_key"]);
    }

    #[test]
    fn empty_selection_yields_empty_table_even_with_records() {
        let config = orders_config();
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"order_id": 1}))]);
        assert!(table.headers.is_empty());
        assert!(table.rows.is_empty());
    }

    #[test]
    fn every_row_matches_header_width() {
        let mut config = orders_config();
        config.selected_fields = vec![
            "order_id".to_string(),
            "_empty_1".to_string(),
            "unknown_key".to_string(),
        ];
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"order_id": 1}))]);
        for row in &table.rows {
            assert_eq!(row.len(), table.headers.len());
        }
        assert_eq!(table.rows[0][1], "");
        assert_eq!(table.rows[0][2], "");
    }

    #[test]
    fn boolean_labels_come_from_the_configuration() {
        let mut config = orders_config();
        config.selected_fields = vec!["want_invoice".to_string()];
        config.formatting.bool_true = "Y".to_string();
        config.formatting.bool_false = "N".to_string();
        let t = transformer(&config);
        let table = t.transform(&[
            record(json!({"want_invoice": 1})),
            record(json!({"want_invoice": "0"})),
        ]);
        assert_eq!(table.rows[0][0], "Y");
        assert_eq!(table.rows[1][0], "N");
    }

    #[test]
    fn default_boolean_labels_are_polish() {
        let mut config = orders_config();
        config.selected_fields = vec!["want_invoice".to_string()];
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"want_invoice": true}))]);
        assert_eq!(table.rows[0][0], "TAK");
    }

    #[test]
    fn custom_template_substitutes_field_values() {
        let mut config = orders_config();
        config.selected_fields = vec!["_custom_1".to_string()];
        config.custom_fields.insert(
            "_custom_1".to_string(),
            CustomField {
                label: "Link".to_string(),
                template: "https://panel/orders/{order_id}?src={order_source}".to_string(),
            },
        );
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"order_id": 7}))]);
        assert_eq!(table.headers, vec!["Link"]);
        // missing keys substitute as empty strings
        assert_eq!(table.rows[0][0], "https://panel/orders/7?src=");
    }

    #[test]
    fn millisecond_timestamps_are_recognized() {
        let mut config = orders_config();
        config.selected_fields = vec!["date_add".to_string()];
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"date_add": 1705312800000i64}))]);
        assert_eq!(table.rows[0][0], "2024-01-15 10:00:00");
    }

    #[test]
    fn arrays_join_and_json_encode_compounds() {
        let mut config = orders_config();
        config.selected_fields = vec!["products".to_string()];
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"products": ["a", 2, {"q": 1}]}))]);
        assert_eq!(table.rows[0][0], r#"a, 2, {"q":1}"#);
    }

    #[test]
    fn currency_is_forced_to_two_decimals() {
        let mut config = orders_config();
        config.selected_fields = vec!["delivery_price".to_string()];
        let t = transformer(&config);
        let table = t.transform(&[record(json!({"delivery_price": 12.5}))]);
        assert_eq!(table.rows[0][0], "12.50");
    }

    #[test]
    fn order_values_are_synthesized_from_lines() {
        let mut config = orders_config();
        config.selected_fields = vec![
            "products_value_brutto".to_string(),
            "order_value_brutto".to_string(),
            "products_quantity".to_string(),
            "payment_status".to_string(),
        ];
        let t = transformer(&config);
        let table = t.transform(&[record(json!({
            "delivery_price": 10.0,
            "payment_done": 34.6,
            "products": [
                {"price_brutto": 12.30, "tax_rate": 23, "quantity": 2},
            ],
        }))]);
        assert_eq!(table.rows[0][0], "24.60");
        assert_eq!(table.rows[0][1], "34.60");
        assert_eq!(table.rows[0][2], "2");
        assert_eq!(table.rows[0][3], "paid");
    }

    #[test]
    fn dictionary_names_resolve_through_synthesis() {
        let mut config = orders_config();
        config.selected_fields = vec![
            "order_status_name".to_string(),
            "courier_name".to_string(),
        ];
        let mut dicts = Dictionaries::default();
        dicts.statuses.insert(5, "Shipped".to_string());
        dicts.couriers.insert("dpd".to_string(), "DPD".to_string());
        let t = Transformer::from_config(&Catalog::builtin(), &config, dicts).unwrap();
        let table = t.transform(&[record(json!({"status_id": 5, "courier_code": "dpd"}))]);
        assert_eq!(table.rows[0], vec!["Shipped", "DPD"]);
    }

    #[test]
    fn transform_is_deterministic() {
        let mut config = orders_config();
        config.selected_fields = vec!["order_id".to_string(), "products".to_string()];
        let t = transformer(&config);
        let records = vec![record(json!({"order_id": 1, "products": [{"q": 1}]}))];
        assert_eq!(t.transform(&records), t.transform(&records));
    }

    #[test]
    fn unknown_dataset_is_a_configuration_error() {
        let mut config = orders_config();
        config.dataset = "nope".to_string();
        let err =
            Transformer::from_config(&Catalog::builtin(), &config, Dictionaries::default())
                .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
