//! Export configuration: the read-only input describing one export.
//!
//! Configurations are created and mutated outside the engine; the engine
//! only reads them. They deserialize from the service's YAML file or from
//! whatever store the embedding application uses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Stable identifier of this configuration.
    pub id: String,

    /// Owning tenant.
    pub tenant_id: String,

    /// Upstream API token of the tenant. The rate budget is scoped to it.
    #[serde(default)]
    pub api_token: String,

    /// Dataset identifier; must name a catalog entry.
    pub dataset: String,

    /// Ordered selected field keys. May contain `_empty_*` placeholders and
    /// `_custom_*` template columns.
    #[serde(default)]
    pub selected_fields: Vec<String>,

    /// Filter map handed to the fetcher. Unknown keys are ignored there.
    #[serde(default)]
    pub filters: HashMap<String, Value>,

    /// Per-field display label overrides.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    /// Custom template columns, keyed by their `_custom_*` field key.
    #[serde(default)]
    pub custom_fields: HashMap<String, CustomField>,

    /// When present, the currency enricher is implicitly required.
    #[serde(default)]
    pub currency_conversion: Option<CurrencyConversion>,

    /// Zero means streaming intent (manual triggers only), otherwise the
    /// scheduler interval in minutes.
    #[serde(default)]
    pub schedule_minutes: u32,

    /// Opaque destination descriptor understood by the spreadsheet writer.
    pub destination: String,

    #[serde(default)]
    pub write_mode: WriteMode,

    /// Output formatting knobs for the transformer.
    #[serde(default)]
    pub formatting: Formatting,

    /// Inactive configurations are skipped by the scheduler.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// A `_custom_*` column: display label plus a `{field_key}` template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomField {
    pub label: String,
    pub template: String,
}

/// Currency conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyConversion {
    /// Currency every monetary field is converted into.
    pub target_currency: String,

    /// Which date each record's value is converted at.
    #[serde(default)]
    pub rate_source: RateAnchor,
}

/// Anchor-date choice for currency conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAnchor {
    /// Fiscal document date, falling back to the order date.
    DocumentDate,
    #[default]
    OrderDate,
    /// Shipment date, falling back to the order date.
    ShipDate,
    /// The day the run executes.
    Today,
}

/// How rows are delivered to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Append,
    Overwrite,
}

/// Transformer output knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formatting {
    /// Cell content for missing values.
    #[serde(default)]
    pub null_marker: String,

    /// Decimal places for `number` columns.
    #[serde(default = "default_decimals")]
    pub decimal_places: u32,

    /// Label emitted for truthy boolean cells.
    #[serde(default = "default_bool_true")]
    pub bool_true: String,

    /// Label emitted for falsy boolean cells.
    #[serde(default = "default_bool_false")]
    pub bool_false: String,
}

impl Default for Formatting {
    fn default() -> Self {
        Self {
            null_marker: String::new(),
            decimal_places: default_decimals(),
            bool_true: default_bool_true(),
            bool_false: default_bool_false(),
        }
    }
}

fn default_decimals() -> u32 {
    2
}

fn default_bool_true() -> String {
    "TAK".to_string()
}

fn default_bool_false() -> String {
    "NIE".to_string()
}

fn default_true() -> bool {
    true
}

impl ExportConfig {
    /// Whether this run converts currencies.
    pub fn wants_currency(&self) -> bool {
        self.currency_conversion.is_some()
    }
}
