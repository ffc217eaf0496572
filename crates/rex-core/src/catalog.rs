//! Dataset & capability catalog.
//!
//! Static description of every dataset the engine can export: field keys,
//! display labels, semantic types, and which enrichment fills each computed
//! field. Loaded once at process start and treated as immutable thereafter.
//!
//! The catalog also owns the capability derivation: given a dataset and the
//! user's selected fields, [`Catalog::required_enrichments`] returns the
//! smallest ordered set of enrichers needed to populate them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Semantic type of a field; drives formatting in the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Currency,
    Date,
    DateTime,
    Boolean,
    Array,
    Object,
    Custom,
    Empty,
}

/// Named augmentation step. A selected field tagged with one of these pulls
/// the matching enricher into the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enrichment {
    Packages,
    Documents,
    Inventory,
    Stock,
    Prices,
    Tracking,
    Labels,
    Payments,
    Credit,
    Currency,
}

impl Enrichment {
    /// Enrichers that must run before this one.
    ///
    /// Tracking and label lookups key by the package ids the shipment
    /// enricher flattens into the record, so they declare it explicitly
    /// instead of relying on field-selection order.
    pub fn prerequisites(self) -> &'static [Enrichment] {
        match self {
            Enrichment::Tracking | Enrichment::Labels => &[Enrichment::Packages],
            _ => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Enrichment::Packages => "packages",
            Enrichment::Documents => "documents",
            Enrichment::Inventory => "inventory",
            Enrichment::Stock => "stock",
            Enrichment::Prices => "prices",
            Enrichment::Tracking => "tracking",
            Enrichment::Labels => "labels",
            Enrichment::Payments => "payments",
            Enrichment::Credit => "credit",
            Enrichment::Currency => "currency",
        }
    }
}

impl std::fmt::Display for Enrichment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared field of a dataset.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub key: String,
    pub label: String,
    pub ftype: FieldType,
    /// Filled by synthesis rules or an enricher rather than the fetcher.
    pub computed: bool,
    /// Which enricher populates this field, if any.
    pub enrichment: Option<Enrichment>,
}

/// Ordered group of fields, mirroring how the configurator presents them.
#[derive(Debug, Clone)]
pub struct FieldGroup {
    pub label: String,
    pub fields: Vec<FieldDef>,
}

/// A dynamic-key family like `stock_warehouse_<id>`: any selected key with
/// this prefix is valid, typed as `ftype`, filled by `enrichment`.
#[derive(Debug, Clone)]
pub struct ExtraPrefix {
    pub prefix: String,
    pub ftype: FieldType,
    pub enrichment: Option<Enrichment>,
}

/// A declared shape of primary records.
#[derive(Debug, Clone)]
pub struct DatasetDef {
    pub id: String,
    pub groups: Vec<FieldGroup>,
    pub extra_prefixes: Vec<ExtraPrefix>,
}

impl DatasetDef {
    /// Look up a declared field by key.
    pub fn field(&self, key: &str) -> Option<&FieldDef> {
        self.fields().find(|f| f.key == key)
    }

    /// All declared fields in group order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.groups.iter().flat_map(|g| g.fields.iter())
    }

    /// Match a selected key against the dataset's extra-field families.
    pub fn extra(&self, key: &str) -> Option<&ExtraPrefix> {
        self.extra_prefixes.iter().find(|p| key.starts_with(&p.prefix))
    }

    /// Keys of every currency-typed field the currency enricher converts.
    /// `converted_*` outputs are excluded so re-running the enricher stays a
    /// no-op.
    pub fn monetary_keys(&self) -> Vec<&str> {
        self.fields()
            .filter(|f| f.ftype == FieldType::Currency && !f.key.starts_with("converted_"))
            .map(|f| f.key.as_str())
            .collect()
    }
}

/// The whole catalog: dataset id → definition.
#[derive(Debug)]
pub struct Catalog {
    datasets: HashMap<String, DatasetDef>,
}

impl Catalog {
    /// Build the built-in catalog. Call once at startup and share.
    pub fn builtin() -> Self {
        let mut datasets = HashMap::new();
        for ds in [orders(), order_items(), returns(), products(), invoices()] {
            datasets.insert(ds.id.clone(), ds);
        }
        Self { datasets }
    }

    pub fn dataset(&self, id: &str) -> Option<&DatasetDef> {
        self.datasets.get(id)
    }

    pub fn dataset_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.datasets.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Derive the ordered, deduplicated set of enrichers a run needs.
    ///
    /// Walks the selected fields in order; each field's enrichment tag is
    /// inserted after its prerequisites, first occurrence wins. The currency
    /// enricher is appended when the configuration requests conversion.
    pub fn required_enrichments(
        &self,
        dataset: &str,
        selected: &[String],
        wants_currency: bool,
    ) -> Result<Vec<Enrichment>, EngineError> {
        let ds = self
            .dataset(dataset)
            .ok_or_else(|| EngineError::Configuration(format!("unknown dataset '{dataset}'")))?;

        let mut out: Vec<Enrichment> = Vec::new();
        let mut push = |out: &mut Vec<Enrichment>, tag: Enrichment| {
            if !out.contains(&tag) {
                out.push(tag);
            }
        };

        for key in selected {
            let tag = ds
                .field(key)
                .and_then(|f| f.enrichment)
                .or_else(|| ds.extra(key).and_then(|p| p.enrichment));
            if let Some(tag) = tag {
                for dep in tag.prerequisites() {
                    push(&mut out, *dep);
                }
                push(&mut out, tag);
            }
        }

        if wants_currency && !out.contains(&Enrichment::Currency) {
            out.push(Enrichment::Currency);
        }
        Ok(out)
    }
}

/// How many shipment slots are flattened onto a record.
pub const PACKAGE_SLOTS: usize = 3;

/// How many fiscal-document slots are flattened onto a record.
pub const DOCUMENT_SLOTS: usize = 2;

fn f(key: &str, label: &str, ftype: FieldType) -> FieldDef {
    FieldDef {
        key: key.to_string(),
        label: label.to_string(),
        ftype,
        computed: false,
        enrichment: None,
    }
}

impl FieldDef {
    fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    fn via(mut self, tag: Enrichment) -> Self {
        self.enrichment = Some(tag);
        self.computed = true;
        self
    }
}

fn group(label: &str, fields: Vec<FieldDef>) -> FieldGroup {
    FieldGroup {
        label: label.to_string(),
        fields,
    }
}

fn extra(prefix: &str, ftype: FieldType, enrichment: Option<Enrichment>) -> ExtraPrefix {
    ExtraPrefix {
        prefix: prefix.to_string(),
        ftype,
        enrichment,
    }
}

/// Append a `converted_*` twin for every currency-typed field, plus the
/// conversion bookkeeping columns.
fn with_converted_group(mut groups: Vec<FieldGroup>) -> Vec<FieldGroup> {
    use FieldType::*;
    let mut fields = vec![
        f("converted_currency", "Converted currency", Text).via(Enrichment::Currency),
        f("converted_rate", "Conversion rate", Number).via(Enrichment::Currency),
        f("converted_rate_date", "Conversion rate date", Date).via(Enrichment::Currency),
    ];
    let monetary: Vec<(String, String)> = groups
        .iter()
        .flat_map(|g| g.fields.iter())
        .filter(|fd| fd.ftype == Currency)
        .map(|fd| (fd.key.clone(), fd.label.clone()))
        .collect();
    for (key, label) in monetary {
        fields.push(
            f(
                &format!("converted_{key}"),
                &format!("{label} (converted)"),
                Currency,
            )
            .via(Enrichment::Currency),
        );
    }
    groups.push(group("Currency conversion", fields));
    groups
}

fn order_core_groups() -> Vec<FieldGroup> {
    use Enrichment as E;
    use FieldType::*;

    let mut groups = vec![
        group(
            "Order",
            vec![
                f("order_id", "Order ID", Number),
                f("shop_order_id", "Shop order ID", Number),
                f("date_add", "Date added", DateTime),
                f("date_confirmed", "Date confirmed", DateTime),
                f("date_shipped", "Date shipped", DateTime),
                f("order_source", "Order source", Text),
                f("order_source_id", "Order source ID", Number),
                f("status_id", "Status ID", Number),
                f("order_status_name", "Order status", Text).computed(),
                f("currency", "Currency", Text),
                f("payment_method", "Payment method", Text),
                f("payment_method_cod", "Cash on delivery", Boolean),
                f("payment_done", "Payment done", Currency),
                f("payment_status", "Payment status", Text).computed(),
                f("user_login", "Buyer login", Text),
                f("email", "E-mail", Text),
                f("phone", "Phone", Text),
                f("user_comments", "Buyer comments", Text),
                f("admin_comments", "Seller comments", Text),
                f("want_invoice", "Invoice requested", Boolean),
            ],
        ),
        group(
            "Delivery",
            vec![
                f("delivery_method", "Delivery method", Text),
                f("delivery_price", "Delivery price", Currency),
                f("delivery_price_netto", "Delivery price (net)", Currency).computed(),
                f("delivery_fullname", "Recipient", Text),
                f("delivery_company", "Recipient company", Text),
                f("delivery_address", "Delivery address", Text),
                f("delivery_city", "Delivery city", Text),
                f("delivery_postcode", "Delivery postcode", Text),
                f("delivery_country_code", "Delivery country", Text),
                f("delivery_point_name", "Pickup point", Text),
                f("courier_code", "Courier code", Text),
                f("courier_name", "Courier", Text).computed(),
                f("warehouse_id", "Warehouse ID", Number),
                f("warehouse_name", "Warehouse", Text).computed(),
            ],
        ),
        group(
            "Invoice data",
            vec![
                f("invoice_fullname", "Invoice name", Text),
                f("invoice_company", "Invoice company", Text),
                f("invoice_nip", "Tax number", Text),
                f("invoice_address", "Invoice address", Text),
                f("invoice_city", "Invoice city", Text),
                f("invoice_postcode", "Invoice postcode", Text),
                f("invoice_country_code", "Invoice country", Text),
            ],
        ),
        group(
            "Products",
            vec![
                f("products", "Products", Array),
                f("products_count", "Product lines", Number).computed(),
                f("products_quantity", "Total quantity", Number).computed(),
                f("products_value_brutto", "Products value (gross)", Currency).computed(),
                f("products_value_netto", "Products value (net)", Currency).computed(),
                f("order_value_brutto", "Order value (gross)", Currency).computed(),
                f("order_value_netto", "Order value (net)", Currency).computed(),
            ],
        ),
    ];

    let mut shipment_fields = Vec::new();
    for n in 1..=PACKAGE_SLOTS {
        shipment_fields.extend([
            f(&format!("pkg{n}_courier_code"), &format!("Package {n} courier code"), Text)
                .via(E::Packages),
            f(&format!("pkg{n}_tracking_number"), &format!("Package {n} tracking number"), Text)
                .via(E::Packages),
            f(&format!("pkg{n}_tracking_url"), &format!("Package {n} tracking URL"), Text)
                .via(E::Packages),
            f(&format!("pkg{n}_tracking_status"), &format!("Package {n} status"), Text)
                .via(E::Tracking),
            f(
                &format!("pkg{n}_tracking_status_date"),
                &format!("Package {n} status date"),
                DateTime,
            )
            .via(E::Tracking),
            f(&format!("pkg{n}_tracking_events"), &format!("Package {n} events"), Number)
                .via(E::Tracking),
            f(&format!("pkg{n}_has_label"), &format!("Package {n} label ready"), Boolean)
                .via(E::Labels),
            f(&format!("pkg{n}_label_url"), &format!("Package {n} label URL"), Text).via(E::Labels),
            f(&format!("pkg{n}_has_protocol"), &format!("Package {n} protocol ready"), Boolean)
                .via(E::Labels),
            f(&format!("pkg{n}_protocol_url"), &format!("Package {n} protocol URL"), Text)
                .via(E::Labels),
        ]);
    }
    groups.push(group("Shipments", shipment_fields));

    let mut document_fields = Vec::new();
    for n in 1..=DOCUMENT_SLOTS {
        document_fields.extend([
            f(&format!("ds{n}_number"), &format!("Document {n} number"), Text).via(E::Documents),
            f(&format!("ds{n}_type"), &format!("Document {n} type"), Text).via(E::Documents),
            f(&format!("ds{n}_date"), &format!("Document {n} date"), Date).via(E::Documents),
            f(&format!("ds{n}_total_brutto"), &format!("Document {n} total (gross)"), Currency)
                .via(E::Documents),
        ]);
    }
    groups.push(group("Sales documents", document_fields));

    groups.push(group(
        "Payments",
        vec![
            f("last_payment_date", "Last payment date", DateTime).via(E::Payments),
            f("last_payment_amount", "Last payment amount", Currency).via(E::Payments),
            f("payments_sum", "Payments sum", Currency).via(E::Payments),
            f("payments_count", "Payments count", Number).via(E::Payments),
        ],
    ));

    groups.push(group(
        "Contractor",
        vec![
            f("debt_current", "Current debt", Currency).via(E::Credit),
            f("debt_overdue", "Overdue debt", Currency).via(E::Credit),
            f("credit_available", "Available credit", Currency).via(E::Credit),
            f("contractor_orders_count", "Contractor orders", Number).via(E::Credit),
            f("contractor_orders_sum", "Contractor orders sum", Currency).via(E::Credit),
        ],
    ));

    groups
}

fn orders() -> DatasetDef {
    DatasetDef {
        id: "orders".to_string(),
        groups: with_converted_group(order_core_groups()),
        extra_prefixes: vec![extra("extra_field_", FieldType::Text, None)],
    }
}

fn order_items() -> DatasetDef {
    use Enrichment as E;
    use FieldType::*;

    let mut groups = order_core_groups();
    groups.push(group(
        "Order line",
        vec![
            f("item_product_id", "Product ID", Number),
            f("item_variant_id", "Variant ID", Number),
            f("item_name", "Product name", Text),
            f("item_sku", "SKU", Text),
            f("item_ean", "EAN", Text),
            f("item_location", "Storage location", Text),
            f("item_price_brutto", "Unit price (gross)", Currency),
            f("item_price_netto", "Unit price (net)", Currency).computed(),
            f("item_tax_rate", "VAT rate", Number),
            f("item_quantity", "Quantity", Number),
            f("item_weight", "Weight", Number),
            f("product_avg_cost", "Average cost", Currency).via(E::Inventory),
            f("unit_margin", "Unit margin", Currency).via(E::Inventory),
            f("margin_percent", "Margin %", Number).via(E::Inventory),
        ],
    ));

    DatasetDef {
        id: "order_items".to_string(),
        groups: with_converted_group(groups),
        extra_prefixes: vec![extra("extra_field_", FieldType::Text, None)],
    }
}

fn returns() -> DatasetDef {
    use FieldType::*;

    DatasetDef {
        id: "returns".to_string(),
        groups: with_converted_group(vec![group(
            "Return",
            vec![
                f("return_id", "Return ID", Number),
                f("order_id", "Order ID", Number),
                f("date_add", "Date added", DateTime),
                f("status_id", "Status ID", Number),
                f("reason", "Return reason", Text),
                f("email", "E-mail", Text),
                f("fullname", "Customer", Text),
                f("currency", "Currency", Text),
                f("refund_total", "Refund total", Currency),
                f("products", "Products", Array),
            ],
        )]),
        extra_prefixes: vec![],
    }
}

fn products() -> DatasetDef {
    use Enrichment as E;
    use FieldType::*;

    DatasetDef {
        id: "products".to_string(),
        groups: vec![group(
            "Product",
            vec![
                f("product_id", "Product ID", Number),
                f("inventory_id", "Inventory ID", Number),
                f("name", "Name", Text),
                f("sku", "SKU", Text),
                f("ean", "EAN", Text),
                f("tax_rate", "VAT rate", Number),
                f("weight", "Weight", Number),
                f("average_cost", "Average cost", Currency).via(E::Inventory),
                f("stock_total", "Total stock", Number).via(E::Stock),
            ],
        )],
        extra_prefixes: vec![
            extra("stock_warehouse_", FieldType::Number, Some(E::Stock)),
            extra("price_group_", FieldType::Currency, Some(E::Prices)),
        ],
    }
}

fn invoices() -> DatasetDef {
    use FieldType::*;

    DatasetDef {
        id: "invoices".to_string(),
        groups: with_converted_group(vec![group(
            "Invoice",
            vec![
                f("invoice_id", "Invoice ID", Number),
                f("invoice_number", "Invoice number", Text),
                f("order_id", "Order ID", Number),
                f("date_add", "Date issued", DateTime),
                f("date_sell", "Sell date", Date),
                f("currency", "Currency", Text),
                f("total_price_brutto", "Total (gross)", Currency),
                f("total_price_netto", "Total (net)", Currency),
                f("invoice_fullname", "Invoice name", Text),
                f("invoice_company", "Invoice company", Text),
                f("invoice_nip", "Tax number", Text),
                f("invoice_country_code", "Invoice country", Text),
            ],
        )]),
        extra_prefixes: vec![],
    }
}

/// Dictionary maps fetched once per run and consumed by the transformer's
/// synthesis rules. The transformer itself never performs I/O.
#[derive(Debug, Clone, Default)]
pub struct Dictionaries {
    pub statuses: HashMap<i64, String>,
    pub couriers: HashMap<String, String>,
    pub warehouses: HashMap<i64, String>,
}
