//! # REX I/O - Upstream Client, Rate Service, and Fetchers
//!
//! This crate provides the network-facing implementations of the export
//! engine: the upstream commerce API client with its token-scoped rate
//! budget, the caching exchange-rate service, one paginated fetcher per
//! dataset, and a development sheet writer.
//!
//! ## Fetchers
//!
//! - **orders** / **order_items**: `getOrders`, last-id cursor; items are
//!   expanded one record per product line
//! - **returns**: `getOrderReturns`, last-id cursor
//! - **products**: `getInventoryProductsList`, numeric pages
//! - **invoices**: `getInvoices`, date watermark
//!
//! All fetchers share the `fetch_all_pages` helper, which enforces the
//! record ceiling and cancellation between pages.

/// Sliding-window rate budget, shared per token
pub mod budget;

/// Upstream API client with retry and error classification
pub mod client;

/// Dictionary loading for transformer synthesis
pub mod dicts;

/// Pagination helper and filter translation
pub mod fetch;

/// Invoice listing fetcher
pub mod fetch_invoices;

/// Orders and order-items fetchers
pub mod fetch_orders;

/// Products fetcher
pub mod fetch_products;

/// Returns fetcher
pub mod fetch_returns;

/// Caching exchange-rate service
pub mod rates;

/// Stdout sheet writer for development
pub mod writer_stdout;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::HashMap;
use std::sync::Arc;

use rex_core::Fetcher;

pub use budget::{BudgetRegistry, RateBudget};
pub use client::UpstreamClient;
pub use rates::{HttpRateProvider, RateProvider, RateService, DEFAULT_PIVOT};

/// Dataset id → fetcher. The dispatcher resolves fetchers here.
pub struct FetcherRegistry {
    map: HashMap<&'static str, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new(fetchers: Vec<Arc<dyn Fetcher>>) -> Self {
        Self {
            map: fetchers.into_iter().map(|f| (f.dataset(), f)).collect(),
        }
    }

    /// Registry with every built-in fetcher.
    pub fn builtin() -> Self {
        Self::new(vec![
            Arc::new(fetch_orders::OrdersFetcher),
            Arc::new(fetch_orders::OrderItemsFetcher),
            Arc::new(fetch_returns::ReturnsFetcher),
            Arc::new(fetch_products::ProductsFetcher),
            Arc::new(fetch_invoices::InvoicesFetcher),
        ])
    }

    pub fn get(&self, dataset: &str) -> Option<Arc<dyn Fetcher>> {
        self.map.get(dataset).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_every_catalog_dataset() {
        let registry = FetcherRegistry::builtin();
        let catalog = rex_core::Catalog::builtin();
        for id in catalog.dataset_ids() {
            assert!(registry.get(id).is_some(), "no fetcher for {id}");
        }
    }
}
