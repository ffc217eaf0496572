//! # REX Transformations - Enrichers and the Output Transformer
//!
//! This crate holds the middle and final phases of the export pipeline:
//! the enrichers that augment fetched records with related upstream data,
//! and the transformer that shapes enriched records into ordered, formatted
//! output rows.
//!
//! ## Enrichers
//!
//! - **shipments**: per-order package lookups flattened to numbered columns
//! - **documents**: one bounded fiscal-document listing, bucketed by order
//! - **inventory**: product master data in large batches, margin math
//! - **stock** / **prices**: inventory catalog page walks
//! - **tracking** / **labels**: per-package courier lookups
//! - **payments** / **credit**: per-parent financial lookups
//! - **currency**: exchange-rate conversion of every monetary field
//!
//! Every enricher obeys the same contract: never overwrite an existing
//! non-null value, batch upstream calls with bounded parallelism, and turn
//! partial upstream failures into run warnings instead of aborting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rex_core::{EngineError, Enricher, Enrichment, Value};
use tokio_util::sync::CancellationToken;

pub mod enrich_credit;
pub mod enrich_currency;
pub mod enrich_documents;
pub mod enrich_inventory;
pub mod enrich_labels;
pub mod enrich_payments;
pub mod enrich_prices;
pub mod enrich_shipments;
pub mod enrich_stock;
pub mod enrich_tracking;
pub mod transform;

#[cfg(test)]
pub(crate) mod testutil;

pub use transform::{Table, Transformer};

/// Dispatch `call` for every key in bounded-parallel batches with a short
/// pause between full batches. Pending batches are skipped once the run is
/// canceled; individual call failures come back per key so the caller can
/// degrade just the affected records.
pub(crate) async fn for_each_batched<K, Fut>(
    keys: &[K],
    batch_size: usize,
    pause: Duration,
    cancel: &CancellationToken,
    mut call: impl FnMut(&K) -> Fut,
) -> Result<Vec<(K, Result<Value, EngineError>)>, EngineError>
where
    K: Clone,
    Fut: Future<Output = Result<Value, EngineError>>,
{
    let mut out = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(batch_size) {
        if cancel.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        let results = futures::future::join_all(chunk.iter().map(&mut call)).await;
        out.extend(chunk.iter().cloned().zip(results));
        if chunk.len() == batch_size && !pause.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Canceled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
    Ok(out)
}

/// Enrichment tag → enricher. The orchestrator resolves the tags returned
/// by the catalog here, in order.
pub struct EnricherRegistry {
    map: HashMap<Enrichment, Arc<dyn Enricher>>,
}

impl EnricherRegistry {
    pub fn new(enrichers: Vec<Arc<dyn Enricher>>) -> Self {
        Self {
            map: enrichers.into_iter().map(|e| (e.tag(), e)).collect(),
        }
    }

    pub fn builtin() -> Self {
        let enrichers: Vec<Arc<dyn Enricher>> = vec![
            Arc::new(enrich_shipments::ShipmentsEnricher),
            Arc::new(enrich_documents::DocumentsEnricher),
            Arc::new(enrich_inventory::InventoryEnricher),
            Arc::new(enrich_stock::StockEnricher),
            Arc::new(enrich_prices::PricesEnricher),
            Arc::new(enrich_tracking::TrackingEnricher),
            Arc::new(enrich_labels::LabelsEnricher),
            Arc::new(enrich_payments::PaymentsEnricher),
            Arc::new(enrich_credit::CreditEnricher),
            Arc::new(enrich_currency::CurrencyEnricher),
        ];
        Self::new(enrichers)
    }

    pub fn get(&self, tag: Enrichment) -> Option<Arc<dyn Enricher>> {
        self.map.get(&tag).cloned()
    }
}
