//! Exchange-rate service.
//!
//! The provider quotes every currency against one pivot (mid rates). Cross
//! rates between two non-pivot currencies are computed from two independent
//! lookups sharing the same date. Lookups go through an in-memory cache
//! keyed by `(currency, date)` with a 24 h TTL; on a cache miss the service
//! probes the exact date, walks backwards up to seven days across
//! non-trading days, and finally falls back to the provider's most recent
//! quote.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rex_core::{EngineError, RateQuote, RateQuoter};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_EVERY: Duration = Duration::from_secs(60 * 60);
const MAX_BACKWARD_DAYS: u32 = 7;

/// Default pivot: the provider quotes everything against it.
pub const DEFAULT_PIVOT: &str = "PLN";

/// Raw quote lookup against the pivot currency.
///
/// `Ok(None)` means the provider has no quote for that day (weekend or
/// holiday); it is not an error.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn rate_on(
        &self,
        currency: &str,
        date: NaiveDate,
    ) -> Result<Option<RateQuote>, EngineError>;

    async fn latest(&self, currency: &str) -> Result<Option<RateQuote>, EngineError>;
}

#[derive(Debug, Deserialize)]
struct RateEnvelope {
    rates: Vec<RateRow>,
}

#[derive(Debug, Deserialize)]
struct RateRow {
    mid: f64,
    #[serde(rename = "effectiveDate")]
    effective_date: NaiveDate,
}

/// HTTP rate provider speaking the central-bank table API.
pub struct HttpRateProvider {
    http: reqwest::Client,
    base: String,
}

impl HttpRateProvider {
    pub fn new(base: impl Into<String>) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base: base.into(),
        })
    }

    async fn fetch(&self, url: String) -> Result<Option<RateQuote>, EngineError> {
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        // 404 means "no quote for this day"
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::UpstreamServer(response.status().as_u16()));
        }
        let envelope: RateEnvelope = response
            .json()
            .await
            .map_err(|e| EngineError::Transport(format!("decode rate response: {e}")))?;
        Ok(envelope.rates.first().map(|r| RateQuote {
            rate: r.mid,
            effective_date: r.effective_date,
        }))
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn rate_on(
        &self,
        currency: &str,
        date: NaiveDate,
    ) -> Result<Option<RateQuote>, EngineError> {
        self.fetch(format!("{}/rates/{}/{}", self.base, currency, date))
            .await
    }

    async fn latest(&self, currency: &str) -> Result<Option<RateQuote>, EngineError> {
        self.fetch(format!("{}/rates/{}/latest", self.base, currency))
            .await
    }
}

struct CacheEntry {
    quote: RateQuote,
    inserted: Instant,
}

/// Caching rate service; one instance is shared process-wide.
pub struct RateService {
    provider: Box<dyn RateProvider>,
    pivot: String,
    cache: Mutex<HashMap<(String, NaiveDate), CacheEntry>>,
    last_sweep: Mutex<Instant>,
}

impl RateService {
    pub fn new(provider: Box<dyn RateProvider>, pivot: impl Into<String>) -> Self {
        Self {
            provider,
            pivot: pivot.into(),
            cache: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Rate of `currency` against the pivot, keyed in the cache by the
    /// requested date even when the effective date walked backwards.
    async fn lookup(&self, currency: &str, date: NaiveDate) -> Result<RateQuote, EngineError> {
        self.maybe_sweep();

        let key = (currency.to_string(), date);
        {
            let cache = self.cache.lock().expect("rate cache poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.inserted.elapsed() < CACHE_TTL {
                    return Ok(entry.quote);
                }
            }
        }

        let quote = self.probe(currency, date).await?;
        // concurrent writers for the same key are idempotent; last one wins
        self.cache.lock().expect("rate cache poisoned").insert(
            key,
            CacheEntry {
                quote,
                inserted: Instant::now(),
            },
        );
        Ok(quote)
    }

    async fn probe(&self, currency: &str, date: NaiveDate) -> Result<RateQuote, EngineError> {
        let mut probe = date;
        for step in 0..=MAX_BACKWARD_DAYS {
            if let Some(quote) = self.provider.rate_on(currency, probe).await? {
                if step > 0 {
                    debug!(currency, %date, effective = %quote.effective_date,
                        "no quote on requested date, walked backwards");
                }
                return Ok(quote);
            }
            probe = probe
                .pred_opt()
                .ok_or_else(|| EngineError::RateUnavailable {
                    currency: currency.to_string(),
                    date,
                })?;
        }

        info!(currency, %date, "no quote within walk-back range, using most recent");
        match self.provider.latest(currency).await? {
            Some(quote) => Ok(quote),
            None => Err(EngineError::RateUnavailable {
                currency: currency.to_string(),
                date,
            }),
        }
    }

    fn maybe_sweep(&self) {
        let mut last = self.last_sweep.lock().expect("sweep clock poisoned");
        if last.elapsed() < SWEEP_EVERY {
            return;
        }
        *last = Instant::now();
        let mut cache = self.cache.lock().expect("rate cache poisoned");
        let before = cache.len();
        cache.retain(|_, entry| entry.inserted.elapsed() < CACHE_TTL);
        debug!(evicted = before - cache.len(), "rate cache sweep");
    }
}

#[async_trait]
impl RateQuoter for RateService {
    async fn rate(
        &self,
        source: &str,
        target: &str,
        date: NaiveDate,
    ) -> Result<RateQuote, EngineError> {
        if source == target {
            return Ok(RateQuote {
                rate: 1.0,
                effective_date: date,
            });
        }
        if target == self.pivot {
            return self.lookup(source, date).await;
        }
        if source == self.pivot {
            let quote = self.lookup(target, date).await?;
            return Ok(RateQuote {
                rate: 1.0 / quote.rate,
                effective_date: quote.effective_date,
            });
        }
        // two independent lookups sharing the same date
        let src = self.lookup(source, date).await?;
        let tgt = self.lookup(target, date).await?;
        Ok(RateQuote {
            rate: src.rate / tgt.rate,
            effective_date: src.effective_date.min(tgt.effective_date),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Provider quoting weekdays only, counting calls.
    struct WeekdayProvider {
        calls: Arc<AtomicUsize>,
    }

    impl WeekdayProvider {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn rate_for(currency: &str) -> f64 {
            match currency {
                "EUR" => 4.32,
                "USD" => 3.95,
                _ => 1.0,
            }
        }
    }

    #[async_trait]
    impl RateProvider for WeekdayProvider {
        async fn rate_on(
            &self,
            currency: &str,
            date: NaiveDate,
        ) -> Result<Option<RateQuote>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            use chrono::Datelike;
            if date.weekday().number_from_monday() > 5 {
                return Ok(None);
            }
            Ok(Some(RateQuote {
                rate: Self::rate_for(currency),
                effective_date: date,
            }))
        }

        async fn latest(&self, currency: &str) -> Result<Option<RateQuote>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(RateQuote {
                rate: Self::rate_for(currency),
                effective_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            }))
        }
    }

    fn service() -> RateService {
        RateService::new(Box::new(WeekdayProvider::new()), DEFAULT_PIVOT)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn identity_rate_is_one() {
        let svc = service();
        let q = svc.rate("PLN", "PLN", date(2024, 1, 8)).await.unwrap();
        assert_eq!(q.rate, 1.0);
        assert_eq!(q.effective_date, date(2024, 1, 8));
    }

    #[tokio::test]
    async fn pivot_target_is_a_single_lookup() {
        let svc = service();
        let q = svc.rate("EUR", "PLN", date(2024, 1, 8)).await.unwrap();
        assert_eq!(q.rate, 4.32);
    }

    #[tokio::test]
    async fn pivot_source_inverts() {
        let svc = service();
        let q = svc.rate("PLN", "EUR", date(2024, 1, 8)).await.unwrap();
        assert!((q.rate - 1.0 / 4.32).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cross_rate_divides_two_lookups() {
        let svc = service();
        let q = svc.rate("EUR", "USD", date(2024, 1, 8)).await.unwrap();
        assert!((q.rate - 4.32 / 3.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn saturday_walks_back_to_friday() {
        let svc = service();
        // 2024-01-06 is a Saturday
        let q = svc.rate("EUR", "PLN", date(2024, 1, 6)).await.unwrap();
        assert_eq!(q.effective_date, date(2024, 1, 5));
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_hits_cache() {
        let provider = WeekdayProvider::new();
        let calls = provider.calls.clone();
        let svc = RateService::new(Box::new(provider), DEFAULT_PIVOT);
        svc.rate("EUR", "PLN", date(2024, 1, 8)).await.unwrap();
        svc.rate("EUR", "PLN", date(2024, 1, 8)).await.unwrap();
        // one provider call total
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
