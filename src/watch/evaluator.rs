//! One watch run: search every (product, store) pair, filter, record, notify.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::db::store::{OfferStore, RunRecord};
use crate::error::{AdapterError, NotifyError, StoreError};
use crate::monitoring::report;
use crate::notify::{Alert, NotifierSet};
use crate::watch::decision::{decide, Decision};
use crate::watch::models::{IdentityKey, Offer, ProductWatch};

/// A search that failed; the pair is skipped for this run.
#[derive(Debug)]
pub struct AdapterFailure {
    pub product: String,
    pub store: String,
    pub error: AdapterError,
}

#[derive(Debug)]
pub struct NotifyFailure {
    pub product: String,
    pub store: String,
    pub channel: String,
    pub error: NotifyError,
}

/// An offer surfaced to the user during the run.
#[derive(Debug, Clone)]
pub struct SurfacedOffer {
    pub product: String,
    pub identity_key: IdentityKey,
    pub offer: Offer,
    pub decision: Decision,
}

/// What one (product, store) search looked like after title filtering.
#[derive(Debug, Clone)]
pub struct SearchStats {
    pub product: String,
    pub store: String,
    pub threshold: Decimal,
    pub total: usize,
    pub matching: usize,
    pub qualifying: usize,
    /// Up to three cheapest matching offers as (price, title).
    pub cheapest: Vec<(Decimal, String)>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub products: usize,
    pub adapter_calls: usize,
    pub offers_seen: usize,
    pub offers_recorded: usize,
    pub surfaced: Vec<SurfacedOffer>,
    pub adapter_failures: Vec<AdapterFailure>,
    pub notify_failures: Vec<NotifyFailure>,
    pub stats: Vec<SearchStats>,
}

impl RunSummary {
    fn new(products: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            products,
            adapter_calls: 0,
            offers_seen: 0,
            offers_recorded: 0,
            surfaced: Vec::new(),
            adapter_failures: Vec::new(),
            notify_failures: Vec::new(),
            stats: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.adapter_failures.is_empty() && self.notify_failures.is_empty()
    }

    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            id: None,
            run_id: self.run_id.to_string(),
            started_at: self.started_at.to_rfc3339(),
            duration_ms: Some(self.duration.as_millis() as i64),
            products: Some(self.products as i64),
            adapter_calls: Some(self.adapter_calls as i64),
            offers_seen: Some(self.offers_seen as i64),
            notifications_sent: Some(self.surfaced.len() as i64),
            adapter_failures: Some(self.adapter_failures.len() as i64),
            notify_failures: Some(self.notify_failures.len() as i64),
            created_at: None,
        }
    }
}

struct SearchJob {
    product: usize,
    store: String,
}

pub struct Evaluator {
    products: Vec<ProductWatch>,
    registry: AdapterRegistry,
    store: Arc<OfferStore>,
    notifiers: NotifierSet,
    search_timeout: Duration,
    max_concurrent_searches: usize,
}

impl Evaluator {
    pub fn new(
        products: Vec<ProductWatch>,
        registry: AdapterRegistry,
        store: Arc<OfferStore>,
        notifiers: NotifierSet,
        search_timeout: Duration,
        max_concurrent_searches: usize,
    ) -> Self {
        Self {
            products,
            registry,
            store,
            notifiers,
            search_timeout,
            max_concurrent_searches: max_concurrent_searches.max(1),
        }
    }

    /// Execute one complete run.
    ///
    /// Adapter and notifier failures are collected in the summary. Only an
    /// unavailable store ends the run early.
    pub async fn run_once(&self) -> Result<RunSummary, StoreError> {
        let start = Instant::now();
        let mut summary = RunSummary::new(self.products.len());
        info!(run_id = %summary.run_id, products = self.products.len(), "Starting run");

        self.registry.reset_budgets();

        let jobs = self.jobs();
        summary.adapter_calls = jobs.len();
        let results = self.search_all(&jobs).await;

        for (job, result) in jobs.iter().zip(results) {
            let watch = &self.products[job.product];
            match result {
                Ok(offers) => self.process(watch, &job.store, offers, &mut summary).await?,
                Err(error) => {
                    warn!(
                        product = %watch.name,
                        store = %job.store,
                        error = %error,
                        "Search failed, skipping store for this run"
                    );
                    summary.adapter_failures.push(AdapterFailure {
                        product: watch.name.clone(),
                        store: job.store.clone(),
                        error,
                    });
                }
            }
        }

        summary.duration = start.elapsed();
        self.store.insert_run(&summary.to_record()).await?;
        report::log_run_summary(&summary);

        Ok(summary)
    }

    fn jobs(&self) -> Vec<SearchJob> {
        self.products
            .iter()
            .enumerate()
            .flat_map(|(idx, watch)| {
                watch.stores.iter().map(move |store| SearchJob {
                    product: idx,
                    store: store.clone(),
                })
            })
            .collect()
    }

    /// Run every search on a bounded pool. Results come back in job order.
    async fn search_all(&self, jobs: &[SearchJob]) -> Vec<Result<Vec<Offer>, AdapterError>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_searches));
        let mut tasks = JoinSet::new();
        let mut results: Vec<Option<Result<Vec<Offer>, AdapterError>>> =
            jobs.iter().map(|_| None).collect();

        for (idx, job) in jobs.iter().enumerate() {
            let Some(adapter) = self.registry.get(&job.store) else {
                results[idx] = Some(Err(AdapterError::Parse(format!(
                    "no adapter registered for store {:?}",
                    job.store
                ))));
                continue;
            };
            let term = self.products[job.product].query.clone();
            let semaphore = semaphore.clone();
            let timeout = self.search_timeout;

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => match tokio::time::timeout(timeout, adapter.search(&term)).await {
                        Ok(result) => result,
                        Err(_) => Err(AdapterError::Timeout {
                            seconds: timeout.as_secs(),
                        }),
                    },
                    Err(_) => Err(AdapterError::Parse("search pool closed".to_string())),
                };
                (idx, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => error!(error = %e, "Search task panicked"),
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(AdapterError::Parse("search task aborted".to_string()))))
            .collect()
    }

    async fn process(
        &self,
        watch: &ProductWatch,
        store: &str,
        offers: Vec<Offer>,
        summary: &mut RunSummary,
    ) -> Result<(), StoreError> {
        summary.offers_seen += offers.len();
        let total = offers.len();

        // Pagination can repeat an item; keep the lowest price per identity.
        let mut by_key: BTreeMap<IdentityKey, Offer> = BTreeMap::new();
        for offer in offers.into_iter().filter(|o| watch.matches_title(&o.title)) {
            let key = offer.identity_key();
            match by_key.get(&key) {
                Some(existing) if existing.price_pln <= offer.price_pln => {}
                _ => {
                    by_key.insert(key, offer);
                }
            }
        }

        let mut ranked: Vec<(&IdentityKey, &Offer)> = by_key.iter().collect();
        ranked.sort_by(|a, b| a.1.price_pln.cmp(&b.1.price_pln).then_with(|| a.0.cmp(b.0)));

        let stats = SearchStats {
            product: watch.name.clone(),
            store: store.to_string(),
            threshold: watch.max_price_pln,
            total,
            matching: ranked.len(),
            qualifying: ranked.iter().filter(|(_, o)| watch.qualifies(o.price_pln)).count(),
            cheapest: ranked
                .iter()
                .take(3)
                .map(|(_, o)| (o.price_pln, o.title.clone()))
                .collect(),
        };
        report::log_search_stats(&stats);
        summary.stats.push(stats);

        let eligible = ranked.first().map(|(key, _)| (*key).clone());

        for (key, offer) in ranked {
            let previous = self.store.upsert(key, offer, Utc::now()).await?;
            summary.offers_recorded += 1;

            if eligible.as_ref() != Some(key) {
                continue;
            }

            let decision = decide(previous.as_ref(), offer.price_pln, watch.max_price_pln);
            if !decision.should_notify() {
                continue;
            }

            let alert = Alert {
                offer,
                watch,
                decision,
            };
            for outcome in self.notifiers.dispatch(&alert).await {
                if let Err(error) = outcome.result {
                    summary.notify_failures.push(NotifyFailure {
                        product: watch.name.clone(),
                        store: store.to_string(),
                        channel: outcome.channel,
                        error,
                    });
                }
            }
            summary.surfaced.push(SurfacedOffer {
                product: watch.name.clone(),
                identity_key: key.clone(),
                offer: offer.clone(),
                decision,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StoreAdapter;
    use crate::config::ProductConfig;
    use crate::notify::tests::RecordingNotifier;
    use crate::notify::Notifier;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Canned = Result<Vec<Offer>, AdapterError>;

    /// Replays canned responses, one per search call. Repeats the last one when exhausted.
    struct FakeAdapter {
        id: &'static str,
        responses: Mutex<VecDeque<Canned>>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FakeAdapter {
        fn new(id: &'static str, responses: Vec<Canned>) -> Self {
            Self {
                id,
                responses: Mutex::new(responses.into()),
                delay: None,
                calls: AtomicUsize::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    fn clone_canned(canned: &Canned) -> Canned {
        match canned {
            Ok(offers) => Ok(offers.clone()),
            Err(AdapterError::Timeout { seconds }) => Err(AdapterError::Timeout { seconds: *seconds }),
            Err(e) => Err(AdapterError::Parse(e.to_string())),
        }
    }

    #[async_trait]
    impl StoreAdapter for FakeAdapter {
        fn id(&self) -> &str {
            self.id
        }

        async fn search(&self, _term: &str) -> Result<Vec<Offer>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                clone_canned(responses.front().unwrap())
            }
        }
    }

    fn offer(store: &str, sku: &str, title: &str, price: Decimal) -> Offer {
        Offer {
            store: store.to_string(),
            title: title.to_string(),
            price_pln: price,
            url: format!("https://{store}.example/p/{sku}"),
            sku: Some(sku.to_string()),
        }
    }

    fn watch(stores: &[&str]) -> ProductWatch {
        ProductWatch::from_config(&ProductConfig {
            name: "RTX 4070".to_string(),
            query: None,
            pattern: Some(r"rtx\s*4070".to_string()),
            max_price_pln: dec!(3000.00),
            stores: stores.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    async fn evaluator(
        adapters: Vec<Arc<FakeAdapter>>,
        notifier: Arc<RecordingNotifier>,
        products: Vec<ProductWatch>,
    ) -> (Evaluator, Arc<OfferStore>) {
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let store = Arc::new(OfferStore::new(":memory:").await.unwrap());
        let channels: Vec<Arc<dyn Notifier>> = vec![notifier];
        let notifiers = NotifierSet::new(channels, Duration::from_secs(5));
        let evaluator = Evaluator::new(
            products,
            registry,
            store.clone(),
            notifiers,
            Duration::from_secs(1),
            4,
        );
        (evaluator, store)
    }

    #[tokio::test]
    async fn test_qualifying_offer_notifies_once_across_runs() {
        let adapter = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![Ok(vec![offer("x-kom", "A1", "MSI RTX 4070 Ventus", dec!(2899.00))])],
        ));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, _) = evaluator(vec![adapter], notifier.clone(), vec![watch(&["x-kom"])]).await;

        let first = evaluator.run_once().await.unwrap();
        assert_eq!(first.surfaced.len(), 1);
        assert_eq!(first.surfaced[0].decision, Decision::New);

        let second = evaluator.run_once().await.unwrap();
        assert!(second.surfaced.is_empty());
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_title_filter_discards_non_matching_offers() {
        let adapter = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![Ok(vec![
                offer("x-kom", "B1", "Chłodzenie do RTX 3060", dec!(99.00)),
                offer("x-kom", "B2", "Gigabyte RTX4070 Eagle", dec!(2950.00)),
            ])],
        ));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, store) =
            evaluator(vec![adapter], notifier.clone(), vec![watch(&["x-kom"])]).await;

        let summary = evaluator.run_once().await.unwrap();
        assert_eq!(summary.offers_seen, 2);
        assert_eq!(summary.offers_recorded, 1);
        assert_eq!(summary.stats[0].matching, 1);
        assert_eq!(store.all_for_store("x-kom").await.unwrap().len(), 1);
        assert_eq!(notifier.sent.lock().unwrap()[0].2, dec!(2950.00));
    }

    #[tokio::test]
    async fn test_only_cheapest_offer_per_store_notifies_but_all_are_recorded() {
        let adapter = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![Ok(vec![
                offer("x-kom", "C1", "RTX 4070 Dual", dec!(2990.00)),
                offer("x-kom", "C2", "RTX 4070 Eagle", dec!(2850.00)),
                offer("x-kom", "C3", "RTX 4070 Gaming X", dec!(3200.00)),
            ])],
        ));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, store) =
            evaluator(vec![adapter], notifier.clone(), vec![watch(&["x-kom"])]).await;

        let summary = evaluator.run_once().await.unwrap();
        assert_eq!(summary.surfaced.len(), 1);
        assert_eq!(summary.surfaced[0].offer.sku.as_deref(), Some("C2"));
        assert_eq!(summary.stats[0].qualifying, 2);
        assert_eq!(summary.stats[0].cheapest[0].0, dec!(2850.00));
        assert_eq!(store.all_for_store("x-kom").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_pagination_repeats_collapse_to_lowest_price() {
        let adapter = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![Ok(vec![
                offer("x-kom", "D1", "RTX 4070", dec!(2999.00)),
                offer("x-kom", "D1", "RTX 4070", dec!(2899.00)),
            ])],
        ));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, store) =
            evaluator(vec![adapter], notifier.clone(), vec![watch(&["x-kom"])]).await;

        evaluator.run_once().await.unwrap();
        let key = IdentityKey::from_raw("sku:x-kom:d1");
        assert_eq!(store.get(&key).await.unwrap().unwrap().price_pln, dec!(2899.00));
        assert_eq!(store.price_history(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_store_does_not_stop_others() {
        let broken = Arc::new(FakeAdapter::new(
            "rtv-euro-agd",
            vec![Err(AdapterError::UnexpectedStatus {
                status: 503,
                url: "https://rtv.example".to_string(),
            })],
        ));
        let healthy = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![Ok(vec![offer("x-kom", "E1", "RTX 4070", dec!(2700.00))])],
        ));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, _) = evaluator(
            vec![broken, healthy],
            notifier.clone(),
            vec![watch(&["rtv-euro-agd", "x-kom"])],
        )
        .await;

        let summary = evaluator.run_once().await.unwrap();
        assert_eq!(summary.adapter_failures.len(), 1);
        assert_eq!(summary.adapter_failures[0].store, "rtv-euro-agd");
        assert_eq!(notifier.count(), 1);
        assert!(!summary.is_clean());
    }

    #[tokio::test]
    async fn test_slow_search_times_out() {
        let mut slow = FakeAdapter::new("x-kom", vec![Ok(Vec::new())]);
        slow.delay = Some(Duration::from_secs(30));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, _) =
            evaluator(vec![Arc::new(slow)], notifier, vec![watch(&["x-kom"])]).await;

        let summary = evaluator.run_once().await.unwrap();
        assert!(matches!(
            summary.adapter_failures[0].error,
            AdapterError::Timeout { seconds: 1 }
        ));
    }

    #[tokio::test]
    async fn test_notify_failure_still_records_offer() {
        let adapter = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![
                Ok(vec![offer("x-kom", "F1", "RTX 4070", dec!(2800.00))]),
                Ok(vec![offer("x-kom", "F1", "RTX 4070", dec!(2800.00))]),
            ],
        ));
        let mut broken = RecordingNotifier::new("email");
        broken.fail = true;
        let (evaluator, store) =
            evaluator(vec![adapter], Arc::new(broken), vec![watch(&["x-kom"])]).await;

        let first = evaluator.run_once().await.unwrap();
        assert_eq!(first.notify_failures.len(), 1);
        assert!(store
            .get(&IdentityKey::from_raw("sku:x-kom:f1"))
            .await
            .unwrap()
            .is_some());

        // Delivery failures are not retried on the next run.
        let second = evaluator.run_once().await.unwrap();
        assert!(second.surfaced.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let peak = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let ids = ["s1", "s2", "s3", "s4", "s5", "s6"];
        let adapters: Vec<Arc<FakeAdapter>> = ids
            .iter()
            .map(|id| {
                let mut a = FakeAdapter::new(*id, vec![Ok(Vec::new())]);
                a.delay = Some(Duration::from_millis(50));
                a.in_flight = in_flight.clone();
                a.peak = peak.clone();
                Arc::new(a)
            })
            .collect();

        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(adapter);
        }
        let store = Arc::new(OfferStore::new(":memory:").await.unwrap());
        let evaluator = Evaluator::new(
            vec![watch(&ids)],
            registry,
            store,
            NotifierSet::new(Vec::new(), Duration::from_secs(1)),
            Duration::from_secs(5),
            2,
        );

        let summary = evaluator.run_once().await.unwrap();
        assert_eq!(summary.adapter_calls, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_run_is_persisted() {
        let adapter = Arc::new(FakeAdapter::new(
            "x-kom",
            vec![Ok(vec![offer("x-kom", "G1", "RTX 4070", dec!(2500.00))])],
        ));
        let notifier = Arc::new(RecordingNotifier::new("telegram"));
        let (evaluator, store) =
            evaluator(vec![adapter], notifier, vec![watch(&["x-kom"])]).await;

        let summary = evaluator.run_once().await.unwrap();
        assert!(summary.is_clean());
        let run = store.latest_run().await.unwrap().unwrap();
        assert_eq!(run.run_id, summary.run_id.to_string());
        assert_eq!(run.notifications_sent, Some(1));
        assert_eq!(run.adapter_failures, Some(0));
    }
}
