//! Run reporting through structured log events.

use tracing::{info, warn};

use crate::watch::evaluator::{RunSummary, SearchStats};

/// Per (product, store) counts and the three cheapest matching titles.
pub fn log_search_stats(stats: &SearchStats) {
    let cheapest: Vec<String> = stats
        .cheapest
        .iter()
        .map(|(price, title)| format!("{price} PLN {title}"))
        .collect();

    info!(
        product = %stats.product,
        store = %stats.store,
        threshold = %stats.threshold,
        total = stats.total,
        matching = stats.matching,
        qualifying = stats.qualifying,
        cheapest = ?cheapest,
        "Search results"
    );
}

pub fn log_run_summary(summary: &RunSummary) {
    for failure in &summary.adapter_failures {
        warn!(
            run_id = %summary.run_id,
            product = %failure.product,
            store = %failure.store,
            error = %failure.error,
            "Adapter failure"
        );
    }
    for failure in &summary.notify_failures {
        warn!(
            run_id = %summary.run_id,
            product = %failure.product,
            store = %failure.store,
            channel = %failure.channel,
            error = %failure.error,
            "Notification failure"
        );
    }
    for surfaced in &summary.surfaced {
        info!(
            run_id = %summary.run_id,
            product = %surfaced.product,
            store = %surfaced.offer.store,
            price = %surfaced.offer.price_pln,
            decision = surfaced.decision.label(),
            url = %surfaced.offer.url,
            "Offer surfaced"
        );
    }

    info!(
        run_id = %summary.run_id,
        duration_ms = summary.duration.as_millis() as u64,
        products = summary.products,
        adapter_calls = summary.adapter_calls,
        offers_seen = summary.offers_seen,
        offers_recorded = summary.offers_recorded,
        surfaced = summary.surfaced.len(),
        adapter_failures = summary.adapter_failures.len(),
        notify_failures = summary.notify_failures.len(),
        clean = summary.is_clean(),
        "Run complete"
    );
}
