//! Re-notification rule.
//!
//! An offer is surfaced when it is first seen at or below the threshold, when
//! it crosses the threshold from above, or when a qualifying price drops
//! strictly below the last recorded one.

use rust_decimal::Decimal;

use crate::watch::models::OfferRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Never seen before and qualifying.
    New,
    /// Previously recorded above the threshold, now qualifying.
    PriceDrop { previous: Decimal },
    /// Previously qualifying, now strictly cheaper.
    FurtherDrop { previous: Decimal },
    /// Previously qualifying at this price or lower.
    AlreadyNotified,
    /// Above the threshold; recorded, never surfaced.
    AboveThreshold,
}

impl Decision {
    pub fn should_notify(&self) -> bool {
        matches!(self, Self::New | Self::PriceDrop { .. } | Self::FurtherDrop { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PriceDrop { .. } => "price_drop",
            Self::FurtherDrop { .. } => "further_drop",
            Self::AlreadyNotified => "already_notified",
            Self::AboveThreshold => "above_threshold",
        }
    }
}

/// Decide from the record as it was before this sighting's upsert.
pub fn decide(previous: Option<&OfferRecord>, price: Decimal, threshold: Decimal) -> Decision {
    if price > threshold {
        return Decision::AboveThreshold;
    }

    match previous {
        None => Decision::New,
        Some(prev) if prev.price_pln > threshold => Decision::PriceDrop {
            previous: prev.price_pln,
        },
        Some(prev) if price < prev.price_pln => Decision::FurtherDrop {
            previous: prev.price_pln,
        },
        Some(_) => Decision::AlreadyNotified,
    }
}
