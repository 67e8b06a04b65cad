//! Maps this month's spend against the cap to the tier that should serve
//! traffic. Re-evaluated on every call; nothing is cached.

use crate::models::{MonthlySpending, SpendingCap, Tier};
use crate::services::spending_ledger::SpendingLedger;
use rust_decimal::Decimal;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    /// Percentage of cap at which `standard` takes over.
    pub standard_pct: Decimal,
    /// Percentage of cap at which `fallback` takes over.
    pub fallback_pct: Decimal,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            standard_pct: Decimal::from(85),
            fallback_pct: Decimal::ONE_HUNDRED,
        }
    }
}

/// Pure tier decision. Without a cap (`percentage == None`) the answer is
/// always `premium`.
pub fn select_tier_for(
    is_over_cap: bool,
    percentage: Option<Decimal>,
    thresholds: &TierThresholds,
) -> Tier {
    if is_over_cap {
        return Tier::Fallback;
    }
    match percentage {
        Some(pct) if pct >= thresholds.fallback_pct => Tier::Fallback,
        Some(pct) if pct >= thresholds.standard_pct => Tier::Standard,
        _ => Tier::Premium,
    }
}

/// Tier for this month's totals, decided on the exact percentage.
pub fn tier_for_month(
    month: &MonthlySpending,
    cap: Option<&SpendingCap>,
    thresholds: &TierThresholds,
) -> Tier {
    select_tier_for(
        month.is_over_cap(cap),
        month.percentage_of_cap(cap),
        thresholds,
    )
}

#[derive(Clone)]
pub struct TierSelector {
    ledger: SpendingLedger,
    thresholds: TierThresholds,
}

impl TierSelector {
    pub fn new(ledger: SpendingLedger, thresholds: TierThresholds) -> Self {
        Self { ledger, thresholds }
    }

    /// Never fails: when the ledger cannot be read the answer is `premium`.
    #[instrument(skip(self))]
    pub async fn select_tier(&self, force: Option<Tier>) -> Tier {
        if let Some(tier) = force {
            return tier;
        }

        let (cap, month) = match self.ledger.budget_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_storage_unavailable() => {
                debug!(error = %e, "Spending ledger not ready, defaulting to premium");
                return Tier::Premium;
            }
            Err(e) => {
                error!(error = %e, "Failed to read spending ledger, defaulting to premium");
                return Tier::Premium;
            }
        };

        let tier = tier_for_month(&month, cap.as_ref(), &self.thresholds);
        debug!(tier = %tier, spent = %month.total_cost, "Tier selected");
        tier
    }
}
