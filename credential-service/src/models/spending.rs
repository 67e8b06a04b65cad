//! Spending cap and monthly spending models.

use super::Tier;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Cost category reported by the cost-recording pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendCategory {
    Llm,
    Tts,
    Other,
}

impl SpendCategory {
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Llm),
            2 => Some(Self::Tts),
            3 => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Other => "other",
        }
    }
}

/// Budget alert level derived from the percentage of the cap spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// No cap configured.
    None,
    Ok,
    Caution,
    Warning,
    Critical,
    Danger,
}

impl AlertLevel {
    /// Thresholds: 50% caution, 75% warning, 90% critical, 100% danger.
    pub fn from_percentage(percentage: Option<Decimal>) -> Self {
        let Some(pct) = percentage else {
            return Self::None;
        };
        if pct >= Decimal::from(100) {
            Self::Danger
        } else if pct >= Decimal::from(90) {
            Self::Critical
        } else if pct >= Decimal::from(75) {
            Self::Warning
        } else if pct >= Decimal::from(50) {
            Self::Caution
        } else {
            Self::Ok
        }
    }

    pub fn to_proto(self) -> i32 {
        match self {
            Self::None => 1,
            Self::Ok => 2,
            Self::Caution => 3,
            Self::Warning => 4,
            Self::Critical => 5,
            Self::Danger => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ok => "ok",
            Self::Caution => "caution",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Danger => "danger",
        }
    }
}

/// Organisation-wide monthly spending cap. At most one is active.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SpendingCap {
    pub cap_id: Uuid,
    pub amount_usd: Decimal,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Running totals for one calendar month.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MonthlySpending {
    pub year: i32,
    pub month: i32,
    pub total_cost: Decimal,
    pub llm_cost: Decimal,
    pub tts_cost: Decimal,
    pub other_cost: Decimal,
    pub premium_cost: Decimal,
    pub standard_cost: Decimal,
    pub fallback_cost: Decimal,
    pub total_requests: i64,
    pub llm_requests: i64,
    pub tts_requests: i64,
    pub other_requests: i64,
    pub premium_requests: i64,
    pub standard_requests: i64,
    pub fallback_requests: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl MonthlySpending {
    /// A month with nothing recorded yet.
    pub fn empty(year: i32, month: i32, at: DateTime<Utc>) -> Self {
        Self {
            year,
            month,
            total_cost: Decimal::ZERO,
            llm_cost: Decimal::ZERO,
            tts_cost: Decimal::ZERO,
            other_cost: Decimal::ZERO,
            premium_cost: Decimal::ZERO,
            standard_cost: Decimal::ZERO,
            fallback_cost: Decimal::ZERO,
            total_requests: 0,
            llm_requests: 0,
            tts_requests: 0,
            other_requests: 0,
            premium_requests: 0,
            standard_requests: 0,
            fallback_requests: 0,
            created_utc: at,
            updated_utc: at,
        }
    }

    /// `total_cost / cap * 100`, or `None` without an active cap.
    pub fn percentage_of_cap(&self, cap: Option<&SpendingCap>) -> Option<Decimal> {
        let cap = cap?;
        if cap.amount_usd <= Decimal::ZERO {
            return None;
        }
        Some(self.total_cost / cap.amount_usd * Decimal::ONE_HUNDRED)
    }

    /// Strictly greater than the cap; spending exactly the cap is not over.
    pub fn is_over_cap(&self, cap: Option<&SpendingCap>) -> bool {
        cap.is_some_and(|c| self.total_cost > c.amount_usd)
    }

    pub fn alert_level(&self, cap: Option<&SpendingCap>) -> AlertLevel {
        AlertLevel::from_percentage(self.percentage_of_cap(cap))
    }
}

/// Counter increments produced by one cost event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpendDelta {
    pub total_cost: Decimal,
    pub llm_cost: Decimal,
    pub tts_cost: Decimal,
    pub other_cost: Decimal,
    pub premium_cost: Decimal,
    pub standard_cost: Decimal,
    pub fallback_cost: Decimal,
    pub llm_requests: i64,
    pub tts_requests: i64,
    pub other_requests: i64,
    pub premium_requests: i64,
    pub standard_requests: i64,
    pub fallback_requests: i64,
}

impl SpendDelta {
    /// Route an amount to its category sub-total; LLM spend is further
    /// attributed to the tier it was served from.
    pub fn for_event(amount: Decimal, category: SpendCategory, tier: Option<Tier>) -> Self {
        let mut delta = Self {
            total_cost: amount,
            ..Self::default()
        };

        match category {
            SpendCategory::Llm => {
                delta.llm_cost = amount;
                delta.llm_requests = 1;
                match tier {
                    Some(Tier::Premium) => {
                        delta.premium_cost = amount;
                        delta.premium_requests = 1;
                    }
                    Some(Tier::Standard) => {
                        delta.standard_cost = amount;
                        delta.standard_requests = 1;
                    }
                    Some(Tier::Fallback) => {
                        delta.fallback_cost = amount;
                        delta.fallback_requests = 1;
                    }
                    None => {}
                }
            }
            SpendCategory::Tts => {
                delta.tts_cost = amount;
                delta.tts_requests = 1;
            }
            SpendCategory::Other => {
                delta.other_cost = amount;
                delta.other_requests = 1;
            }
        }

        delta
    }
}

/// Read model answering "how much of the budget is left".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapStatus {
    pub has_cap: bool,
    pub cap_amount: Option<Decimal>,
    pub spent: Decimal,
    pub remaining: Option<Decimal>,
    pub percentage: Option<Decimal>,
    pub alert_level: AlertLevel,
    pub is_over_cap: bool,
}

impl CapStatus {
    /// `percentage` is rounded to cents for display. Decisions use
    /// [`MonthlySpending::percentage_of_cap`] directly.
    pub fn compute(month: &MonthlySpending, cap: Option<&SpendingCap>) -> Self {
        match cap {
            None => Self {
                has_cap: false,
                cap_amount: None,
                spent: month.total_cost,
                remaining: None,
                percentage: None,
                alert_level: AlertLevel::None,
                is_over_cap: false,
            },
            Some(cap) => {
                let percentage = month.percentage_of_cap(Some(cap)).map(|p| p.round_dp(2));
                Self {
                    has_cap: true,
                    cap_amount: Some(cap.amount_usd),
                    spent: month.total_cost,
                    remaining: Some((cap.amount_usd - month.total_cost).max(Decimal::ZERO)),
                    percentage,
                    alert_level: month.alert_level(Some(cap)),
                    is_over_cap: month.is_over_cap(Some(cap)),
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{cap, month};
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_percentage_requires_cap() {
        let m = month(dec!(42));
        assert_eq!(m.percentage_of_cap(None), None);
        assert!(!m.is_over_cap(None));
        assert_eq!(m.alert_level(None), AlertLevel::None);
    }

    #[test]
    fn test_percentage_of_cap() {
        let m = month(dec!(42.5));
        assert_eq!(m.percentage_of_cap(Some(&cap(dec!(50)))), Some(dec!(85)));
    }

    #[test]
    fn test_exactly_at_cap_is_not_over() {
        let c = cap(dec!(50));
        assert!(!month(dec!(50)).is_over_cap(Some(&c)));
        assert!(month(dec!(50.000001)).is_over_cap(Some(&c)));
    }

    #[test]
    fn test_alert_level_thresholds() {
        let level = |pct: Decimal| AlertLevel::from_percentage(Some(pct));
        assert_eq!(level(dec!(0)), AlertLevel::Ok);
        assert_eq!(level(dec!(49.99)), AlertLevel::Ok);
        assert_eq!(level(dec!(50)), AlertLevel::Caution);
        assert_eq!(level(dec!(75)), AlertLevel::Warning);
        assert_eq!(level(dec!(89.9)), AlertLevel::Warning);
        assert_eq!(level(dec!(90)), AlertLevel::Critical);
        assert_eq!(level(dec!(100)), AlertLevel::Danger);
        assert_eq!(level(dec!(250)), AlertLevel::Danger);
    }

    #[test]
    fn test_llm_delta_is_attributed_to_tier() {
        let delta = SpendDelta::for_event(dec!(1.25), SpendCategory::Llm, Some(Tier::Standard));
        assert_eq!(delta.total_cost, dec!(1.25));
        assert_eq!(delta.llm_cost, dec!(1.25));
        assert_eq!(delta.standard_cost, dec!(1.25));
        assert_eq!(delta.standard_requests, 1);
        assert_eq!(delta.premium_cost, Decimal::ZERO);
        assert_eq!(delta.tts_requests, 0);
    }

    #[test]
    fn test_non_llm_delta_ignores_tier() {
        let delta = SpendDelta::for_event(dec!(0.30), SpendCategory::Tts, Some(Tier::Premium));
        assert_eq!(delta.tts_cost, dec!(0.30));
        assert_eq!(delta.tts_requests, 1);
        assert_eq!(delta.premium_cost, Decimal::ZERO);
        assert_eq!(delta.premium_requests, 0);
        assert_eq!(delta.llm_requests, 0);
    }

    #[test]
    fn test_cap_status_without_cap() {
        let status = CapStatus::compute(&month(dec!(100)), None);
        assert!(!status.has_cap);
        assert_eq!(status.spent, dec!(100));
        assert_eq!(status.remaining, None);
        assert_eq!(status.alert_level, AlertLevel::None);
        assert!(!status.is_over_cap);
    }

    #[test]
    fn test_cap_status_over_cap_clamps_remaining() {
        let status = CapStatus::compute(&month(dec!(60)), Some(&cap(dec!(50))));
        assert!(status.has_cap);
        assert_eq!(status.remaining, Some(Decimal::ZERO));
        assert_eq!(status.percentage, Some(dec!(120)));
        assert_eq!(status.alert_level, AlertLevel::Danger);
        assert!(status.is_over_cap);
    }
}
