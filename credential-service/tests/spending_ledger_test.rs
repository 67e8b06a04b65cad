//! Spending ledger, spending cap and tier selection integration tests.
//!
//! Run with: ./scripts/integ-tests.sh -p credential-service

mod common;

use common::spawn_services;
use credential_service::models::{AlertLevel, SpendCategory, Tier};
use credential_service::services::ServiceError;
use rust_decimal_macros::dec;

#[tokio::test]
#[ignore] // Requires database - run with integ-tests.sh
async fn empty_month_reads_as_zero() {
    let services = spawn_services().await;

    let month = services.ledger.current_month().await.unwrap();
    assert_eq!(month.total_cost, dec!(0));
    assert_eq!(month.total_requests, 0);

    let status = services.ledger.cap_status().await.unwrap();
    assert!(!status.has_cap);
    assert_eq!(status.alert_level, AlertLevel::None);
    assert!(status.percentage.is_none());
    assert!(!status.is_over_cap);
}

#[tokio::test]
#[ignore]
async fn record_spend_accumulates_by_category_and_tier() {
    let services = spawn_services().await;

    services
        .ledger
        .record_spend(dec!(1.25), SpendCategory::Llm, Some(Tier::Premium))
        .await
        .unwrap();
    services
        .ledger
        .record_spend(dec!(0.75), SpendCategory::Llm, Some(Tier::Fallback))
        .await
        .unwrap();
    services
        .ledger
        .record_spend(dec!(0.50), SpendCategory::Tts, None)
        .await
        .unwrap();
    // Tier is ignored outside LLM spend
    let month = services
        .ledger
        .record_spend(dec!(0.10), SpendCategory::Other, Some(Tier::Standard))
        .await
        .unwrap();

    assert_eq!(month.total_cost, dec!(2.60));
    assert_eq!(month.llm_cost, dec!(2.00));
    assert_eq!(month.tts_cost, dec!(0.50));
    assert_eq!(month.other_cost, dec!(0.10));
    assert_eq!(month.premium_cost, dec!(1.25));
    assert_eq!(month.standard_cost, dec!(0));
    assert_eq!(month.fallback_cost, dec!(0.75));

    assert_eq!(month.total_requests, 4);
    assert_eq!(month.llm_requests, 2);
    assert_eq!(month.tts_requests, 1);
    assert_eq!(month.other_requests, 1);
    assert_eq!(month.premium_requests, 1);
    assert_eq!(month.standard_requests, 0);
    assert_eq!(month.fallback_requests, 1);

    let history = services.ledger.history(None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].total_cost, dec!(2.60));
}

#[tokio::test]
#[ignore]
async fn concurrent_spend_is_not_lost() {
    let services = spawn_services().await;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let ledger = services.ledger.clone();
            tokio::spawn(async move {
                ledger
                    .record_spend(dec!(0.01), SpendCategory::Llm, Some(Tier::Standard))
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().expect("Spend should be recorded");
    }

    let month = services.ledger.current_month().await.unwrap();
    assert_eq!(month.total_cost, dec!(0.20));
    assert_eq!(month.total_requests, 20);
    assert_eq!(month.standard_requests, 20);
}

#[tokio::test]
#[ignore]
async fn negative_spend_is_rejected() {
    let services = spawn_services().await;

    let err = services
        .ledger
        .record_spend(dec!(-1), SpendCategory::Llm, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let month = services.ledger.current_month().await.unwrap();
    assert_eq!(month.total_requests, 0);
}

#[tokio::test]
#[ignore]
async fn set_cap_replaces_previous_cap() {
    let services = spawn_services().await;

    let first = services.ledger.set_cap(dec!(100), None).await.unwrap();
    let second = services.ledger.set_cap(dec!(250.555), None).await.unwrap();

    assert!(second.is_active);
    assert_eq!(second.amount_usd, dec!(250.56));

    let active = services.ledger.active_cap().await.unwrap().unwrap();
    assert_eq!(active.cap_id, second.cap_id);
    assert_ne!(active.cap_id, first.cap_id);
}

#[tokio::test]
#[ignore]
async fn set_cap_rejects_non_positive_amount() {
    let services = spawn_services().await;

    for amount in [dec!(0), dec!(-5)] {
        let err = services.ledger.set_cap(amount, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
    assert!(services.ledger.active_cap().await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn set_cap_rejects_amount_rounding_to_zero() {
    let services = spawn_services().await;

    let err = services.ledger.set_cap(dec!(0.004), None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let cap = services.ledger.set_cap(dec!(0.005), None).await.unwrap();
    assert_eq!(cap.amount_usd, dec!(0.01));
}

#[tokio::test]
#[ignore]
async fn concurrent_set_cap_leaves_one_active() {
    let services = spawn_services().await;

    let handles: Vec<_> = [dec!(10), dec!(20), dec!(30), dec!(40)]
        .into_iter()
        .map(|amount| {
            let ledger = services.ledger.clone();
            tokio::spawn(async move { ledger.set_cap(amount, None).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().expect("Cap should be set");
    }

    // One more replace deactivates exactly the single survivor
    assert_eq!(services.ledger.clear_cap().await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn clear_cap_removes_active_cap() {
    let services = spawn_services().await;

    services.ledger.set_cap(dec!(50), None).await.unwrap();
    assert_eq!(services.ledger.clear_cap().await.unwrap(), 1);
    assert_eq!(services.ledger.clear_cap().await.unwrap(), 0);

    let status = services.ledger.cap_status().await.unwrap();
    assert!(!status.has_cap);
}

#[tokio::test]
#[ignore]
async fn cap_status_reports_alert_levels() {
    let services = spawn_services().await;
    services.ledger.set_cap(dec!(100), None).await.unwrap();

    let status = services.ledger.cap_status().await.unwrap();
    assert!(status.has_cap);
    assert_eq!(status.alert_level, AlertLevel::Ok);
    assert_eq!(status.remaining, Some(dec!(100)));

    services
        .ledger
        .record_spend(dec!(76), SpendCategory::Tts, None)
        .await
        .unwrap();
    let status = services.ledger.cap_status().await.unwrap();
    assert_eq!(status.percentage, Some(dec!(76)));
    assert_eq!(status.alert_level, AlertLevel::Warning);

    services
        .ledger
        .record_spend(dec!(30), SpendCategory::Tts, None)
        .await
        .unwrap();
    let status = services.ledger.cap_status().await.unwrap();
    assert_eq!(status.alert_level, AlertLevel::Danger);
    assert!(status.is_over_cap);
    assert_eq!(status.remaining, Some(dec!(0)));
}

#[tokio::test]
#[ignore]
async fn tier_follows_spend_against_cap() {
    let services = spawn_services().await;

    // No cap: always premium
    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Premium);

    services.ledger.set_cap(dec!(100), None).await.unwrap();
    services
        .ledger
        .record_spend(dec!(84.99), SpendCategory::Llm, Some(Tier::Premium))
        .await
        .unwrap();
    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Premium);

    services
        .ledger
        .record_spend(dec!(0.01), SpendCategory::Llm, Some(Tier::Premium))
        .await
        .unwrap();
    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Standard);

    services
        .ledger
        .record_spend(dec!(15), SpendCategory::Llm, Some(Tier::Standard))
        .await
        .unwrap();
    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Fallback);

    // Forced tier bypasses the ledger
    assert_eq!(
        services.tier_selector.select_tier(Some(Tier::Premium)).await,
        Tier::Premium
    );
}

#[tokio::test]
#[ignore]
async fn tier_uses_exact_percentage_not_displayed_one() {
    let services = spawn_services().await;
    services.ledger.set_cap(dec!(100), None).await.unwrap();
    services
        .ledger
        .record_spend(dec!(84.999), SpendCategory::Llm, Some(Tier::Premium))
        .await
        .unwrap();

    let status = services.ledger.cap_status().await.unwrap();
    assert_eq!(status.percentage, Some(dec!(85.00)));
    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Premium);

    services
        .ledger
        .record_spend(dec!(14.997), SpendCategory::Llm, Some(Tier::Standard))
        .await
        .unwrap();
    let status = services.ledger.cap_status().await.unwrap();
    assert!(!status.is_over_cap);
    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Standard);
}

#[tokio::test]
#[ignore]
async fn tier_selection_does_not_write() {
    let services = spawn_services().await;
    services.ledger.set_cap(dec!(100), None).await.unwrap();

    assert_eq!(services.tier_selector.select_tier(None).await, Tier::Premium);
    assert!(services.ledger.history(None).await.unwrap().is_empty());
}
