//! Full cycle lifecycle: open, iterate, sell, close, calibrate.

use chrono::Duration;
use rust_decimal_macros::dec;
use std::sync::Arc;

use cycle_engine::calibration::CorrectionScope;
use cycle_engine::config::{InvestConfig, TradingMode};
use cycle_engine::engine::executor::ExchangeGateway;
use cycle_engine::storage::CycleStore;
use cycle_engine::types::*;

use crate::mocks::*;

const HOUR_MS: i64 = 3_600_000;

#[tokio::test]
async fn test_twelve_hour_cycle_end_to_end() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();
    assert!(opened.selection.should_invest);
    let symbols: Vec<&str> = opened.positions.iter().map(|p| p.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["ALP", "BET", "GAM"]);
    for p in &opened.positions {
        assert!((p.capital_usd - 100.0).abs() < 1e-9);
        assert!((p.entry_fee_usd - 0.1).abs() < 1e-9);
        assert!(p.entry_order_id.is_some());
    }
    let cycle_id = opened.cycle.id.clone();

    // First slot is one hour in.
    let summary = mgr.run_due_cycles(t0 + Duration::minutes(30)).await.unwrap();
    assert!(summary.ran.is_empty());

    feed.set_price("alpha", 112.0);
    feed.set_price("beta", 47.0);
    feed.set_price("gamma", 10.1);
    let report = mgr.run_iteration(&cycle_id, t0 + Duration::hours(1)).await.unwrap();

    assert_eq!(report.outcome.record.iteration_index, 0);
    assert!(!report.outcome.iterations_complete);
    assert!(report.failed_sells.is_empty());
    let mut reasons: Vec<(String, CloseReason)> = report
        .closed
        .iter()
        .map(|p| (p.symbol.clone(), p.close_reason.unwrap()))
        .collect();
    reasons.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        reasons,
        vec![
            ("ALP".to_string(), CloseReason::TakeProfit),
            ("BET".to_string(), CloseReason::StopLoss),
        ]
    );
    assert_eq!(report.capital.open_positions, 1);
    assert_eq!(mgr.calibration_snapshot().await.invertible.overall.samples, 2);

    for hour in 2..=12 {
        let summary = mgr.run_due_cycles(t0 + Duration::hours(hour)).await.unwrap();
        assert_eq!(summary.ran, vec![cycle_id.clone()], "hour {hour}");
        assert!(summary.failed.is_empty());
    }

    let cycle = store.cycle(&cycle_id).unwrap();
    assert!(cycle.is_completed());
    assert_eq!(cycle.iterations.len(), 12);
    assert!(cycle.iterations.last().unwrap().is_last);
    assert!(cycle.iterations[..11].iter().all(|r| !r.is_last));

    let gamma = store.position(&format!("{cycle_id}-gamma")).unwrap();
    assert!(gamma.is_closed());
    assert_eq!(gamma.close_reason, Some(CloseReason::CycleEnd));
    assert_eq!(gamma.hold_cycles, 12);

    let summary = mgr.run_due_cycles(t0 + Duration::hours(13)).await.unwrap();
    assert!(summary.ran.is_empty());

    // 11.8 - 6.2 + 0.8
    let capital = mgr.capital_report(t0 + Duration::hours(13)).await.unwrap();
    assert_eq!(capital.closed_positions, 3);
    assert_eq!(capital.open_positions, 0);
    assert_eq!(capital.wins, 2);
    assert_eq!(capital.losses, 1);
    assert_eq!(capital.realized_pnl, dec!(6.40));

    let state = mgr.calibration_snapshot().await;
    assert_eq!(state.invertible.overall.samples, 3);
    assert_eq!(state.apalancado.overall.samples, 0);
    assert_eq!(state.invertible.history.front().unwrap().symbol, "GAM");

    let factors = mgr.correction_factors(Classification::Invertible, 0.8).await.unwrap();
    assert_eq!(factors.scope, CorrectionScope::Category);
    assert_eq!(factors.samples, 3);
    assert!(mgr.correction_factors(Classification::Ruidoso, 0.8).await.is_none());
}

#[tokio::test]
async fn test_calibration_survives_restart() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let t0 = start_time();

    let before = {
        let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
        let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();
        feed.set_price("alpha", 115.0);
        feed.set_price("beta", 40.0);
        mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(1)).await.unwrap();
        mgr.calibration_snapshot().await
    };
    assert_eq!(before.total_samples(), 2);

    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    assert_eq!(mgr.calibration_snapshot().await, before);

    let rebuilt = mgr.rebuild_calibration().await.unwrap();
    assert_eq!(rebuilt.total_samples(), 2);
}

#[tokio::test]
async fn test_failed_sell_keeps_position_open_until_sweep() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let gateway = FlakyGateway::new(0.1);
    let config = InvestConfig {
        mode: TradingMode::Real,
        ..InvestConfig::default()
    };
    let mgr = manager(
        store.clone(),
        &feed,
        config,
        Some(gateway.clone() as Arc<dyn ExchangeGateway>),
    )
    .await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();
    let alpha_id = format!("{}-alpha", opened.cycle.id);

    gateway.reject_sells(true);
    feed.set_price("alpha", 112.0);
    let report = mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(1)).await.unwrap();
    assert!(report.closed.is_empty());
    assert_eq!(report.failed_sells, vec![alpha_id.clone()]);

    let alpha = store.position(&alpha_id).unwrap();
    assert!(alpha.is_open());
    assert!((alpha.current_price - 112.0).abs() < 1e-9);
    assert_eq!(alpha.hold_cycles, 1);
    assert_eq!(mgr.calibration_snapshot().await.total_samples(), 0);

    gateway.reject_sells(false);
    let closed = mgr.sweep_open_positions(t0 + Duration::minutes(90)).await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].id, alpha_id);
    assert_eq!(closed[0].close_reason, Some(CloseReason::TakeProfit));
    assert!(closed[0].realized_pnl.unwrap() > 0.0);
    assert_eq!(mgr.calibration_snapshot().await.total_samples(), 1);
}

#[tokio::test]
async fn test_sweep_closes_positions_of_completed_cycle() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 6 * HOUR_MS, t0).await.unwrap();
    assert!(mgr.sweep_open_positions(t0).await.unwrap().is_empty());

    let mut cycle = store.cycle(&opened.cycle.id).unwrap();
    cycle.status = CycleStatus::Completed;
    store.save_cycle(&cycle).await.unwrap();

    let closed = mgr.sweep_open_positions(t0 + Duration::hours(7)).await.unwrap();
    assert_eq!(closed.len(), 3);
    assert!(closed.iter().all(|p| p.close_reason == Some(CloseReason::CycleEnd)));
    assert!(mgr.sweep_open_positions(t0 + Duration::hours(8)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_feed_outage_falls_back_to_stale_prices() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();
    let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();

    feed.set_error("503 Service Unavailable");
    let report = mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(1)).await.unwrap();
    let record = &report.outcome.record;
    assert_eq!(record.prices.len(), 5);
    assert!(record.prices.values().all(|p| p.is_stale));
    assert_eq!(record.fetch_stats.stale_count, 5);
    assert!(record.failed_ids.is_empty());
    assert!(report.closed.is_empty());
    assert_eq!(record.decisions.len(), 3);

    feed.clear_error();
    feed.set_price("gamma", 10.2);
    let report = mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(2)).await.unwrap();
    let record = &report.outcome.record;
    assert_eq!(record.iteration_index, 1);
    assert_eq!(record.fetch_stats.stale_count, 0);
    assert_eq!(record.fetch_stats.sources_used, vec!["mock".to_string()]);
    assert!((record.prices["gamma"].price - 10.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_cycle_without_enough_signals_is_still_tracked() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = vec![
        asset("alpha", "ALP", 100.0, 8.0, Classification::Invertible, 0.8),
        asset("delta", "DEL", 2.0, 12.0, Classification::Ruidoso, 0.9),
    ];
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 6 * HOUR_MS, t0).await.unwrap();
    assert!(!opened.selection.should_invest);
    assert!(opened.selection.reason.contains("Not enough signals"));
    assert!(opened.positions.is_empty());

    let cycle = store.cycle(&opened.cycle.id).unwrap();
    assert_eq!(cycle.version, 1);
    assert!(cycle.iterations.is_empty());

    let report = mgr.run_iteration(&opened.cycle.id, t0 + Duration::minutes(30)).await.unwrap();
    assert_eq!(report.outcome.record.prices.len(), 2);
    assert!(report.outcome.record.decisions.is_empty());
}

#[tokio::test]
async fn test_held_assets_are_not_bought_twice() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let first = mgr.open_cycle(snapshot.clone(), 12 * HOUR_MS, t0).await.unwrap();
    assert_eq!(first.positions.len(), 3);

    let second = mgr
        .open_cycle(snapshot, 12 * HOUR_MS, t0 + Duration::minutes(10))
        .await
        .unwrap();
    assert!(!second.selection.should_invest);
    assert!(second.positions.is_empty());
    assert_ne!(first.cycle.id, second.cycle.id);

    let capital = mgr.capital_report(t0 + Duration::minutes(10)).await.unwrap();
    assert_eq!(capital.open_positions, 3);
}

#[tokio::test]
async fn test_iteration_errors() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let err = mgr.run_iteration("missing", t0).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleNotFound(ref id) if id == "missing"));

    let err = mgr.open_cycle(snapshot.clone(), 0, t0).await.unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));

    let opened = mgr.open_cycle(snapshot, HOUR_MS, t0).await.unwrap();
    // Past the end time, the next iteration is the last one.
    let report = mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(2)).await.unwrap();
    assert!(report.outcome.iterations_complete);
    assert_eq!(report.closed.len(), 3);
    assert!(report.closed.iter().all(|p| p.close_reason == Some(CloseReason::CycleEnd)));

    let err = mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(3)).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleCompleted(_)));
}

#[tokio::test]
async fn test_stale_cycle_copy_is_rejected() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();
    let stale = store.cycle(&opened.cycle.id).unwrap();
    assert_eq!(stale.version, 1);

    mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(1)).await.unwrap();

    let err = store.save_cycle(&stale).await.unwrap_err();
    match err {
        EngineError::VersionConflict { expected, found, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(found, 2);
        }
        other => panic!("expected version conflict, got {other}"),
    }
    assert_eq!(store.cycle(&opened.cycle.id).unwrap().iterations.len(), 1);
}

#[tokio::test]
async fn test_unpersisted_close_is_recorded_not_resold() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = default_snapshot();
    seed_feed(&feed, &snapshot);
    let gateway = FlakyGateway::new(0.1);
    let config = InvestConfig {
        mode: TradingMode::Real,
        ..InvestConfig::default()
    };
    let mgr = manager(
        store.clone(),
        &feed,
        config,
        Some(gateway.clone() as Arc<dyn ExchangeGateway>),
    )
    .await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();
    let alpha_id = format!("{}-alpha", opened.cycle.id);

    // Marks save, then the close of the take-profit sell fails to persist.
    store.allow_position_saves(1);
    feed.set_price("alpha", 112.0);
    let err = mgr.run_iteration(&opened.cycle.id, t0 + Duration::hours(1)).await.unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert_eq!(gateway.filled_sells(), 1);
    assert!(store.position(&alpha_id).unwrap().is_open());

    store.allow_all_position_saves();
    let closed = mgr.sweep_open_positions(t0 + Duration::minutes(70)).await.unwrap();
    assert!(closed.is_empty());
    assert_eq!(gateway.filled_sells(), 1);

    let alpha = store.position(&alpha_id).unwrap();
    assert!(alpha.is_closed());
    assert_eq!(alpha.close_reason, Some(CloseReason::TakeProfit));
    assert_eq!(mgr.calibration_snapshot().await.total_samples(), 1);
    assert_eq!(store.cycle(&opened.cycle.id).unwrap().iterations.len(), 1);
}

#[tokio::test]
async fn test_repeated_snapshot_asset_is_bought_once() {
    let store = MemoryStore::new();
    let feed = MockPriceFeed::new();
    let snapshot = vec![
        asset("alpha", "ALP", 100.0, 8.0, Classification::Invertible, 0.8),
        asset("alpha", "ALP", 100.0, 6.0, Classification::Invertible, 0.8),
        asset("beta", "BET", 50.0, 5.0, Classification::Invertible, 0.6),
    ];
    seed_feed(&feed, &snapshot);
    let mgr = manager(store.clone(), &feed, InvestConfig::default(), None).await;
    let t0 = start_time();

    let opened = mgr.open_cycle(snapshot, 12 * HOUR_MS, t0).await.unwrap();
    assert_eq!(opened.positions.len(), 2);

    let capital = mgr.capital_report(t0).await.unwrap();
    assert_eq!(capital.open_positions, 2);
    assert_eq!(capital.committed, dec!(300));
}
