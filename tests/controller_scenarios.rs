//! End-to-end controller behaviour against the in-process service, on a
//! paused clock.

use std::sync::Arc;
use std::time::Duration;

use electribill::api::stub::{Call, StubService};
use electribill::api::{FailureKind, FetchError, FetchOp, HouseholdForm};
use electribill::config::ControllerConfig;
use electribill::controller::{Controller, ControllerHandle, DerivedPhase, Intent, Snapshot, View};
use electribill::params::ParamKey;
use tokio::time::{sleep, Instant};

const LATENCY: Duration = Duration::from_millis(20);

fn setup_with(cfg: ControllerConfig) -> (Arc<StubService>, ControllerHandle) {
    let stub = Arc::new(StubService::new().with_latency(LATENCY));
    let handle = Controller::spawn(stub.clone(), cfg);
    (stub, handle)
}

fn setup() -> (Arc<StubService>, ControllerHandle) {
    setup_with(ControllerConfig::default())
}

async fn settled(handle: &ControllerHandle, key: ParamKey) -> Arc<Snapshot> {
    handle
        .wait_for(|s| s.key() == key && !s.training && s.metrics.as_ref().map(|m| m.key) == Some(key))
        .await
        .unwrap()
}

async fn loaded_at(handle: &ControllerHandle, key: ParamKey) -> Arc<Snapshot> {
    handle
        .wait_for(|s| s.phase == DerivedPhase::Loaded && s.produced_at() == Some(key))
        .await
        .unwrap()
}

/// Mount, then first dashboard access at the defaults.
async fn dashboard_ready() -> (Arc<StubService>, ControllerHandle, Arc<Snapshot>) {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;
    handle.focus(View::Dashboard).unwrap();
    let snap = loaded_at(&handle, ParamKey::new(9, 90)).await;
    stub.clear_calls();
    (stub, handle, snap)
}

#[tokio::test(start_paused = true)]
async fn test_mount_trains_at_defaults() {
    let (stub, handle) = setup();
    let snap = settled(&handle, ParamKey::new(9, 90)).await;
    assert_eq!(stub.calls(), vec![Call::Train(ParamKey::new(9, 90))]);
    assert_eq!(snap.phase, DerivedPhase::Empty);
    assert!(snap.dashboard.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_first_access_fetches_dashboard_and_k_comparison_concurrently() {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;
    stub.clear_calls();

    let started = Instant::now();
    handle.focus(View::Dashboard).unwrap();
    let snap = loaded_at(&handle, ParamKey::new(9, 90)).await;
    assert!(started.elapsed() < LATENCY * 2, "elapsed {:?}", started.elapsed());

    let calls = stub.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&Call::Dashboard(ParamKey::new(9, 90))));
    assert!(calls.contains(&Call::KComparison(90)));

    let art = snap.dashboard.as_ref().unwrap();
    assert_eq!((art.produced_at_k, art.produced_at_split), (9, 90));
    assert!(!art.k_comparison.rows.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_k_change_soft_refreshes_without_touching_split_fields() {
    let (stub, handle, before) = dashboard_ready().await;

    handle.set_k(10).unwrap();
    let after = loaded_at(&handle, ParamKey::new(11, 90)).await;
    assert_eq!(after.k, 11);
    assert_eq!(
        stub.calls(),
        vec![Call::Train(ParamKey::new(11, 90)), Call::Dashboard(ParamKey::new(11, 90))]
    );

    let (a, b) = (before.dashboard.as_ref().unwrap(), after.dashboard.as_ref().unwrap());
    assert_eq!(a.box_plot, b.box_plot);
    assert_eq!(a.summary, b.summary);
    assert_eq!(a.bill_histogram, b.bill_histogram);
    assert_eq!(a.scatter, b.scatter);
    assert_eq!(a.correlation, b.correlation);
    assert_eq!(a.k_comparison, b.k_comparison);
    assert_eq!(b.k, 11);
    assert_eq!(b.produced_at_split, 90);
}

#[tokio::test(start_paused = true)]
async fn test_split_change_empties_then_reloads_on_access() {
    let (stub, handle, _) = dashboard_ready().await;
    handle.set_k(10).unwrap();
    loaded_at(&handle, ParamKey::new(11, 90)).await;

    handle.focus(View::Predict).unwrap();
    stub.clear_calls();
    handle.set_split_percent(85).unwrap();
    let snap = settled(&handle, ParamKey::new(11, 85)).await;
    assert_eq!(snap.phase, DerivedPhase::Empty);
    assert!(snap.dashboard.is_none());
    assert_eq!(stub.calls(), vec![Call::Train(ParamKey::new(11, 85))]);

    stub.clear_calls();
    handle.focus(View::Dashboard).unwrap();
    loaded_at(&handle, ParamKey::new(11, 85)).await;
    let calls = stub.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&Call::Dashboard(ParamKey::new(11, 85))));
    assert!(calls.contains(&Call::KComparison(85)));
}

#[tokio::test(start_paused = true)]
async fn test_split_change_reloads_at_once_while_dashboard_focused() {
    let (stub, handle, _) = dashboard_ready().await;
    handle.set_split_percent(80).unwrap();
    loaded_at(&handle, ParamKey::new(9, 80)).await;
    let calls = stub.calls();
    assert_eq!(calls[0], Call::Train(ParamKey::new(9, 80)));
    assert!(calls.contains(&Call::KComparison(80)));
}

#[tokio::test(start_paused = true)]
async fn test_rapid_changes_coalesce_into_one_train() {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;
    stub.clear_calls();

    handle.set_k(11).unwrap();
    sleep(Duration::from_millis(300)).await;
    handle.set_k(13).unwrap();
    sleep(Duration::from_millis(300)).await;
    handle.set_split_percent(75).unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(stub.count(FetchOp::Train), 0);

    settled(&handle, ParamKey::new(13, 75)).await;
    assert_eq!(stub.calls(), vec![Call::Train(ParamKey::new(13, 75))]);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_access_is_free() {
    let (stub, handle, _) = dashboard_ready().await;
    handle.load_dashboard().unwrap();
    handle.focus(View::Dashboard).unwrap();
    handle.load_dashboard().unwrap();
    sleep(Duration::from_secs(2)).await;
    assert!(stub.calls().is_empty());
    assert_eq!(handle.snapshot().phase, DerivedPhase::Loaded);
}

#[tokio::test(start_paused = true)]
async fn test_slow_stale_train_cannot_overwrite_newer_metrics() {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;

    stub.script_delay(FetchOp::Train, Duration::from_secs(3));
    handle.set_k(3).unwrap();
    // First train is now in flight and slow.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(stub.count(FetchOp::Train), 2);

    handle.set_k(5).unwrap();
    settled(&handle, ParamKey::new(5, 90)).await;
    sleep(Duration::from_secs(5)).await;

    let snap = handle.snapshot();
    let metrics = snap.metrics.as_ref().unwrap();
    assert_eq!(metrics.key, ParamKey::new(5, 90));
    assert_eq!(metrics.value.k, 5);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_soft_refresh_is_dropped() {
    let (stub, handle, _) = dashboard_ready().await;

    stub.script_delay(FetchOp::Dashboard, Duration::from_secs(3));
    handle.set_k(11).unwrap();
    handle.wait_for(|s| s.refreshing()).await.unwrap();

    handle.set_k(13).unwrap();
    loaded_at(&handle, ParamKey::new(13, 90)).await;
    sleep(Duration::from_secs(5)).await;

    let snap = handle.snapshot();
    let art = snap.dashboard.as_ref().unwrap();
    assert_eq!(art.produced_at_k, 13);
    assert_eq!(art.k, 13);
    assert_eq!(snap.phase, DerivedPhase::Loaded);
}

#[tokio::test(start_paused = true)]
async fn test_hung_full_load_times_out_and_recovers() {
    let cfg = ControllerConfig {
        request_timeout: Duration::from_secs(1),
        ..ControllerConfig::default()
    };
    let (stub, handle) = setup_with(cfg);
    settled(&handle, ParamKey::new(9, 90)).await;

    stub.script_delay(FetchOp::Dashboard, Duration::from_secs(60));
    let started = Instant::now();
    handle.focus(View::Dashboard).unwrap();
    let snap = handle.wait_for(|s| s.last_failure.is_some()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let notice = snap.last_failure.as_ref().unwrap();
    assert_eq!(notice.kind, FailureKind::Timeout);
    assert_eq!(notice.intent, Intent::FullLoad);
    assert_eq!(snap.phase, DerivedPhase::Empty);
    assert!(snap.dashboard.is_none());

    handle.load_dashboard().unwrap();
    let snap = loaded_at(&handle, ParamKey::new(9, 90)).await;
    assert!(snap.last_failure.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_full_load_failure_commits_nothing() {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;

    stub.script_failure(
        FetchOp::KComparison,
        FetchError::Transport {
            status: Some(500),
            message: "internal server error".into(),
        },
    );
    handle.focus(View::Dashboard).unwrap();
    let snap = handle.wait_for(|s| s.last_failure.is_some()).await.unwrap();
    assert_eq!(snap.phase, DerivedPhase::Empty);
    assert!(snap.dashboard.is_none());
    let notice = snap.last_failure.as_ref().unwrap();
    assert_eq!(notice.kind, FailureKind::Transport);
    assert!(notice.advice.contains("internal error"));
}

#[tokio::test(start_paused = true)]
async fn test_train_failure_keeps_previous_metrics() {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;

    stub.script_failure(FetchOp::Train, FetchError::Malformed("missing field `mae`".into()));
    handle.set_k(7).unwrap();
    let snap = handle
        .wait_for(|s| s.last_failure.as_ref().map(|f| f.intent) == Some(Intent::Train))
        .await
        .unwrap();
    assert_eq!(snap.key(), ParamKey::new(7, 90));
    assert_eq!(snap.metrics.as_ref().unwrap().key, ParamKey::new(9, 90));
    assert!(!snap.training);
}

#[tokio::test(start_paused = true)]
async fn test_prediction_reuses_cached_bill_histogram() {
    let (stub, handle, _) = dashboard_ready().await;
    handle.predict(HouseholdForm::default().to_features()).unwrap();
    let snap = handle.wait_for(|s| s.prediction.is_some()).await.unwrap();
    assert_eq!(stub.calls(), vec![Call::Predict(ParamKey::new(9, 90))]);

    let outcome = snap.prediction.as_ref().unwrap();
    assert_eq!(outcome.key, ParamKey::new(9, 90));
    assert_eq!(
        outcome.bill_histogram.as_ref(),
        Some(&snap.dashboard.as_ref().unwrap().bill_histogram)
    );
}

#[tokio::test(start_paused = true)]
async fn test_prediction_fetches_bill_histogram_when_uncached() {
    let (stub, handle) = setup();
    settled(&handle, ParamKey::new(9, 90)).await;
    stub.clear_calls();

    handle.predict(HouseholdForm::default().to_features()).unwrap();
    let snap = handle.wait_for(|s| s.prediction.is_some()).await.unwrap();
    let calls = stub.calls();
    assert!(calls.contains(&Call::Predict(ParamKey::new(9, 90))));
    assert!(calls.contains(&Call::Dashboard(ParamKey::new(9, 90))));
    assert!(snap.prediction.as_ref().unwrap().bill_histogram.is_some());
    assert_eq!(snap.bill_histogram.as_ref().unwrap().key, ParamKey::new(9, 90));
}

#[tokio::test(start_paused = true)]
async fn test_residuals_load_lazily_and_follow_k() {
    let (stub, handle, _) = dashboard_ready().await;

    handle.focus(View::Explainer).unwrap();
    let snap = handle.wait_for(|s| s.how_loaded).await.unwrap();
    assert_eq!(snap.residual.as_ref().unwrap().key, ParamKey::new(9, 90));
    assert_eq!(stub.calls(), vec![Call::Dashboard(ParamKey::new(9, 90))]);

    stub.clear_calls();
    handle.load_residuals().unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(stub.calls().is_empty());

    handle.set_k(11).unwrap();
    let snap = handle
        .wait_for(|s| {
            s.how_loaded
                && s.residual.as_ref().map(|r| r.key) == Some(ParamKey::new(11, 90))
                && s.phase == DerivedPhase::Loaded
        })
        .await
        .unwrap();
    assert_eq!(snap.produced_at(), Some(ParamKey::new(11, 90)));
    assert_eq!(stub.count(FetchOp::Dashboard), 2);
}

#[tokio::test(start_paused = true)]
async fn test_split_change_drops_residuals() {
    let (_stub, handle, _) = dashboard_ready().await;
    handle.focus(View::Explainer).unwrap();
    handle.wait_for(|s| s.how_loaded).await.unwrap();

    handle.focus(View::Predict).unwrap();
    handle.set_split_percent(70).unwrap();
    let snap = settled(&handle, ParamKey::new(9, 70)).await;
    assert!(snap.residual.is_none());
    assert!(!snap.how_loaded);
    assert_eq!(snap.phase, DerivedPhase::Empty);
}
