// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Model lifecycle tests
//!
//! Verifies that the ModelLifecycleManager:
//! - Fetches and compiles a variant once, however many callers load it
//! - Recovers from a failed load by retrying through `loading`
//! - Supersedes in-flight loads on variant switch and unload
//! - Keeps the model warm when the consumer count drops to zero
//! - Replays current state and progress to late subscribers

use super::support::{empty_output, manager_with, CountingFetcher, StubBackend};
use idcard_detector::detector::{DetectorError, ModelState, ModelVariant};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Test 1: Two concurrent loads of one variant share one fetch and one compile
#[tokio::test]
async fn test_concurrent_loads_fetch_once() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(CountingFetcher::gated(gate.clone()));
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend.clone());

    let (first, second, _) = tokio::join!(
        manager.load(ModelVariant::FullLarge),
        manager.load(ModelVariant::FullLarge),
        async {
            tokio::task::yield_now().await;
            gate.notify_one();
        }
    );

    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(fetcher.calls(), 1, "expected exactly one fetch");
    assert_eq!(backend.compiles(), 1, "expected exactly one compile");
    assert_eq!(manager.state(), ModelState::Ready);
}

/// Test 2: Loading an already-ready variant is a no-op
#[tokio::test]
async fn test_load_when_ready_is_noop() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend.clone());

    manager.load(ModelVariant::FullLarge).await.unwrap();
    manager.load(ModelVariant::FullLarge).await.unwrap();
    manager.ensure_ready().await.unwrap();

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(backend.compiles(), 1);
    assert_eq!(manager.progress(), 100);
}

/// Test 3: A failed load lands in error and a retry goes through loading again,
/// restarting progress from 0
#[tokio::test]
async fn test_error_then_retry_passes_through_loading() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(CountingFetcher::failing(1).with_gate(gate.clone()));
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend.clone());

    gate.notify_one();
    let err = manager.load(ModelVariant::FullLarge).await.unwrap_err();
    assert!(matches!(err, DetectorError::ModelFetchFailed(_)));

    let status = manager.status();
    assert_eq!(status.state, ModelState::Error);
    assert_eq!(status.error, Some(err));
    assert_eq!(backend.compiles(), 0);
    assert_eq!(manager.progress(), 50, "failed attempt keeps its last progress");

    let mut states = manager.subscribe_state();
    let mut progress = manager.subscribe_progress();
    progress.borrow_and_update();
    let retry = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(ModelVariant::FullLarge).await })
    };

    timeout(WAIT, states.wait_for(|s| s.state == ModelState::Loading))
        .await
        .expect("retry never entered loading")
        .unwrap();
    assert!(manager.status().error.is_none());
    timeout(WAIT, progress.changed()).await.unwrap().unwrap();
    assert_eq!(*progress.borrow_and_update(), 0, "retry must restart progress at 0");

    gate.notify_one();
    assert_eq!(retry.await.unwrap(), Ok(()));
    assert_eq!(manager.state(), ModelState::Ready);
    assert_eq!(fetcher.calls(), 2);
}

/// Test 4: Switching variant mid-load supersedes the first load
#[tokio::test]
async fn test_variant_switch_supersedes_in_flight_load() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(CountingFetcher::gated(gate.clone()));
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend.clone());

    let mut states = manager.subscribe_state();
    let large = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(ModelVariant::FullLarge).await })
    };
    timeout(WAIT, states.wait_for(|s| s.state == ModelState::Loading))
        .await
        .unwrap()
        .unwrap();

    let small = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(ModelVariant::FullSmall).await })
    };
    assert_eq!(large.await.unwrap(), Err(DetectorError::LoadSuperseded));

    gate.notify_one();
    assert_eq!(small.await.unwrap(), Ok(()));

    let status = manager.status();
    assert_eq!(status.state, ModelState::Ready);
    assert_eq!(status.variant, ModelVariant::FullSmall);
    assert_eq!(backend.compiles(), 1, "superseded load must not compile");
}

/// Test 5: Unload during a load cancels it and leaves the manager idle
#[tokio::test]
async fn test_unload_cancels_in_flight_load() {
    let gate = Arc::new(Notify::new());
    let fetcher = Arc::new(CountingFetcher::gated(gate.clone()));
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend.clone());

    let mut states = manager.subscribe_state();
    let load = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.load(ModelVariant::FullLarge).await })
    };
    timeout(WAIT, states.wait_for(|s| s.state == ModelState::Loading))
        .await
        .unwrap()
        .unwrap();

    manager.unload().await;
    gate.notify_one();

    assert_eq!(load.await.unwrap(), Err(DetectorError::LoadSuperseded));
    assert_eq!(manager.state(), ModelState::Idle);
    assert_eq!(manager.progress(), 0);
    assert_eq!(backend.compiles(), 0);
}

/// Test 6: Unload releases the session, is idempotent, and a later load refetches
#[tokio::test]
async fn test_unload_releases_session() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend.clone());

    manager.ensure_ready().await.unwrap();
    manager.unload().await;
    manager.unload().await;

    assert_eq!(manager.state(), ModelState::Idle);
    let err = manager.run_exclusive(|_| Ok(())).await.unwrap_err();
    assert!(matches!(err, DetectorError::NotReady(_)));

    manager.ensure_ready().await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    assert!(manager.is_ready());
}

/// Test 7: Dropping the consumer count to zero keeps the model warm
#[tokio::test]
async fn test_release_to_zero_keeps_model_resident() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher.clone(), backend);

    assert_eq!(manager.acquire(), 1);
    manager.ensure_ready().await.unwrap();
    assert_eq!(manager.release(), 0);
    assert_eq!(manager.release(), 0);

    assert!(manager.is_ready());
    manager.run_exclusive(|_| Ok(())).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
}

/// Test 8: Late subscribers are replayed the current state and progress
#[tokio::test]
async fn test_late_subscribers_see_ready() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher, backend);
    manager.ensure_ready().await.unwrap();

    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    let _states = manager.on_state_change(move |status| {
        let _ = state_tx.send(status.state);
    });
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let _progress = manager.on_progress(move |percent| {
        let _ = progress_tx.send(percent);
    });

    assert_eq!(timeout(WAIT, state_rx.recv()).await.unwrap(), Some(ModelState::Ready));
    assert_eq!(timeout(WAIT, progress_rx.recv()).await.unwrap(), Some(100));
    assert_eq!(*manager.subscribe_progress().borrow(), 100);
}

/// Test 9: Progress never goes backwards within a load and ends at 100
#[tokio::test]
async fn test_progress_is_monotonic() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher, backend);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = manager.on_progress(move |percent| {
        let _ = tx.send(percent);
    });

    manager.ensure_ready().await.unwrap();

    let mut seen = Vec::new();
    while seen.last() != Some(&100) {
        let percent = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        seen.push(percent);
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
}

/// Test 10: Unsubscribing one observer leaves the others receiving
#[tokio::test]
async fn test_unsubscribe_does_not_affect_others() {
    let fetcher = Arc::new(CountingFetcher::new());
    let backend = Arc::new(StubBackend::new(empty_output()));
    let manager = manager_with(fetcher, backend);

    let (kept_tx, mut kept_rx) = mpsc::unbounded_channel();
    let _kept = manager.on_state_change(move |status| {
        let _ = kept_tx.send(status.state);
    });
    let (dropped_tx, mut dropped_rx) = mpsc::unbounded_channel();
    let mut dropped = manager.on_state_change(move |status| {
        let _ = dropped_tx.send(status.state);
    });

    assert_eq!(timeout(WAIT, kept_rx.recv()).await.unwrap(), Some(ModelState::Idle));
    assert_eq!(timeout(WAIT, dropped_rx.recv()).await.unwrap(), Some(ModelState::Idle));

    dropped.unsubscribe();
    dropped.unsubscribe();

    manager.ensure_ready().await.unwrap();

    let mut last = ModelState::Idle;
    while last != ModelState::Ready {
        last = timeout(WAIT, kept_rx.recv()).await.unwrap().unwrap();
    }

    // The aborted task dropped its sender, so the channel closes
    assert_eq!(timeout(WAIT, dropped_rx.recv()).await.unwrap(), None);
}
