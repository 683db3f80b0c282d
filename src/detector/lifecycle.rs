// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model lifecycle manager
//!
//! Owns the single resident detector session and its state machine:
//!
//! ```text
//! idle -> loading -> ready | error
//! ready -> idle      (unload)
//! error -> loading   (retry)
//! ```
//!
//! Concurrent `load` calls for the same variant share one in-flight operation,
//! so each variant is fetched and compiled at most once per load cycle. Loading
//! a different variant, or unloading, supersedes whatever is in flight; a
//! superseded load never installs its session or reports its outcome.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::error::DetectorError;
use super::fetch::{fetcher_for, FileModelFetcher, ModelFetcher, ProgressFn};
use super::session::{InferenceBackend, InferenceSession, OrtBackend};
use super::tensor_codec::LetterboxCanvas;
use super::variant::ModelVariant;
use crate::config::DetectorConfig;

/// Lifecycle state of the detector model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelState {
    Idle,
    Loading,
    Ready,
    Error,
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelState::Idle => "idle",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot broadcast to state subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStatus {
    pub state: ModelState,
    /// Variant the state refers to
    pub variant: ModelVariant,
    /// Set only in [`ModelState::Error`]
    pub error: Option<DetectorError>,
}

/// Borrowed view of the resident session, handed to exclusive detect work
pub struct ActiveSession<'a> {
    pub variant: ModelVariant,
    pub session: &'a mut dyn InferenceSession,
    pub canvas: &'a mut LetterboxCanvas,
}

type LoadFuture = Shared<BoxFuture<'static, Result<(), DetectorError>>>;

struct InFlightLoad {
    variant: ModelVariant,
    future: LoadFuture,
    abort: AbortHandle,
}

struct Inner {
    /// Bumped by every new load and every unload
    generation: u64,
    /// Variant `ensure_ready` loads
    requested: ModelVariant,
    in_flight: Option<InFlightLoad>,
}

struct ResidentModel {
    variant: ModelVariant,
    generation: u64,
    session: Box<dyn InferenceSession>,
}

/// Guarded by one async mutex so detects run one at a time, in FIFO order
#[derive(Default)]
struct SessionSlot {
    resident: Option<ResidentModel>,
    /// Preprocessing buffer shared by every detect, sized to the resident variant
    canvas: Option<LetterboxCanvas>,
}

struct ManagerShared {
    fetcher: Arc<dyn ModelFetcher>,
    backend: Arc<dyn InferenceBackend>,
    inner: Mutex<Inner>,
    slot: Arc<tokio::sync::Mutex<SessionSlot>>,
    state_tx: watch::Sender<ModelStatus>,
    progress_tx: watch::Sender<u8>,
    consumers: AtomicUsize,
}

static SHARED_MANAGER: OnceLock<ModelLifecycleManager> = OnceLock::new();

/// Handle to a detector model lifecycle; clones share the same model
#[derive(Clone)]
pub struct ModelLifecycleManager {
    shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for ModelLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLifecycleManager")
            .field("status", &self.status())
            .field("progress", &self.progress())
            .field("consumers", &self.ref_count())
            .field("source", &self.shared.fetcher.describe())
            .finish()
    }
}

impl ModelLifecycleManager {
    /// Build an isolated manager; `variant` is what `ensure_ready` loads
    pub fn new(
        fetcher: Arc<dyn ModelFetcher>,
        backend: Arc<dyn InferenceBackend>,
        variant: ModelVariant,
    ) -> Self {
        let (state_tx, _) = watch::channel(ModelStatus {
            state: ModelState::Idle,
            variant,
            error: None,
        });
        let (progress_tx, _) = watch::channel(0u8);

        Self {
            shared: Arc::new(ManagerShared {
                fetcher,
                backend,
                inner: Mutex::new(Inner {
                    generation: 0,
                    requested: variant,
                    in_flight: None,
                }),
                slot: Arc::new(tokio::sync::Mutex::new(SessionSlot::default())),
                state_tx,
                progress_tx,
                consumers: AtomicUsize::new(0),
            }),
        }
    }

    /// Build a manager backed by ONNX Runtime and the configured model source
    pub fn from_config(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let fetcher = fetcher_for(&config.model_source, config.fetch_timeout)?;
        let backend = Arc::new(OrtBackend::new(config.intra_threads));
        Ok(Self::new(fetcher, backend, config.variant))
    }

    /// Process-wide manager configured from the environment
    ///
    /// Every caller gets a handle to the same model, so a variant is fetched
    /// and compiled at most once per process.
    pub fn shared() -> ModelLifecycleManager {
        SHARED_MANAGER
            .get_or_init(|| {
                let config = DetectorConfig::from_env();
                Self::from_config(&config).unwrap_or_else(|e| {
                    warn!(
                        "Invalid model source {}: {}; falling back to {}",
                        config.model_source,
                        e,
                        crate::config::DEFAULT_MODEL_SOURCE
                    );
                    Self::new(
                        Arc::new(FileModelFetcher::new(crate::config::DEFAULT_MODEL_SOURCE)),
                        Arc::new(OrtBackend::new(config.intra_threads)),
                        config.variant,
                    )
                })
            })
            .clone()
    }

    /// Load `variant`, sharing any in-flight load of the same variant
    ///
    /// Returns immediately when `variant` is already ready. Loading a different
    /// variant tears down the resident session first.
    pub async fn load(&self, variant: ModelVariant) -> Result<(), DetectorError> {
        let future = {
            let mut inner = self.shared.lock_inner();
            inner.requested = variant;

            let joinable = inner
                .in_flight
                .as_ref()
                .filter(|load| load.variant == variant)
                .map(|load| load.future.clone());

            match joinable {
                Some(future) => {
                    debug!("Joining in-flight load of {}", variant);
                    future
                }
                None => {
                    let status = self.shared.state_tx.borrow().clone();
                    if status.state == ModelState::Ready && status.variant == variant {
                        return Ok(());
                    }
                    self.start_load(&mut inner, variant)
                }
            }
        };

        future.await
    }

    /// Load whichever variant was last requested (the configured one by default)
    pub async fn ensure_ready(&self) -> Result<(), DetectorError> {
        let variant = self.shared.lock_inner().requested;
        self.load(variant).await
    }

    fn start_load(&self, inner: &mut Inner, variant: ModelVariant) -> LoadFuture {
        if let Some(previous) = inner.in_flight.take() {
            info!(
                "Superseding in-flight load of {} with {}",
                previous.variant, variant
            );
            previous.abort.abort();
        }

        let current = self.shared.state_tx.borrow().clone();
        if current.state != ModelState::Idle && current.variant != variant {
            self.shared.set_status(ModelState::Idle, current.variant, None);
        }

        inner.generation += 1;
        let generation = inner.generation;

        self.shared.progress_tx.send_replace(0);
        self.shared.set_status(ModelState::Loading, variant, None);
        info!("Loading {} detector from {}", variant, self.shared.fetcher.describe());

        let shared = self.shared.clone();
        let handle = tokio::spawn(ManagerShared::run_load(shared, variant, generation));
        let abort = handle.abort_handle();

        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(DetectorError::LoadSuperseded),
                Err(e) => Err(DetectorError::ModelCompileFailed(format!(
                    "load task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();

        inner.in_flight = Some(InFlightLoad {
            variant,
            future: future.clone(),
            abort,
        });

        future
    }

    /// Release the resident session and return to idle
    ///
    /// Cancels any in-flight load and waits for a running detect to finish.
    /// Never fails; calling it while idle is a no-op.
    pub async fn unload(&self) {
        {
            let mut inner = self.shared.lock_inner();
            inner.generation += 1;
            if let Some(load) = inner.in_flight.take() {
                info!("Cancelling in-flight load of {}", load.variant);
                load.abort.abort();
            }
            self.shared.progress_tx.send_if_modified(|p| {
                let changed = *p != 0;
                *p = 0;
                changed
            });
            let variant = self.shared.state_tx.borrow().variant;
            self.shared.set_status(ModelState::Idle, variant, None);
        }

        let mut slot = self.shared.slot.lock().await;
        if let Some(resident) = slot.resident.take() {
            info!("Unloaded {} detector", resident.variant);
        }
        slot.canvas = None;
    }

    /// Run `work` against the resident session with exclusive access
    ///
    /// Calls queue in FIFO order on one lock and the work itself runs on the
    /// blocking pool. Fails with `NotReady` when no current session is resident.
    pub async fn run_exclusive<R, F>(&self, work: F) -> Result<R, DetectorError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(ActiveSession<'a>) -> Result<R, DetectorError> + Send + 'static,
    {
        let mut slot = self.shared.slot.clone().lock_owned().await;

        {
            let inner = self.shared.lock_inner();
            let current = slot
                .resident
                .as_ref()
                .is_some_and(|r| r.generation == inner.generation);
            if !current {
                let status = self.shared.state_tx.borrow().clone();
                return Err(DetectorError::NotReady(format!(
                    "{} detector is {}",
                    status.variant, status.state
                )));
            }
        }

        tokio::task::spawn_blocking(move || {
            let SessionSlot { resident, canvas } = &mut *slot;
            match (resident.as_mut(), canvas.as_mut()) {
                (Some(resident), Some(canvas)) => work(ActiveSession {
                    variant: resident.variant,
                    session: resident.session.as_mut(),
                    canvas,
                }),
                _ => Err(DetectorError::NotReady("detector was unloaded".to_string())),
            }
        })
        .await
        .map_err(|e| DetectorError::InvalidOutput(format!("detect task failed: {}", e)))?
    }

    /// Register a consumer; returns the new count
    pub fn acquire(&self) -> usize {
        self.shared.consumers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Unregister a consumer; returns the new count
    ///
    /// Reaching zero keeps the model resident. Call [`unload`](Self::unload)
    /// to free it.
    pub fn release(&self) -> usize {
        let previous = self
            .shared
            .consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn ref_count(&self) -> usize {
        self.shared.consumers.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ModelState {
        self.shared.state_tx.borrow().state
    }

    pub fn status(&self) -> ModelStatus {
        self.shared.state_tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    /// Download/compile progress of the current load, 0-100
    pub fn progress(&self) -> u8 {
        *self.shared.progress_tx.borrow()
    }

    /// Subscribe to state changes; the current status is readable immediately
    pub fn subscribe_state(&self) -> watch::Receiver<ModelStatus> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to progress; the current value is readable immediately
    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.shared.progress_tx.subscribe()
    }

    /// Invoke `callback` with the current status and every later change
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use = "dropping the Subscription unsubscribes"]
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ModelStatus) + Send + 'static,
    {
        Subscription::spawn(self.subscribe_state(), callback)
    }

    /// Invoke `callback` with the current progress and every later change
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use = "dropping the Subscription unsubscribes"]
    pub fn on_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(u8) + Send + 'static,
    {
        Subscription::spawn(self.subscribe_progress(), callback)
    }
}

impl ManagerShared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        // No invariant spans a panic inside the critical sections
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, state: ModelState, variant: ModelVariant, error: Option<DetectorError>) {
        let next = ModelStatus {
            state,
            variant,
            error,
        };
        self.state_tx.send_if_modified(|status| {
            if *status == next {
                false
            } else {
                debug!("Detector {} -> {} ({})", status.state, next.state, next.variant);
                *status = next;
                true
            }
        });
    }

    async fn run_load(
        shared: Arc<ManagerShared>,
        variant: ModelVariant,
        generation: u64,
    ) -> Result<(), DetectorError> {
        let started = Instant::now();

        // Only one variant may be resident
        {
            let mut slot = shared.slot.lock().await;
            if let Some(resident) = slot.resident.take() {
                info!("Releasing {} detector", resident.variant);
            }
        }

        let bytes = match shared.fetcher.fetch(variant, shared.progress_callback(generation)).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(shared.fail(variant, generation, e)),
        };

        let backend = shared.backend.clone();
        let compiled = tokio::task::spawn_blocking(move || backend.compile(&bytes, variant))
            .await
            .map_err(|e| DetectorError::ModelCompileFailed(format!("compile task failed: {}", e)))
            .and_then(|result| result);
        let session = match compiled {
            Ok(session) => session,
            Err(e) => return Err(shared.fail(variant, generation, e)),
        };

        let mut slot = shared.slot.lock().await;

        let size = variant.input_size();
        let canvas = match slot.canvas.take() {
            Some(mut canvas) => canvas.resize(size).map(|()| canvas),
            None => LetterboxCanvas::new(size),
        };
        match canvas {
            Ok(canvas) => slot.canvas = Some(canvas),
            Err(e) => {
                drop(slot);
                return Err(shared.fail(variant, generation, e));
            }
        }

        let mut inner = shared.lock_inner();
        if inner.generation != generation {
            debug!("Discarding superseded {} session", variant);
            return Err(DetectorError::LoadSuperseded);
        }

        slot.resident = Some(ResidentModel {
            variant,
            generation,
            session,
        });
        inner.in_flight = None;
        shared.progress_tx.send_replace(100);
        shared.set_status(ModelState::Ready, variant, None);
        info!("✅ {} detector ready in {:?}", variant, started.elapsed());

        Ok(())
    }

    /// Progress reporter that stays silent once its load is superseded
    fn progress_callback(self: &Arc<Self>, generation: u64) -> ProgressFn {
        let shared = Arc::downgrade(self);
        Arc::new(move |received, total| {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let percent = match total {
                Some(total) if total > 0 => (received.min(total) * 100 / total) as u8,
                _ => return,
            };
            // 100 is reserved for a compiled, installed session
            let percent = percent.min(99);
            // Hold `inner` across the send so a newer load's reset to 0 cannot interleave
            let inner = shared.lock_inner();
            if inner.generation != generation {
                return;
            }
            shared.progress_tx.send_if_modified(|current| {
                if percent > *current {
                    *current = percent;
                    true
                } else {
                    false
                }
            });
        })
    }

    /// Record a load failure; stale loads report `LoadSuperseded` instead
    fn fail(&self, variant: ModelVariant, generation: u64, err: DetectorError) -> DetectorError {
        let mut inner = self.lock_inner();
        if inner.generation != generation {
            debug!("Ignoring failure of superseded {} load: {}", variant, err);
            return DetectorError::LoadSuperseded;
        }
        inner.in_flight = None;
        error!("❌ Failed to load {} detector: {}", variant, err);
        self.set_status(ModelState::Error, variant, Some(err.clone()));
        err
    }
}

/// Callback subscription; unsubscribes on drop
pub struct Subscription {
    handle: Option<AbortHandle>,
}

impl Subscription {
    fn spawn<T, F>(mut rx: watch::Receiver<T>, callback: F) -> Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let current = rx.borrow_and_update().clone();
            callback(current);
            while rx.changed().await.is_ok() {
                let value = rx.borrow_and_update().clone();
                callback(value);
            }
        });
        Self {
            handle: Some(task.abort_handle()),
        }
    }

    /// Stop receiving callbacks; calling it again has no effect
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
