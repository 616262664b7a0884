//! Owns the single local-inference engine and its load/switch/unload lifecycle.
//!
//! At most one initialization runs per manager. Concurrent callers share it
//! through a [`Shared`] future over a spawned task, so the attempt finishes
//! even if every caller stops waiting. State is published on a
//! [`watch`] channel so readers never contend for the lifecycle lock.

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheProbe;
use crate::consts::DEFAULT_MODEL;
use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::runtime::{CompletionRequest, Engine, LoadProgress, ProgressFn, Runtime};
use crate::status::{EngineState, EngineStatus, ProgressReport, ProgressStatus};
use crate::store::{PersistedStatus, Provider, Store};

type Outcome = Result<(), EngineError>;

/// Word prefixes in runtime progress text that mean weights are being
/// loaded or compiled rather than fetched.
const LOADING_HINTS: &[&str] = &["load", "compil", "shader", "initializ", "warm"];

/// Progress above this is reported as loading regardless of the text.
const LOADING_PERCENT: u8 = 90;

pub struct ManagerConfig {
    pub default_model: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Clone)]
struct InFlight {
    model: String,
    outcome: Shared<BoxFuture<'static, Outcome>>,
}

#[derive(Default)]
struct Slot {
    state: EngineState,
    /// Model of the loaded engine, or of the last failed attempt.
    model: Option<String>,
    engine: Option<Arc<dyn Engine>>,
    in_flight: Option<InFlight>,
}

struct Inner {
    runtime: Arc<dyn Runtime>,
    probe: Arc<dyn CacheProbe>,
    bus: Arc<EventBus>,
    store: Option<Arc<Store>>,
    config: ManagerConfig,
    slot: Mutex<Slot>,
    status: watch::Sender<EngineStatus>,
    /// FIFO queue for completions; the runtime is not assumed to serialize them.
    inference: Mutex<()>,
}

enum Pending {
    Started(Shared<BoxFuture<'static, Outcome>>),
    Joined(InFlight),
}

/// Cheap, clonable handle to one engine lifecycle.
#[derive(Clone)]
pub struct EngineManager {
    inner: Arc<Inner>,
}

impl EngineManager {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        probe: Arc<dyn CacheProbe>,
        bus: Arc<EventBus>,
        store: Option<Arc<Store>>,
        config: ManagerConfig,
    ) -> Self {
        let (status, _) = watch::channel(EngineStatus::default());
        Self {
            inner: Arc::new(Inner {
                runtime,
                probe,
                bus,
                store,
                config,
                slot: Mutex::new(Slot::default()),
                status,
                inference: Mutex::new(()),
            }),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.inner.config.default_model
    }

    /// Latest published status. Never waits on the lifecycle lock.
    pub fn status(&self) -> EngineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    /// Make sure `model` is loaded and ready.
    ///
    /// Without a model, whatever is loaded or loading is good enough, and the
    /// default is used only when nothing is. Returns immediately when the
    /// model is already ready. Joins an in-flight attempt for the same model;
    /// waits out an attempt for a different model and then switches.
    pub async fn ensure_ready(&self, model: Option<&str>) -> Outcome {
        self.touch();

        loop {
            let (wanted, pending) = {
                let mut slot = self.inner.slot.lock().await;
                let wanted = match model {
                    Some(model) => model.to_string(),
                    None => self.current_or_default(&slot),
                };
                if let Some(flight) = slot.in_flight.clone() {
                    (wanted, Pending::Joined(flight))
                } else if slot.state == EngineState::Ready
                    && slot.engine.is_some()
                    && slot.model.as_deref() == Some(wanted.as_str())
                {
                    return Ok(());
                } else {
                    let outcome = self.start_flight(&mut slot, wanted.clone());
                    (wanted, Pending::Started(outcome))
                }
            };

            match pending {
                Pending::Started(outcome) => return outcome.await,
                Pending::Joined(flight) if flight.model == wanted => {
                    debug!(model = %wanted, "joining in-flight initialization");
                    return flight.outcome.await;
                }
                Pending::Joined(flight) => {
                    self.emit(ProgressReport::new(
                        ProgressStatus::Queued,
                        0,
                        format!("Waiting for {} to finish loading", flight.model),
                        &wanted,
                    ));
                    let _ = flight.outcome.await;
                }
            }
        }
    }

    fn current_or_default(&self, slot: &Slot) -> String {
        if let Some(flight) = &slot.in_flight {
            return flight.model.clone();
        }
        match &slot.engine {
            Some(engine) => engine.model_id().to_string(),
            None => self.default_model().to_string(),
        }
    }

    fn start_flight(&self, slot: &mut Slot, model: String) -> Shared<BoxFuture<'static, Outcome>> {
        let task: JoinHandle<Outcome> = tokio::spawn({
            let manager = self.clone();
            let model = model.clone();
            async move { manager.initialize(model).await }
        });

        let manager = self.clone();
        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    manager.abandon_flight().await;
                    Err(EngineError::Runtime(format!(
                        "initialization task failed: {e}"
                    )))
                }
            }
        }
        .boxed()
        .shared();

        // A loaded engine is torn down first, so the switch starts as `Unloading`
        // of the old model.
        slot.state = if slot.engine.is_some() {
            EngineState::Unloading
        } else {
            EngineState::Initializing
        };
        slot.in_flight = Some(InFlight {
            model,
            outcome: outcome.clone(),
        });
        self.publish(slot);
        outcome
    }

    async fn initialize(&self, model: String) -> Outcome {
        let started = Instant::now();

        let previous = self.inner.slot.lock().await.engine.take();
        if let Some(engine) = previous {
            info!(from = engine.model_id(), to = %model, "switching models");
            if let Err(e) = engine.unload().await {
                warn!(model = engine.model_id(), error = %e, "unload before switch failed; continuing");
            }
            let mut slot = self.inner.slot.lock().await;
            slot.model = None;
            slot.state = EngineState::Initializing;
            self.publish(&slot);
        }

        let cached = self.inner.probe.is_cached(&model).await;
        self.emit(if cached {
            ProgressReport::new(ProgressStatus::Loading, 10, "Loading model from cache", &model)
        } else {
            ProgressReport::new(ProgressStatus::Downloading, 0, "Downloading model", &model)
        });

        let on_progress: ProgressFn = {
            let bus = Arc::clone(&self.inner.bus);
            let model = model.clone();
            Arc::new(move |tick: LoadProgress| {
                let percent = tick.percent();
                let status = classify_phase(cached, percent, &tick.text);
                bus.emit(Event::Status(ProgressReport::new(
                    status,
                    percent,
                    tick.text,
                    model.clone(),
                )));
            })
        };

        info!(model = %model, cached, "initializing engine");
        let created = self.inner.runtime.create(&model, on_progress).await;

        let mut slot = self.inner.slot.lock().await;
        slot.in_flight = None;
        slot.model = Some(model.clone());

        match created {
            Ok(engine) => {
                slot.engine = Some(engine);
                slot.state = EngineState::Ready;
                self.publish(&slot);
                drop(slot);

                let elapsed = started.elapsed();
                info!(model = %model, elapsed_ms = elapsed.as_millis() as u64, "engine ready");
                self.emit(ProgressReport::new(
                    ProgressStatus::Ready,
                    100,
                    format!("Model ready (loaded in {:.1}s)", elapsed.as_secs_f64()),
                    &model,
                ));
                self.persist(PersistedStatus {
                    engine_ready: true,
                    last_model_id: Some(model),
                    last_status_snapshot: Some(EngineState::Ready.as_str().to_string()),
                });
                Ok(())
            }
            Err(e) => {
                let err = EngineError::classify(&model, &e);
                slot.engine = None;
                slot.state = EngineState::Error;
                self.publish(&slot);
                drop(slot);

                warn!(model = %model, error = %err, "engine initialization failed");
                self.emit(ProgressReport::new(
                    ProgressStatus::Error,
                    0,
                    err.to_string(),
                    &model,
                ));
                Err(err)
            }
        }
    }

    /// Clean up after an initialization task that died without reporting.
    async fn abandon_flight(&self) {
        let mut slot = self.inner.slot.lock().await;
        slot.in_flight = None;
        if slot.engine.is_none() {
            slot.state = EngineState::Error;
        }
        self.publish(&slot);
    }

    /// Tear down the loaded engine. Never fails; teardown errors are logged.
    pub async fn unload(&self) {
        self.touch();

        let engine = loop {
            let mut slot = self.inner.slot.lock().await;
            if let Some(flight) = slot.in_flight.clone() {
                drop(slot);
                let _ = flight.outcome.await;
                continue;
            }
            match slot.engine.take() {
                Some(engine) => {
                    slot.state = EngineState::Unloading;
                    self.publish(&slot);
                    break engine;
                }
                None => return,
            }
        };

        let model = engine.model_id().to_string();
        if let Err(e) = engine.unload().await {
            warn!(model = %model, error = %e, "engine teardown failed; dropping it anyway");
        }
        drop(engine);

        {
            let mut slot = self.inner.slot.lock().await;
            slot.model = None;
            slot.state = EngineState::Uninitialized;
            self.publish(&slot);
        }
        info!(model = %model, "engine unloaded");

        self.persist(PersistedStatus {
            engine_ready: false,
            last_model_id: Some(model),
            last_status_snapshot: Some(EngineState::Uninitialized.as_str().to_string()),
        });
    }

    /// Run one completion on the loaded engine. Completions are queued, one at a time.
    pub async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        self.touch();
        let engine = {
            let slot = self.inner.slot.lock().await;
            slot.engine.clone()
        }
        .ok_or(EngineError::NotReady)?;

        let _turn = self.inner.inference.lock().await;
        engine.complete(request).await
    }

    /// Reload the model from the previous session in the background.
    ///
    /// Fires when the persisted record says a model was ready, or when the
    /// user prefers local inference. Returns the background task, if any.
    pub fn auto_preload(&self) -> Option<JoinHandle<Outcome>> {
        let store = self.inner.store.as_ref()?;
        let persisted = match store.load_status() {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "could not read persisted engine status; skipping preload");
                return None;
            }
        };
        let prefers_local = matches!(store.provider(), Ok(Some(Provider::Local)));

        if !persisted.engine_ready && !prefers_local {
            debug!("no previous engine and no local preference; skipping preload");
            return None;
        }

        let model = persisted
            .last_model_id
            .unwrap_or_else(|| self.default_model().to_string());
        info!(model = %model, "auto-preloading engine");

        let manager = self.clone();
        Some(tokio::spawn(async move {
            manager.ensure_ready(Some(&model)).await
        }))
    }

    fn touch(&self) {
        let now = Utc::now().timestamp_millis();
        self.inner
            .status
            .send_modify(|status| status.last_activity = Some(now));
    }

    /// While unloading, the status names the engine being torn down; otherwise
    /// the model being loaded wins over the one last loaded.
    fn publish(&self, slot: &Slot) {
        let model_id = match slot.state {
            EngineState::Unloading => slot.model.clone(),
            _ => slot
                .in_flight
                .as_ref()
                .map(|flight| flight.model.clone())
                .or_else(|| slot.model.clone()),
        };
        self.inner.status.send_modify(|status| {
            status.state = slot.state;
            status.model_id = model_id;
        });
    }

    fn emit(&self, report: ProgressReport) {
        debug!(
            status = ?report.status,
            percent = report.percent,
            model = %report.model_id,
            "status change"
        );
        self.inner.bus.emit(Event::Status(report));
    }

    fn persist(&self, status: PersistedStatus) {
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save_status(&status) {
                warn!(error = %e, "failed to persist engine status");
            }
        }
    }
}

/// Decide whether a runtime progress tick is a download or a load.
///
/// Best-effort: progress may jump backwards and the text is free-form, so
/// each tick is judged on its own.
pub fn classify_phase(cached: bool, percent: u8, text: &str) -> ProgressStatus {
    let lower = text.to_lowercase();
    let loading_text = lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| LOADING_HINTS.iter().any(|hint| word.starts_with(hint)));

    if cached || percent > LOADING_PERCENT || loading_text {
        ProgressStatus::Loading
    } else {
        ProgressStatus::Downloading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_always_loading() {
        assert_eq!(classify_phase(true, 0, "fetching param cache"), ProgressStatus::Loading);
    }

    #[test]
    fn high_percent_is_loading() {
        assert_eq!(classify_phase(false, 91, "pulling abc"), ProgressStatus::Loading);
        assert_eq!(classify_phase(false, 90, "pulling abc"), ProgressStatus::Downloading);
    }

    #[test]
    fn loading_words_are_loading() {
        assert_eq!(
            classify_phase(false, 20, "Loading model from cache[3/40]"),
            ProgressStatus::Loading
        );
        assert_eq!(
            classify_phase(false, 20, "compiling GPU shaders"),
            ProgressStatus::Loading
        );
    }

    #[test]
    fn downloading_is_not_mistaken_for_loading() {
        assert_eq!(
            classify_phase(false, 20, "Downloading shard 3"),
            ProgressStatus::Downloading
        );
    }

    #[test]
    fn garbage_text_degrades_to_downloading() {
        assert_eq!(classify_phase(false, 0, ""), ProgressStatus::Downloading);
        assert_eq!(
            classify_phase(false, 5, "\u{fffd}\u{0}%%%"),
            ProgressStatus::Downloading
        );
    }
}
