/// Engine lifecycle controller
///
/// `MicVad` owns one engine for the duration of a mount. Construction runs as
/// a spawned task; the result is only adopted if the mount that started it is
/// still current, otherwise the fresh engine is destroyed on the spot.
/// Engine events reach caller handlers through stable handles, so re-rendering
/// with new handlers never touches the engine subscription.

use crate::callback::{Callback, EventCallback};
use crate::engine::{BoxedEngine, EngineCallbacks, EngineConfig, EngineFactory, FrameProbabilities};
use crate::options::{EngineHandlers, EngineSettings, MicVadOptions, ViewOptions};
use crate::speaking::SpeakingReducer;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Construction failure as exposed to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErroredState {
    pub message: String,
}

/// Reactive state observed by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VadStatus {
    pub listening: bool,
    pub loading: bool,
    pub errored: Option<ErroredState>,
    pub user_speaking: bool,
}

impl Default for VadStatus {
    fn default() -> Self {
        Self {
            listening: false,
            loading: true,
            errored: None,
            user_speaking: false,
        }
    }
}

impl VadStatus {
    pub fn run_state(&self) -> RunState {
        if self.errored.is_some() {
            RunState::Errored
        } else if self.loading {
            RunState::Loading
        } else if self.listening {
            RunState::Listening
        } else {
            RunState::Paused
        }
    }
}

/// Run state as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Loading,
    Errored,
    Paused,
    Listening,
}

/// Controller state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, mount effect not yet run
    Idle,

    /// Waiting for the engine factory
    Constructing,

    /// Engine published and started
    Running,

    /// Engine published, not delivering events
    Paused,

    /// Construction rejected
    Failed,

    /// Unmounted. Absorbing.
    Destroyed,
}

impl Phase {
    fn is_ready(self) -> bool {
        matches!(self, Phase::Running | Phase::Paused)
    }
}

/// Engine slot and mount epoch, guarded together so that adopting a
/// construction result and superseding the mount are mutually exclusive
struct Slot {
    phase: Phase,
    epoch: u64,
    engine: Option<BoxedEngine>,
}

struct Shared {
    slot: Mutex<Slot>,
    status: watch::Sender<VadStatus>,
    settled: watch::Sender<bool>,
}

/// Stable handles for every engine event
struct StableHandlers {
    frame_processed: EventCallback<FrameProbabilities>,
    speech_start: EventCallback<()>,
    speech_frames: EventCallback<Vec<f32>>,
    speech_end: EventCallback<Vec<f32>>,
    vad_misfire: EventCallback<()>,
}

impl StableHandlers {
    fn new(handlers: EngineHandlers) -> Self {
        Self {
            frame_processed: EventCallback::new(handlers.on_frame_processed),
            speech_start: EventCallback::new(handlers.on_speech_start),
            speech_frames: EventCallback::new(handlers.on_speech_frames),
            speech_end: EventCallback::new(handlers.on_speech_end),
            vad_misfire: EventCallback::new(handlers.on_vad_misfire),
        }
    }

    fn update(&self, handlers: EngineHandlers) {
        self.frame_processed.update(handlers.on_frame_processed);
        self.speech_start.update(handlers.on_speech_start);
        self.speech_frames.update(handlers.on_speech_frames);
        self.speech_end.update(handlers.on_speech_end);
        self.vad_misfire.update(handlers.on_vad_misfire);
    }
}

/// Microphone VAD adapter
///
/// Lifecycle: [`MicVad::new`] is the first render, [`MicVad::mount`] runs the
/// mount effect, [`MicVad::render`] re-renders, and [`MicVad::unmount`] (or
/// dropping the adapter) runs the cleanup.
pub struct MicVad {
    shared: Arc<Shared>,
    factory: Arc<dyn EngineFactory>,
    view: ViewOptions,
    settings: EngineSettings,
    handlers: StableHandlers,
    callbacks: EngineCallbacks,
}

impl MicVad {
    /// Create the adapter without constructing the engine
    pub fn new(factory: Arc<dyn EngineFactory>, options: MicVadOptions) -> Self {
        let (view, engine_options) = options.partition();
        debug!("Initializing MicVad with view options: {:?}", view);

        let (status, _) = watch::channel(VadStatus::default());
        let (settled, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                phase: Phase::Idle,
                epoch: 0,
                engine: None,
            }),
            status,
            settled,
        });

        let handlers = StableHandlers::new(engine_options.handlers);
        let callbacks = EngineCallbacks {
            on_frame_processed: frame_processed_handler(
                Arc::downgrade(&shared),
                SpeakingReducer::new(view.user_speaking_threshold),
                handlers.frame_processed.handle(),
            ),
            on_speech_start: handlers.speech_start.handle(),
            on_speech_frames: handlers.speech_frames.handle(),
            on_speech_end: handlers.speech_end.handle(),
            on_vad_misfire: handlers.vad_misfire.handle(),
        };

        Self {
            shared,
            factory,
            view,
            settings: engine_options.settings,
            handlers,
            callbacks,
        }
    }

    /// Create the adapter and run the mount effect
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(factory: Arc<dyn EngineFactory>, options: MicVadOptions) -> Self {
        let vad = Self::new(factory, options);
        vad.mount();
        vad
    }

    /// Run the mount effect: start constructing the engine
    ///
    /// Only the first call has any effect. Must be called from within a Tokio
    /// runtime.
    pub fn mount(&self) {
        let epoch = {
            let mut slot = self.shared.slot.lock();
            if slot.phase != Phase::Idle {
                debug!("Mount ignored in phase {:?}", slot.phase);
                return;
            }
            slot.phase = Phase::Constructing;
            slot.epoch += 1;
            slot.epoch
        };

        info!("Constructing VAD engine (epoch {})", epoch);

        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        let config = EngineConfig {
            settings: self.settings.clone(),
            callbacks: self.callbacks.clone(),
        };
        let start_on_load = self.view.start_on_load;

        tokio::spawn(async move {
            let setup = setup(&shared, factory.as_ref(), config, epoch, start_on_load);
            if AssertUnwindSafe(setup).catch_unwind().await.is_err() {
                error!("VAD engine setup panicked");
            }
            shared.settled.send_replace(true);
        });
    }

    /// Re-render with new options
    ///
    /// Handlers are swapped immediately. Configuration changes are not
    /// applied: the engine is constructed once per mount with the options of
    /// the first render.
    pub fn render(&self, options: MicVadOptions) {
        let (view, engine_options) = options.partition();

        if view != self.view || engine_options.settings != self.settings {
            debug!("Configuration changed after first render; keeping mount-time options");
        }

        self.handlers.update(engine_options.handlers);
    }

    /// Run the cleanup: destroy the engine if one is published and supersede
    /// any in-flight construction. Idempotent.
    pub fn unmount(&self) {
        let mut slot = self.shared.slot.lock();

        match slot.phase {
            Phase::Destroyed => return,
            Phase::Idle => {
                self.shared.settled.send_replace(true);
            }
            Phase::Constructing => {
                info!("Unmounted while constructing; pending engine will be discarded");
            }
            Phase::Running | Phase::Paused => {
                if let Some(engine) = slot.engine.take() {
                    engine.destroy();
                }
                self.shared.status.send_modify(|status| status.listening = false);
                info!("VAD engine destroyed");
            }
            Phase::Failed => {}
        }

        slot.epoch += 1;
        slot.phase = Phase::Destroyed;
    }

    /// Resume the engine. Ignored unless an engine is published.
    pub fn start(&self) {
        self.set_listening(true);
    }

    /// Pause the engine. Ignored unless an engine is published.
    pub fn pause(&self) {
        self.set_listening(false);
    }

    /// Pause if listening, otherwise start
    pub fn toggle(&self) {
        let listening = self.shared.status.borrow().listening;
        if listening {
            self.pause();
        } else {
            self.start();
        }
    }

    fn set_listening(&self, listening: bool) {
        let mut slot = self.shared.slot.lock();

        let engine = match (slot.phase.is_ready(), slot.engine.as_ref()) {
            (true, Some(engine)) => engine,
            _ => {
                debug!("Ignoring {} in phase {:?}", if listening { "start" } else { "pause" }, slot.phase);
                return;
            }
        };

        if listening {
            engine.start();
        } else {
            engine.pause();
        }

        slot.phase = if listening { Phase::Running } else { Phase::Paused };
        self.shared.status.send_modify(|status| status.listening = listening);
    }

    /// Snapshot of the reactive state
    pub fn status(&self) -> VadStatus {
        self.shared.status.borrow().clone()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<VadStatus> {
        self.shared.status.subscribe()
    }

    pub fn listening(&self) -> bool {
        self.shared.status.borrow().listening
    }

    pub fn loading(&self) -> bool {
        self.shared.status.borrow().loading
    }

    pub fn errored(&self) -> Option<ErroredState> {
        self.shared.status.borrow().errored.clone()
    }

    pub fn user_speaking(&self) -> bool {
        self.shared.status.borrow().user_speaking
    }

    /// Current controller phase
    pub fn phase(&self) -> Phase {
        self.shared.slot.lock().phase
    }

    /// View options captured at first render
    pub fn view_options(&self) -> &ViewOptions {
        &self.view
    }

    /// Wait until the construction task has finished, whether the engine was
    /// adopted, rejected or discarded
    ///
    /// Resolves immediately if the adapter has not been mounted.
    pub async fn settled(&self) {
        if self.phase() == Phase::Idle {
            return;
        }

        let mut settled = self.shared.settled.subscribe();
        let _ = settled.wait_for(|done| *done).await;
    }
}

impl Drop for MicVad {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Internal frame handler: update the speaking signal, then forward
fn frame_processed_handler(
    shared: Weak<Shared>,
    reducer: SpeakingReducer,
    forward: Callback<FrameProbabilities>,
) -> Callback<FrameProbabilities> {
    Arc::new(move |probs: FrameProbabilities| {
        trace!("Frame processed: is_speech={:.3}", probs.is_speech);

        if let Some(shared) = shared.upgrade() {
            shared.status.send_if_modified(|status| {
                let speaking = reducer.reduce(status.user_speaking, probs.is_speech);
                let changed = speaking != status.user_speaking;
                status.user_speaking = speaking;
                changed
            });
        }

        forward(probs);
    })
}

/// Body of the mount effect
async fn setup(
    shared: &Shared,
    factory: &dyn EngineFactory,
    config: EngineConfig,
    epoch: u64,
    start_on_load: bool,
) {
    let result = factory.construct(config).await;

    let mut slot = shared.slot.lock();
    let superseded = slot.epoch != epoch;

    match result {
        Ok(engine) if superseded => {
            drop(slot);
            info!("Engine constructed after unmount (epoch {}); destroying it", epoch);
            engine.destroy();
        }
        Ok(engine) => {
            // Publish before starting: events may arrive as soon as start() runs
            slot.engine = Some(engine);
            slot.phase = Phase::Paused;
            shared.status.send_modify(|status| status.loading = false);

            if start_on_load {
                if let Some(engine) = slot.engine.as_ref() {
                    engine.start();
                }
                slot.phase = Phase::Running;
                shared.status.send_modify(|status| status.listening = true);
            }

            info!("VAD engine ready (listening: {})", start_on_load);
        }
        Err(e) if superseded => {
            debug!("Engine construction failed after unmount: {}", e);
        }
        Err(e) => {
            warn!("VAD engine construction failed: {}", e);
            slot.phase = Phase::Failed;

            shared.status.send_modify(|status| {
                status.loading = false;
                status.errored = Some(ErroredState {
                    message: e.to_string(),
                });
            });
        }
    }
}
