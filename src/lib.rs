/// Microphone VAD adapter library
///
/// Binds an asynchronously constructed voice-activity engine to reactive UI
/// state: option partitioning, stable event handlers, a mount/unmount
/// lifecycle with epoch-based cancellation, and a derived speaking signal.

pub mod callback;
pub mod engine;
pub mod lifecycle;
pub mod options;
pub mod replay;
pub mod speaking;

// Re-export main types
pub use callback::{callback, Callback, EventCallback};
pub use engine::{
    BoxedEngine, EngineCallbacks, EngineConfig, EngineError, EngineFactory, EngineHandle,
    FrameProbabilities,
};
pub use lifecycle::{ErroredState, MicVad, Phase, RunState, VadStatus};
pub use options::{
    partition, partition_keys, route_key, EngineHandlers, EngineOptions, EngineSettings,
    MicVadOptions, OptionGroup, ViewOptions, ENGINE_OPTION_KEYS, VIEW_OPTION_KEYS,
};
pub use replay::{ReplayEngine, ReplayError, ReplayEvent, ReplayFactory, ReplayTrace};
pub use speaking::SpeakingReducer;
