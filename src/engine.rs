/// Voice activity engine interface
///
/// The engine (microphone capture, frame buffering, speech inference) lives
/// outside this crate. The adapter only needs to construct it asynchronously,
/// start, pause and destroy it, and receive its events.

use crate::callback::Callback;
use crate::options::EngineSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Engine setup failed: {0}")]
    Setup(String),
}

/// Per-frame classifier output
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameProbabilities {
    /// Probability that the frame contains speech (0.0 - 1.0)
    pub is_speech: f32,

    /// Probability that the frame does not contain speech
    pub not_speech: f32,
}

impl FrameProbabilities {
    pub fn new(is_speech: f32) -> Self {
        Self {
            is_speech,
            not_speech: 1.0 - is_speech,
        }
    }
}

/// Event subscriptions handed to the engine at construction
///
/// These are wired once; the adapter fills them with stable handles.
#[derive(Clone)]
pub struct EngineCallbacks {
    pub on_frame_processed: Callback<FrameProbabilities>,
    pub on_speech_start: Callback<()>,
    pub on_speech_frames: Callback<Vec<f32>>,
    pub on_speech_end: Callback<Vec<f32>>,
    pub on_vad_misfire: Callback<()>,
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks").finish_non_exhaustive()
    }
}

/// Everything an engine needs to be constructed
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub settings: EngineSettings,
    pub callbacks: EngineCallbacks,
}

/// A constructed engine
///
/// All methods are synchronous and must tolerate being called on an engine
/// already in the target state. They are invoked with the adapter's lock
/// held. Events may be delivered while they run, from any thread, but must not
/// wait on a caller handler that re-enters the adapter's controls.
#[cfg_attr(test, mockall::automock)]
pub trait EngineHandle: Send + Sync {
    /// Begin (or resume) delivering frame events
    fn start(&self);

    /// Stop delivering events without releasing resources
    fn pause(&self);

    /// Release all resources. No method is called on the handle afterwards.
    fn destroy(&self);
}

/// Boxed engine handle as produced by a factory
pub type BoxedEngine = Box<dyn EngineHandle>;

/// Asynchronous engine constructor
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    /// Construct an engine. Fails on invalid configuration or when the audio
    /// source cannot be acquired.
    async fn construct(&self, config: EngineConfig) -> Result<BoxedEngine, EngineError>;
}
