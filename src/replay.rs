/// Trace replay engine
///
/// Plays back a recorded sequence of engine events at a fixed frame interval.
/// Used to drive the adapter without a microphone: the demo binary and the
/// end-to-end tests construct it through the regular factory interface.

use crate::engine::{
    BoxedEngine, EngineCallbacks, EngineConfig, EngineError, EngineFactory, EngineHandle,
    FrameProbabilities,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// Default spacing between replayed events (one 1536-sample frame at 16kHz)
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 96;

/// Longest accepted spacing between replayed events
pub const MAX_FRAME_INTERVAL_MS: u64 = 60_000;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Failed to read trace: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse trace: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Trace contains no events")]
    EmptyTrace,

    #[error("frame_interval_ms must be between 1 and {MAX_FRAME_INTERVAL_MS}, got {0}")]
    InvalidInterval(u64),

    #[error("Event {index}: speech probability {value} outside 0.0 - 1.0")]
    ProbabilityOutOfRange { index: usize, value: f32 },
}

/// One recorded engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    Frame { is_speech: f32 },
    SpeechStart,
    SpeechFrames { audio: Vec<f32> },
    SpeechEnd { audio: Vec<f32> },
    Misfire,
}

/// Recorded event sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayTrace {
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    pub events: Vec<ReplayEvent>,
}

fn default_frame_interval_ms() -> u64 {
    DEFAULT_FRAME_INTERVAL_MS
}

impl ReplayTrace {
    pub fn new(frame_interval_ms: u64, events: Vec<ReplayEvent>) -> Self {
        Self {
            frame_interval_ms,
            events,
        }
    }

    /// Trace of per-frame probabilities only
    pub fn from_probabilities(frame_interval_ms: u64, probabilities: &[f32]) -> Self {
        let events = probabilities
            .iter()
            .map(|&is_speech| ReplayEvent::Frame { is_speech })
            .collect();
        Self::new(frame_interval_ms, events)
    }

    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        let trace: Self = serde_json::from_str(json)?;
        trace.validate()?;
        Ok(trace)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.events.is_empty() {
            return Err(ReplayError::EmptyTrace);
        }

        if self.frame_interval_ms == 0 || self.frame_interval_ms > MAX_FRAME_INTERVAL_MS {
            return Err(ReplayError::InvalidInterval(self.frame_interval_ms));
        }

        for (index, event) in self.events.iter().enumerate() {
            if let ReplayEvent::Frame { is_speech } = event {
                if !(0.0..=1.0).contains(is_speech) {
                    return Err(ReplayError::ProbabilityOutOfRange {
                        index,
                        value: *is_speech,
                    });
                }
            }
        }

        Ok(())
    }

    /// Wall-clock time to play the whole trace without pauses
    pub fn duration(&self) -> Duration {
        let events = u64::try_from(self.events.len()).unwrap_or(u64::MAX);
        Duration::from_millis(self.frame_interval_ms.saturating_mul(events))
    }
}

/// Factory producing [`ReplayEngine`]s for one trace
#[derive(Debug, Clone)]
pub struct ReplayFactory {
    trace: ReplayTrace,
    construct_delay: Duration,
}

impl ReplayFactory {
    pub fn new(trace: ReplayTrace) -> Self {
        Self {
            trace,
            construct_delay: Duration::ZERO,
        }
    }

    /// Simulate slow setup (model download, permission prompt)
    pub fn with_construct_delay(mut self, delay: Duration) -> Self {
        self.construct_delay = delay;
        self
    }

    pub fn trace(&self) -> &ReplayTrace {
        &self.trace
    }
}

#[async_trait]
impl EngineFactory for ReplayFactory {
    async fn construct(&self, config: EngineConfig) -> Result<BoxedEngine, EngineError> {
        config.settings.validate()?;
        self.trace
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        if !self.construct_delay.is_zero() {
            tokio::time::sleep(self.construct_delay).await;
        }

        info!(
            "Replay engine constructed ({} events, {}ms interval)",
            self.trace.events.len(),
            self.trace.frame_interval_ms
        );

        Ok(Box::new(ReplayEngine::spawn(
            self.trace.clone(),
            config.callbacks,
        )))
    }
}

/// Engine that replays a trace; starts paused
pub struct ReplayEngine {
    running: watch::Sender<bool>,
    destroyed: Arc<AtomicBool>,
    playback: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayEngine {
    fn spawn(trace: ReplayTrace, callbacks: EngineCallbacks) -> Self {
        let (running, running_rx) = watch::channel(false);
        let destroyed = Arc::new(AtomicBool::new(false));

        let playback = tokio::spawn(play(
            trace,
            callbacks,
            running_rx,
            Arc::clone(&destroyed),
        ));

        Self {
            running,
            destroyed,
            playback: Mutex::new(Some(playback)),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl EngineHandle for ReplayEngine {
    fn start(&self) {
        if self.is_destroyed() {
            return;
        }
        self.running.send_replace(true);
        debug!("Replay engine started");
    }

    fn pause(&self) {
        if self.is_destroyed() {
            return;
        }
        self.running.send_replace(false);
        debug!("Replay engine paused");
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.send_replace(false);
        if let Some(playback) = self.playback.lock().take() {
            playback.abort();
        }
        debug!("Replay engine destroyed");
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn play(
    trace: ReplayTrace,
    callbacks: EngineCallbacks,
    mut running: watch::Receiver<bool>,
    destroyed: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(trace.frame_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for event in trace.events {
        ticker.tick().await;

        // Hold the event while paused
        let open = running.wait_for(|running| *running).await.is_ok();
        if !open || destroyed.load(Ordering::Acquire) {
            return;
        }

        trace!("Replaying {:?}", event);
        dispatch(&callbacks, event);
    }

    debug!("Replay finished");
}

fn dispatch(callbacks: &EngineCallbacks, event: ReplayEvent) {
    match event {
        ReplayEvent::Frame { is_speech } => {
            (callbacks.on_frame_processed)(FrameProbabilities::new(is_speech))
        }
        ReplayEvent::SpeechStart => (callbacks.on_speech_start)(()),
        ReplayEvent::SpeechFrames { audio } => (callbacks.on_speech_frames)(audio),
        ReplayEvent::SpeechEnd { audio } => (callbacks.on_speech_end)(audio),
        ReplayEvent::Misfire => (callbacks.on_vad_misfire)(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{callback, Callback};
    use crate::options::EngineSettings;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn noop<A: 'static>() -> Callback<A> {
        callback(|_: A| {})
    }

    fn config_with_frames(tx: mpsc::UnboundedSender<f32>) -> EngineConfig {
        EngineConfig {
            settings: EngineSettings::default(),
            callbacks: EngineCallbacks {
                on_frame_processed: callback(move |probs: FrameProbabilities| {
                    let _ = tx.send(probs.is_speech);
                }),
                on_speech_start: noop(),
                on_speech_frames: noop(),
                on_speech_end: noop(),
                on_vad_misfire: noop(),
            },
        }
    }

    #[test]
    fn test_trace_from_json() {
        let trace = ReplayTrace::from_json(
            r#"{
                "frame_interval_ms": 10,
                "events": [
                    {"type": "frame", "is_speech": 0.9},
                    {"type": "speech_start"},
                    {"type": "speech_end", "audio": [0.1, 0.2]},
                    {"type": "misfire"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(trace.events.len(), 4);
        assert_eq!(trace.events[1], ReplayEvent::SpeechStart);
        assert_eq!(trace.duration(), Duration::from_millis(40));
    }

    #[test]
    fn test_trace_default_interval() {
        let trace = ReplayTrace::from_json(r#"{"events": [{"type": "misfire"}]}"#).unwrap();
        assert_eq!(trace.frame_interval_ms, DEFAULT_FRAME_INTERVAL_MS);
    }

    #[test]
    fn test_trace_validation() {
        assert!(matches!(
            ReplayTrace::new(10, vec![]).validate(),
            Err(ReplayError::EmptyTrace)
        ));
        assert!(matches!(
            ReplayTrace::from_probabilities(0, &[0.5]).validate(),
            Err(ReplayError::InvalidInterval(0))
        ));
        assert!(matches!(
            ReplayTrace::from_probabilities(10, &[0.5, 1.2]).validate(),
            Err(ReplayError::ProbabilityOutOfRange { index: 1, .. })
        ));
    }

    #[test]
    fn test_huge_interval_is_rejected() {
        let json = format!(
            r#"{{"frame_interval_ms": {}, "events": [{{"type": "misfire"}}, {{"type": "misfire"}}]}}"#,
            u64::MAX / 2 + 1
        );

        assert!(matches!(
            ReplayTrace::from_json(&json),
            Err(ReplayError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_duration_saturates() {
        let trace = ReplayTrace::new(u64::MAX / 2 + 1, vec![ReplayEvent::Misfire; 4]);

        assert!(trace.validate().is_err());
        assert_eq!(trace.duration(), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn test_construct_rejects_invalid_settings() {
        let factory = ReplayFactory::new(ReplayTrace::from_probabilities(1, &[0.5]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = config_with_frames(tx);
        config.settings.frame_samples = 0;

        let result = factory.construct(config).await;
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_engine_starts_paused() {
        let factory = ReplayFactory::new(ReplayTrace::from_probabilities(1, &[0.2, 0.8]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = factory.construct(config_with_frames(tx)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        engine.start();
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(0.2));
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(0.8));

        engine.destroy();
    }

    #[tokio::test]
    async fn test_destroy_stops_delivery() {
        let probabilities = vec![0.5; 1000];
        let factory = ReplayFactory::new(ReplayTrace::from_probabilities(1, &probabilities));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = factory.construct(config_with_frames(tx)).await.unwrap();

        engine.start();
        timeout(WAIT, rx.recv()).await.unwrap();

        engine.destroy();
        engine.start();

        // Channel closes once the aborted playback task drops its callbacks
        while timeout(WAIT, rx.recv()).await.unwrap().is_some() {}
    }
}
