/// Adapter configuration
///
/// Callers supply one partial record covering both view options (how the
/// adapter behaves) and engine options (passed through to the engine). The
/// partitioner fills defaults and routes each field to its group using two
/// fixed key sets.

use crate::callback::Callback;
use crate::engine::{EngineError, FrameProbabilities};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Keys owned by the view group
pub const VIEW_OPTION_KEYS: &[&str] = &["start_on_load", "user_speaking_threshold"];

/// Keys owned by the engine group
pub const ENGINE_OPTION_KEYS: &[&str] = &[
    "positive_speech_threshold",
    "negative_speech_threshold",
    "pre_speech_pad_frames",
    "redemption_frames",
    "frame_samples",
    "min_speech_frames",
    "submit_user_speech_on_pause",
    "on_frame_processed",
    "on_speech_start",
    "on_speech_frames",
    "on_speech_end",
    "on_vad_misfire",
];

/// Which side of the partition a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionGroup {
    View,
    Engine,
}

/// Route a key to its group. Unknown keys are dropped.
pub fn route_key(key: &str) -> Option<OptionGroup> {
    if VIEW_OPTION_KEYS.contains(&key) {
        Some(OptionGroup::View)
    } else if ENGINE_OPTION_KEYS.contains(&key) {
        Some(OptionGroup::Engine)
    } else {
        None
    }
}

/// Split a set of keys into (view, engine), dropping unknown keys
pub fn partition_keys<'a, I>(keys: I) -> (Vec<&'a str>, Vec<&'a str>)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut view = Vec::new();
    let mut engine = Vec::new();

    for key in keys {
        match route_key(key) {
            Some(OptionGroup::View) => view.push(key),
            Some(OptionGroup::Engine) => engine.push(key),
            None => debug!("Dropping unrecognized option: {}", key),
        }
    }

    (view, engine)
}

/// Options consumed by the adapter itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewOptions {
    /// Start the engine as soon as it is constructed
    pub start_on_load: bool,

    /// Speech probability above which the user counts as speaking (0.0 - 1.0)
    pub user_speaking_threshold: f32,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            start_on_load: true,
            user_speaking_threshold: 0.6,
        }
    }
}

/// Engine tuning values, passed through untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Probability above which a frame counts as speech
    pub positive_speech_threshold: f32,

    /// Probability below which a frame counts as silence
    pub negative_speech_threshold: f32,

    /// Frames of audio prepended to a detected segment
    pub pre_speech_pad_frames: usize,

    /// Silent frames tolerated before a segment ends
    pub redemption_frames: usize,

    /// Samples per frame
    pub frame_samples: usize,

    /// Segments shorter than this are reported as misfires
    pub min_speech_frames: usize,

    /// Emit the pending segment when paused mid-speech
    pub submit_user_speech_on_pause: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            positive_speech_threshold: 0.5,
            negative_speech_threshold: 0.35,
            pre_speech_pad_frames: 1,
            redemption_frames: 8,
            frame_samples: 1536,
            min_speech_frames: 3,
            submit_user_speech_on_pause: false,
        }
    }
}

impl EngineSettings {
    /// Validate configuration parameters
    ///
    /// Engines call this during construction so bad values surface as a
    /// construction failure.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.positive_speech_threshold) {
            return Err(EngineError::InvalidConfig(
                "positive_speech_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.negative_speech_threshold) {
            return Err(EngineError::InvalidConfig(
                "negative_speech_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.negative_speech_threshold > self.positive_speech_threshold {
            return Err(EngineError::InvalidConfig(
                "negative_speech_threshold must not exceed positive_speech_threshold".to_string(),
            ));
        }

        if self.frame_samples == 0 {
            return Err(EngineError::InvalidConfig(
                "frame_samples must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Caller-supplied engine event handlers
#[derive(Clone, Default)]
pub struct EngineHandlers {
    pub on_frame_processed: Option<Callback<FrameProbabilities>>,
    pub on_speech_start: Option<Callback<()>>,
    pub on_speech_frames: Option<Callback<Vec<f32>>>,
    pub on_speech_end: Option<Callback<Vec<f32>>>,
    pub on_vad_misfire: Option<Callback<()>>,
}

impl fmt::Debug for EngineHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandlers")
            .field("on_frame_processed", &self.on_frame_processed.is_some())
            .field("on_speech_start", &self.on_speech_start.is_some())
            .field("on_speech_frames", &self.on_speech_frames.is_some())
            .field("on_speech_end", &self.on_speech_end.is_some())
            .field("on_vad_misfire", &self.on_vad_misfire.is_some())
            .finish()
    }
}

/// Fully defaulted engine group
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub settings: EngineSettings,
    pub handlers: EngineHandlers,
}

/// Partial configuration as supplied by the caller
///
/// Every field is optional. Handler fields are never read from serialized
/// input.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct MicVadOptions {
    pub start_on_load: Option<bool>,
    pub user_speaking_threshold: Option<f32>,

    pub positive_speech_threshold: Option<f32>,
    pub negative_speech_threshold: Option<f32>,
    pub pre_speech_pad_frames: Option<usize>,
    pub redemption_frames: Option<usize>,
    pub frame_samples: Option<usize>,
    pub min_speech_frames: Option<usize>,
    pub submit_user_speech_on_pause: Option<bool>,

    #[serde(skip)]
    pub on_frame_processed: Option<Callback<FrameProbabilities>>,
    #[serde(skip)]
    pub on_speech_start: Option<Callback<()>>,
    #[serde(skip)]
    pub on_speech_frames: Option<Callback<Vec<f32>>>,
    #[serde(skip)]
    pub on_speech_end: Option<Callback<Vec<f32>>>,
    #[serde(skip)]
    pub on_vad_misfire: Option<Callback<()>>,
}

impl fmt::Debug for MicVadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicVadOptions")
            .field("keys", &self.present_keys())
            .finish()
    }
}

impl MicVadOptions {
    /// Parse options from a JSON document
    ///
    /// Keys outside both groups are dropped before deserializing.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: Map<String, Value> = serde_json::from_str(json)?;
        let (view, engine) = partition_keys(raw.keys().map(String::as_str));

        let routed: Map<String, Value> = view
            .into_iter()
            .chain(engine)
            .filter_map(|key| raw.get(key).map(|value| (key.to_string(), value.clone())))
            .collect();

        serde_json::from_value(Value::Object(routed))
    }

    /// Load options from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let options = Self::from_json(&contents)?;
        debug!("Loaded options from {}: {:?}", path.display(), options);
        Ok(options)
    }

    /// Whether the caller supplied `key`. Unknown keys are never set.
    pub fn is_set(&self, key: &str) -> bool {
        match key {
            "start_on_load" => self.start_on_load.is_some(),
            "user_speaking_threshold" => self.user_speaking_threshold.is_some(),
            "positive_speech_threshold" => self.positive_speech_threshold.is_some(),
            "negative_speech_threshold" => self.negative_speech_threshold.is_some(),
            "pre_speech_pad_frames" => self.pre_speech_pad_frames.is_some(),
            "redemption_frames" => self.redemption_frames.is_some(),
            "frame_samples" => self.frame_samples.is_some(),
            "min_speech_frames" => self.min_speech_frames.is_some(),
            "submit_user_speech_on_pause" => self.submit_user_speech_on_pause.is_some(),
            "on_frame_processed" => self.on_frame_processed.is_some(),
            "on_speech_start" => self.on_speech_start.is_some(),
            "on_speech_frames" => self.on_speech_frames.is_some(),
            "on_speech_end" => self.on_speech_end.is_some(),
            "on_vad_misfire" => self.on_vad_misfire.is_some(),
            _ => false,
        }
    }

    /// Keys the caller actually supplied, view group first
    pub fn present_keys(&self) -> Vec<&'static str> {
        VIEW_OPTION_KEYS
            .iter()
            .chain(ENGINE_OPTION_KEYS)
            .copied()
            .filter(|key| self.is_set(key))
            .collect()
    }

    /// Fill defaults and split into the view and engine groups
    pub fn partition(&self) -> (ViewOptions, EngineOptions) {
        let (view, engine) = partition_keys(self.present_keys());
        debug!("Supplied options: view {:?}, engine {:?}", view, engine);

        partition(self, &ViewOptions::default(), &EngineSettings::default())
    }
}

/// Fill every field from `options`, falling back to the given defaults, and
/// route it to its group
pub fn partition(
    options: &MicVadOptions,
    view_defaults: &ViewOptions,
    engine_defaults: &EngineSettings,
) -> (ViewOptions, EngineOptions) {
    let view = ViewOptions {
        start_on_load: options.start_on_load.unwrap_or(view_defaults.start_on_load),
        user_speaking_threshold: options
            .user_speaking_threshold
            .unwrap_or(view_defaults.user_speaking_threshold),
    };

    let settings = EngineSettings {
        positive_speech_threshold: options
            .positive_speech_threshold
            .unwrap_or(engine_defaults.positive_speech_threshold),
        negative_speech_threshold: options
            .negative_speech_threshold
            .unwrap_or(engine_defaults.negative_speech_threshold),
        pre_speech_pad_frames: options
            .pre_speech_pad_frames
            .unwrap_or(engine_defaults.pre_speech_pad_frames),
        redemption_frames: options
            .redemption_frames
            .unwrap_or(engine_defaults.redemption_frames),
        frame_samples: options.frame_samples.unwrap_or(engine_defaults.frame_samples),
        min_speech_frames: options
            .min_speech_frames
            .unwrap_or(engine_defaults.min_speech_frames),
        submit_user_speech_on_pause: options
            .submit_user_speech_on_pause
            .unwrap_or(engine_defaults.submit_user_speech_on_pause),
    };

    let handlers = EngineHandlers {
        on_frame_processed: options.on_frame_processed.clone(),
        on_speech_start: options.on_speech_start.clone(),
        on_speech_frames: options.on_speech_frames.clone(),
        on_speech_end: options.on_speech_end.clone(),
        on_vad_misfire: options.on_vad_misfire.clone(),
    };

    (view, EngineOptions { settings, handlers })
}
