/// VAD replay service binary
///
/// Mounts the microphone VAD adapter over a recorded event trace and logs
/// state changes and speech segments as they arrive.

use anyhow::Context;
use mic_vad::{callback, MicVad, MicVadOptions, ReplayFactory, ReplayTrace};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Extra time allowed after the trace's nominal duration
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

struct ReplayConfig {
    trace: ReplayTrace,
    options: MicVadOptions,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mic_vad=debug,mic_vad_replay=info")),
        )
        .init();

    info!("Starting microphone VAD replay");

    // Load configuration
    let config = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let run_for = config.trace.duration() + SHUTDOWN_GRACE;
    let factory = Arc::new(ReplayFactory::new(config.trace));
    let vad = MicVad::spawn(factory, with_handlers(config.options));
    let mut status = vad.subscribe();

    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);

    // Event loop
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                info!(
                    "Status: {:?} (user_speaking={})",
                    snapshot.run_state(),
                    snapshot.user_speaking
                );
                if let Some(errored) = snapshot.errored {
                    error!("VAD failed: {}", errored.message);
                    break;
                }
            }
            _ = &mut deadline => {
                info!("Trace finished");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // Cleanup
    vad.unmount();

    info!("Microphone VAD replay stopped");
}

fn with_handlers(options: MicVadOptions) -> MicVadOptions {
    MicVadOptions {
        on_speech_start: Some(callback(|_: ()| info!("Speech started"))),
        on_speech_end: Some(callback(|audio: Vec<f32>| {
            info!("Speech ended ({} samples)", audio.len())
        })),
        on_vad_misfire: Some(callback(|_: ()| info!("Misfire: segment too short"))),
        ..options
    }
}

/// Load configuration from the environment
fn load_config() -> anyhow::Result<ReplayConfig> {
    let trace_path = std::env::var("MIC_VAD_TRACE").context("MIC_VAD_TRACE must point to a trace file")?;

    let trace = ReplayTrace::from_file(&trace_path)
        .with_context(|| format!("Failed to load trace {}", trace_path))?;

    let mut options = match std::env::var("MIC_VAD_OPTIONS") {
        Ok(path) => MicVadOptions::from_file(&path)
            .with_context(|| format!("Failed to load options {}", path))?,
        Err(_) => MicVadOptions::default(),
    };

    if let Ok(value) = std::env::var("MIC_VAD_START_ON_LOAD") {
        options.start_on_load = Some(value.parse().context("MIC_VAD_START_ON_LOAD must be true or false")?);
    }

    if let Ok(value) = std::env::var("MIC_VAD_SPEAKING_THRESHOLD") {
        options.user_speaking_threshold =
            Some(value.parse().context("MIC_VAD_SPEAKING_THRESHOLD must be a number")?);
    }

    Ok(ReplayConfig { trace, options })
}
