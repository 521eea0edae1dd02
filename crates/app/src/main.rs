//! Companion voice pipeline entry point
//!
//! Wires the audio device and stand-in collaborators into the
//! orchestrator and runs it until ctrl-c. Production deployments
//! replace the loopback collaborators with real wake-word, speech
//! channel, reasoning, and motion implementations behind the same
//! traits.

mod loopback;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use companion_audio::DeviceAudio;
use companion_config::{load_settings, PersonaRegistry, Settings};
use companion_pipeline::{Collaborators, EnergySpeechClassifier, NoopObserver, VoicePipeline};

use loopback::{
    confirm_chunks, EchoReasoning, LevelTriggerWake, LogMotionSink, LoopbackChannelFactory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > COMPANION_CONFIG file > built-in defaults
    let config_path = std::env::var("COMPANION_CONFIG").ok();
    let settings = match load_settings(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("warning: failed to load config: {e}; using defaults");
            Settings::default()
        }
    };

    init_tracing();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = config_path.as_deref().unwrap_or("default"),
        "starting companion voice pipeline"
    );

    let personas = PersonaRegistry::load(
        &settings.personas.table_path,
        settings.personas.prompt_dir.clone(),
    )
    .with_context(|| {
        format!(
            "loading persona table {}",
            settings.personas.table_path.display()
        )
    })?;
    tracing::info!(
        personas = personas.len(),
        default = %settings.personas.default_persona,
        "persona table loaded"
    );

    let audio = Arc::new(DeviceAudio::open(&settings.audio).context("opening audio device")?);

    let default_wake_model = personas
        .get_by_name(&settings.personas.default_persona)
        .map(|p| p.wake_word_model_id.clone())
        .context("default persona not in the persona table")?;
    let wake = Arc::new(LevelTriggerWake::new(
        default_wake_model,
        settings.segmenter.energy_floor_db,
        confirm_chunks(settings.segmenter.speech_confirm_ms, audio.as_ref()),
    ));
    let classifier = Arc::new(EnergySpeechClassifier::new(
        settings.segmenter.energy_floor_db,
    ));

    let mut pipeline = VoicePipeline::new(
        settings,
        personas,
        Collaborators {
            audio,
            wake,
            classifier,
            channel_factory: Arc::new(LoopbackChannelFactory),
            reasoning: Arc::new(EchoReasoning::default()),
            motion: Arc::new(LogMotionSink),
            observer: Arc::new(NoopObserver),
        },
    )
    .context("constructing pipeline")?;

    let handle = pipeline.handle();
    let mut pipeline_task = tokio::spawn(async move { pipeline.run().await });

    tokio::select! {
        result = &mut pipeline_task => {
            result.context("pipeline task panicked")??;
            tracing::info!("pipeline stopped on its own");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            handle.shutdown().await;
            pipeline_task.await.context("pipeline task panicked")??;
        }
    }

    tracing::info!("companion voice pipeline stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "companion=info".into());

    let fmt_layer = if std::env::var("COMPANION_LOG_JSON").is_ok() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
