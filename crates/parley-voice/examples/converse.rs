//! Converse demo — full pipeline with env-selected backends.
//!
//! - **ASR**: WhisperRecognizer (feature `whisper` + `WHISPER_MODEL_PATH`),
//!   else HTTP transcription (`STT_API_KEY`/`PARLEY_API_KEY`), else scripted.
//! - **Chat**: HttpChat if `CHAT_API_KEY`/`PARLEY_API_KEY` is set, else a
//!   scripted canned reply.
//! - **TTS**: HttpSynthesizer if `TTS_API_KEY`/`PARLEY_API_KEY` is set,
//!   else silent placeholder.
//!
//! Set keys in `.env` to get a real conversation. Press Ctrl+C to stop.

use parley_voice::{
    create_recognizer, Backends, ChatBackend, HttpChat, HttpSynthesizer, NeutralClassifier,
    NullSink, PipelineConfig, PlaceholderSynthesizer, RodioSink, ScriptedChat, VoicePipeline,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🎭 Parley converse demo: speak, pause, listen.");

    let config = PipelineConfig::default();
    let sample_rate = config.audio.sample_rate;

    let chat: Box<dyn ChatBackend> = match HttpChat::from_env() {
        Ok(c) => {
            info!("Chat: OpenAI-compatible streaming backend");
            Box::new(c)
        }
        Err(e) => {
            info!("Chat: scripted fallback ({})", e);
            Box::new(ScriptedChat::new(vec![
                "I heard you. This is the scripted reply, one sentence at a time. \
                 Set CHAT_API_KEY for a real conversation."
                    .to_string(),
            ]))
        }
    };

    let mut pipeline = VoicePipeline::new(config)?;
    let backends = match HttpSynthesizer::from_env() {
        Ok(tts) => {
            info!("TTS: OpenAI-compatible speech backend");
            Backends {
                recognizer: Box::new(move |events| create_recognizer(sample_rate, events)),
                chat,
                emotion: Arc::new(NeutralClassifier),
                synthesizer: Box::new(tts),
                sink: Box::new(RodioSink::new()?),
            }
        }
        Err(e) => {
            info!("TTS: silent placeholder ({})", e);
            Backends {
                recognizer: Box::new(move |events| create_recognizer(sample_rate, events)),
                chat,
                emotion: Arc::new(NeutralClassifier),
                synthesizer: Box::new(PlaceholderSynthesizer),
                sink: Box::new(NullSink),
            }
        }
    };
    pipeline.start(backends)?;

    info!("🚀 Pipeline running. Ctrl+C to exit.");
    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc_handler(stop_tx);
    let _ = stop_rx.recv();

    pipeline.stop();
    Ok(())
}

/// Minimal Ctrl+C hook without an extra dependency.
fn ctrlc_handler(stop_tx: std::sync::mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let mut line = String::new();
        // Enter also stops, for terminals where Ctrl+C kills us anyway.
        let _ = std::io::stdin().read_line(&mut line);
        let _ = stop_tx.send(());
    });
}
