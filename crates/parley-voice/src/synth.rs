//! Speech synthesis queue, backends and playback.
//!
//! Sentences arrive as `SpeechTask`s and are synthesized strictly in
//! enqueue order by a single worker — parallel synthesis would let a
//! later sentence play before an earlier one. Playback applies
//! punctuation pacing: the task text is split on punctuation and a
//! configurable silence follows each fragment.

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One sentence to speak, in the order it was generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechTask {
    pub text: String,
    /// Emotion label carried from the turn, if classification succeeded.
    pub emotion: Option<String>,
}

/// Converts text into PCM samples at a fixed output sample rate.
pub trait SynthesizerBackend: Send {
    /// Synthesize one fragment. An empty result skips playback.
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<f32>>;

    /// Sample rate of the returned PCM.
    fn sample_rate(&self) -> u32;
}

/// Placeholder backend: produces no audio. Keeps the loop testable
/// without a synthesis model or API key.
#[derive(Debug, Default)]
pub struct PlaceholderSynthesizer;

impl SynthesizerBackend for PlaceholderSynthesizer {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<f32>> {
        Ok(Vec::new())
    }

    fn sample_rate(&self) -> u32 {
        24000
    }
}

/// OpenAI-compatible `/audio/speech` backend requesting raw PCM
/// (16-bit LE, 24 kHz). Reads `TTS_API_URL`, `TTS_API_KEY` (or
/// `PARLEY_API_KEY`), `TTS_MODEL`, `TTS_VOICE`.
pub struct HttpSynthesizer {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::blocking::Client,
}

impl HttpSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            client,
        })
    }

    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("PARLEY_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY or PARLEY_API_KEY".to_string())
            })?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        Self::new(base_url, api_key, model, voice)
    }
}

impl SynthesizerBackend for HttpSynthesizer {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "pcm",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "speech API error {}: {}",
                status, body
            )));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        // OpenAI PCM responses are fixed at 24 kHz.
        24000
    }
}

/// Punctuation-based pacing: silence inserted after each fragment.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub comma_delay: Duration,
    /// Delay after `.`, `!` or `?`.
    pub sentence_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            comma_delay: Duration::from_millis(150),
            sentence_delay: Duration::from_millis(300),
        }
    }
}

/// Split text on pacing punctuation, pairing each fragment with the
/// silence that should follow it.
pub fn pace_fragments(text: &str, pacing: &PacingConfig) -> Vec<(String, Duration)> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        let delay = match c {
            ',' => Some(pacing.comma_delay),
            '.' | '!' | '?' => Some(pacing.sentence_delay),
            _ => None,
        };
        if let Some(delay) = delay {
            let end = i + c.len_utf8();
            let fragment = text[start..end].trim();
            if !fragment.is_empty() {
                out.push((fragment.to_string(), delay));
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push((tail.to_string(), Duration::ZERO));
    }
    out
}

/// Where synthesized PCM goes. Abstracted so the worker is testable
/// without an output device.
pub trait AudioSink: Send {
    fn play(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<()>;
    /// Block until everything queued so far has finished playing.
    fn wait_idle(&self);
    fn stop(&self);
}

/// Rodio-backed sink on the default output device.
pub struct RodioSink {
    _stream: rodio::OutputStream,
    _handle: rodio::OutputStreamHandle,
    sink: rodio::Sink,
}

impl RodioSink {
    pub fn new() -> VoiceResult<Self> {
        let (stream, handle) = rodio::OutputStream::try_default()
            .map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink =
            rodio::Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!("🔊 Playback sink ready");
        Ok(Self {
            _stream: stream,
            _handle: handle,
            sink,
        })
    }
}

// cpal marks its streams !Send on every platform as a conservative
// blanket (the restriction is real only on some backends, e.g. Android
// AAudio). The sink is moved once into the synthesis worker thread and
// only ever used from there, so crossing threads at hand-off is sound.
unsafe impl Send for RodioSink {}

impl AudioSink for RodioSink {
    fn play(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let buffer = rodio::buffer::SamplesBuffer::new(1, sample_rate, samples.to_vec());
        self.sink.append(buffer);
        Ok(())
    }

    fn wait_idle(&self) {
        self.sink.sleep_until_end();
    }

    fn stop(&self) {
        self.sink.stop();
    }
}

/// Sink that discards audio; used with the placeholder backend.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _samples: &[f32], _sample_rate: u32) -> VoiceResult<()> {
        Ok(())
    }
    fn wait_idle(&self) {}
    fn stop(&self) {}
}

enum QueueItem {
    Task(SpeechTask),
    /// Turn boundary: acknowledged once every prior task finished playing.
    EndOfTurn(oneshot::Sender<()>),
}

/// Producer side of the synthesis queue. `enqueue` never blocks.
#[derive(Clone)]
pub struct SpeechSynthesisQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl SpeechSynthesisQueue {
    /// Create the queue, returning the receiver for the single worker.
    pub fn new() -> (Self, SynthesisReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, SynthesisReceiver { rx })
    }

    pub fn enqueue(&self, task: SpeechTask) -> VoiceResult<()> {
        self.tx
            .send(QueueItem::Task(task))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Mark a turn boundary. The returned receiver resolves when every
    /// task enqueued before it has been synthesized and played.
    pub fn end_of_turn(&self) -> VoiceResult<oneshot::Receiver<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(QueueItem::EndOfTurn(done_tx))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        Ok(done_rx)
    }
}

/// Consumer half, moved into the one worker thread.
pub struct SynthesisReceiver {
    rx: mpsc::UnboundedReceiver<QueueItem>,
}

/// Run the synthesis worker until the queue closes. Exactly one worker
/// consumes the queue; tasks are processed strictly in enqueue order.
/// Synthesis failures skip the task and the queue continues.
pub fn run_synthesis_worker(
    mut receiver: SynthesisReceiver,
    backend: Box<dyn SynthesizerBackend>,
    sink: Box<dyn AudioSink>,
    pacing: PacingConfig,
) {
    info!("🔄 Synthesis worker started");
    while let Some(item) = receiver.rx.blocking_recv() {
        match item {
            QueueItem::Task(task) => {
                debug!("Synthesizing: {:?}", task.text);
                for (fragment, delay) in pace_fragments(&task.text, &pacing) {
                    match backend.synthesize(&fragment) {
                        Ok(samples) => {
                            if let Err(e) = sink.play(&samples, backend.sample_rate()) {
                                warn!("Playback failed, skipping fragment: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("Synthesis failed, skipping fragment: {}", e);
                            continue;
                        }
                    }
                    sink.wait_idle();
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
            QueueItem::EndOfTurn(done) => {
                sink.wait_idle();
                let _ = done.send(());
            }
        }
    }
    info!("⏹️ Synthesis worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Backend that records what it was asked to speak.
    struct Recording {
        spoken: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    impl SynthesizerBackend for Recording {
        fn synthesize(&self, text: &str) -> VoiceResult<Vec<f32>> {
            if self.fail_on.as_deref() == Some(text) {
                return Err(VoiceError::Synthesis("scripted failure".into()));
            }
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(vec![0.0; 16])
        }
        fn sample_rate(&self) -> u32 {
            24000
        }
    }

    fn run_tasks(tasks: Vec<&str>, fail_on: Option<&str>) -> Vec<String> {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let backend = Recording {
            spoken: Arc::clone(&spoken),
            fail_on: fail_on.map(String::from),
        };
        let (queue, receiver) = SpeechSynthesisQueue::new();
        for t in tasks {
            queue
                .enqueue(SpeechTask {
                    text: t.to_string(),
                    emotion: None,
                })
                .unwrap();
        }
        let done = queue.end_of_turn().unwrap();
        drop(queue);
        run_synthesis_worker(
            receiver,
            Box::new(backend),
            Box::new(NullSink),
            PacingConfig {
                comma_delay: Duration::ZERO,
                sentence_delay: Duration::ZERO,
            },
        );
        assert!(done.blocking_recv().is_ok());
        Arc::try_unwrap(spoken).unwrap().into_inner().unwrap()
    }

    #[test]
    fn fifo_order_is_preserved() {
        let spoken = run_tasks(vec!["One.", "Two.", "Three."], None);
        assert_eq!(spoken, vec!["One.", "Two.", "Three."]);
    }

    #[test]
    fn failed_task_is_skipped_queue_continues() {
        let spoken = run_tasks(vec!["Good.", "Bad.", "Also good."], Some("Bad."));
        assert_eq!(spoken, vec!["Good.", "Also good."]);
    }

    #[test]
    fn pacing_splits_on_punctuation() {
        let pacing = PacingConfig::default();
        let fragments = pace_fragments("Well, hello there. Ready?", &pacing);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0], ("Well,".to_string(), pacing.comma_delay));
        assert_eq!(
            fragments[1],
            ("hello there.".to_string(), pacing.sentence_delay)
        );
        assert_eq!(fragments[2], ("Ready?".to_string(), pacing.sentence_delay));
    }

    #[test]
    fn pacing_keeps_unpunctuated_tail() {
        let fragments = pace_fragments("no punctuation", &PacingConfig::default());
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].0, "no punctuation");
        assert!(fragments[0].1.is_zero());
    }

    #[test]
    fn placeholder_backend_is_silent() {
        let backend = PlaceholderSynthesizer;
        assert!(backend.synthesize("anything").unwrap().is_empty());
    }
}
