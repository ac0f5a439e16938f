//! Streaming speech recognition behind a uniform span contract.
//!
//! A recognizer accumulates one span of audio between `start_span()` and
//! `end_span()` and reports results over an event channel: zero or more
//! `Partial`s followed by exactly one `Final` per span (empty string when
//! nothing was recognized). Backends are interchangeable: a local Whisper
//! model (feature `whisper`), an OpenAI-compatible transcription API, and
//! a scripted backend for tests and dry runs.

use crate::error::{VoiceError, VoiceResult};
use crate::wav::encode_wav;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// Results emitted by a recognizer over its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Best-effort intermediate transcript; may be superseded.
    Partial { text: String },
    /// Authoritative transcript for the span. Exactly one per span.
    Final { text: String },
}

/// Capability every recognizer backend must satisfy.
///
/// `end_span()` must emit exactly one `Final` event even when inference
/// fails (an empty one), so the turn loop never stalls waiting on a span
/// that errored out. The error is still returned for logging.
pub trait StreamingRecognizer: Send {
    /// Reset internal accumulation for a new span.
    fn start_span(&mut self);

    /// Append audio to the open span. May emit partial events.
    fn process_chunk(&mut self, samples: &[f32]) -> VoiceResult<()>;

    /// Finalize the span and emit its `Final` event.
    fn end_span(&mut self) -> VoiceResult<()>;
}

fn send_event(
    tx: &mpsc::UnboundedSender<RecognizerEvent>,
    event: RecognizerEvent,
) -> VoiceResult<()> {
    tx.send(event)
        .map_err(|e| VoiceError::ChannelSend(e.to_string()))
}

/// Scripted recognizer: records every chunk fed to it and replays
/// configured final transcripts. Used by tests and the offline demo.
pub struct ScriptedRecognizer {
    events: mpsc::UnboundedSender<RecognizerEvent>,
    finals: VecDeque<String>,
    current: Vec<f32>,
    /// Every completed span's exact sample sequence, for inspection.
    spans: Arc<Mutex<Vec<Vec<f32>>>>,
    /// Emit one partial per span once any audio has arrived.
    emit_partials: bool,
    partial_sent: bool,
}

impl ScriptedRecognizer {
    pub fn new(events: mpsc::UnboundedSender<RecognizerEvent>) -> Self {
        Self {
            events,
            finals: VecDeque::new(),
            current: Vec::new(),
            spans: Arc::new(Mutex::new(Vec::new())),
            emit_partials: false,
            partial_sent: false,
        }
    }

    /// Queue transcripts to emit as finals, one per span in order.
    /// When the queue runs dry, finals are empty strings.
    pub fn with_finals(mut self, finals: Vec<String>) -> Self {
        self.finals = finals.into();
        self
    }

    pub fn with_partials(mut self) -> Self {
        self.emit_partials = true;
        self
    }

    /// Shared handle to the recorded spans.
    pub fn spans(&self) -> Arc<Mutex<Vec<Vec<f32>>>> {
        Arc::clone(&self.spans)
    }
}

impl StreamingRecognizer for ScriptedRecognizer {
    fn start_span(&mut self) {
        self.current.clear();
        self.partial_sent = false;
    }

    fn process_chunk(&mut self, samples: &[f32]) -> VoiceResult<()> {
        self.current.extend_from_slice(samples);
        if self.emit_partials && !self.partial_sent {
            self.partial_sent = true;
            send_event(
                &self.events,
                RecognizerEvent::Partial {
                    text: "...".to_string(),
                },
            )?;
        }
        Ok(())
    }

    fn end_span(&mut self) -> VoiceResult<()> {
        let span = std::mem::take(&mut self.current);
        self.spans
            .lock()
            .map_err(|e| VoiceError::Recognizer(format!("span log poisoned: {}", e)))?
            .push(span);
        let text = self.finals.pop_front().unwrap_or_default();
        send_event(&self.events, RecognizerEvent::Final { text })
    }
}

/// Response payload from `/audio/transcriptions`. A missing `text` field
/// decodes as empty rather than failing the span.
#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// OpenAI-compatible transcription backend (`/audio/transcriptions`).
///
/// Accumulates the span and uploads it as a 16-bit WAV on `end_span`.
/// Reads `STT_API_URL`, `STT_API_KEY` (or `PARLEY_API_KEY`), `STT_MODEL`.
pub struct HttpRecognizer {
    base_url: String,
    api_key: String,
    model: String,
    sample_rate: u32,
    client: reqwest::blocking::Client,
    events: mpsc::UnboundedSender<RecognizerEvent>,
    span: Vec<f32>,
}

impl HttpRecognizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        sample_rate: u32,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> VoiceResult<Self> {
        // The source behavior has no inference timeout; 30s here is a
        // deliberate deviation so a dead endpoint cannot wedge the turn loop.
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Recognizer(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            sample_rate,
            client,
            events,
            span: Vec::new(),
        })
    }

    /// Build from environment: STT_API_URL, STT_API_KEY (or PARLEY_API_KEY), STT_MODEL.
    pub fn from_env(
        sample_rate: u32,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("PARLEY_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("STT requires STT_API_KEY or PARLEY_API_KEY".to_string())
            })?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model, sample_rate, events)
    }

    fn transcribe(&self) -> VoiceResult<String> {
        if self.span.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&self.span, self.sample_rate);
        let url = format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        );
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("span.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Recognizer(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Recognizer(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Recognizer(format!(
                "transcription API error {}: {}",
                status, body
            )));
        }
        let payload: TranscriptionResponse = res
            .json()
            .map_err(|e| VoiceError::Recognizer(e.to_string()))?;
        Ok(payload.text.trim().to_string())
    }
}

impl StreamingRecognizer for HttpRecognizer {
    fn start_span(&mut self) {
        self.span.clear();
    }

    fn process_chunk(&mut self, samples: &[f32]) -> VoiceResult<()> {
        self.span.extend_from_slice(samples);
        Ok(())
    }

    fn end_span(&mut self) -> VoiceResult<()> {
        let result = self.transcribe();
        self.span.clear();
        match result {
            Ok(text) => send_event(&self.events, RecognizerEvent::Final { text }),
            Err(e) => {
                // The span still gets its one final so the turn loop moves on.
                send_event(&self.events, RecognizerEvent::Final { text: String::new() })?;
                Err(e)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Local Whisper recognizer (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_recognizer {
    use super::*;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper recognizer: loads a ggml model (e.g. ggml-base.en.bin)
    /// and decodes the accumulated span on `end_span`. Audio must be 16 kHz
    /// mono f32. Models: https://huggingface.co/ggerganov/whisper.cpp
    pub struct WhisperRecognizer {
        #[allow(dead_code)]
        context: WhisperContext,
        state: whisper_rs::WhisperState,
        events: mpsc::UnboundedSender<RecognizerEvent>,
        span: Vec<f32>,
    }

    impl WhisperRecognizer {
        pub fn new(
            model_path: &str,
            sample_rate: u32,
            events: mpsc::UnboundedSender<RecognizerEvent>,
        ) -> VoiceResult<Self> {
            if sample_rate != 16000 {
                return Err(VoiceError::Config(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    sample_rate
                )));
            }
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Recognizer(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Recognizer(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state,
                events,
                span: Vec::new(),
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model.
        pub fn from_env(
            sample_rate: u32,
            events: mpsc::UnboundedSender<RecognizerEvent>,
        ) -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path, sample_rate, events)
        }

        fn decode(&mut self) -> VoiceResult<String> {
            if self.span.is_empty() {
                return Ok(String::new());
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));
            self.state
                .full(&params, &self.span)
                .map_err(|e| VoiceError::Recognizer(format!("Whisper inference failed: {}", e)))?;
            let text = self
                .state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            Ok(text)
        }
    }

    impl StreamingRecognizer for WhisperRecognizer {
        fn start_span(&mut self) {
            self.span.clear();
        }

        fn process_chunk(&mut self, samples: &[f32]) -> VoiceResult<()> {
            self.span.extend_from_slice(samples);
            Ok(())
        }

        fn end_span(&mut self) -> VoiceResult<()> {
            let result = self.decode();
            self.span.clear();
            match result {
                Ok(text) => send_event(&self.events, RecognizerEvent::Final { text }),
                Err(e) => {
                    send_event(&self.events, RecognizerEvent::Final { text: String::new() })?;
                    Err(e)
                }
            }
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_recognizer::WhisperRecognizer;

/// Select a recognizer backend at configuration time.
/// Priority: (1) Whisper if `WHISPER_MODEL_PATH` is set and loads (feature
/// `whisper`), (2) HTTP transcription if API keys are set, (3) scripted.
pub fn create_recognizer(
    sample_rate: u32,
    events: mpsc::UnboundedSender<RecognizerEvent>,
) -> Box<dyn StreamingRecognizer> {
    #[cfg(feature = "whisper")]
    {
        match whisper_recognizer::WhisperRecognizer::from_env(sample_rate, events.clone()) {
            Ok(w) => return Box::new(w),
            Err(e) => warn!("Whisper unavailable, trying next backend: {}", e),
        }
    }
    match HttpRecognizer::from_env(sample_rate, events.clone()) {
        Ok(h) => Box::new(h),
        Err(e) => {
            warn!("HTTP recognizer unavailable, using scripted backend: {}", e);
            Box::new(ScriptedRecognizer::new(events))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_emits_one_final_per_span() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rec = ScriptedRecognizer::new(tx).with_finals(vec!["hello".into()]);

        rec.start_span();
        rec.process_chunk(&[0.1, 0.2]).unwrap();
        rec.end_span().unwrap();

        rec.start_span();
        rec.end_span().unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            RecognizerEvent::Final {
                text: "hello".into()
            }
        );
        // Queue ran dry: empty final, still exactly one.
        assert_eq!(
            rx.try_recv().unwrap(),
            RecognizerEvent::Final { text: String::new() }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn scripted_partials_precede_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rec = ScriptedRecognizer::new(tx)
            .with_finals(vec!["done".into()])
            .with_partials();

        rec.start_span();
        rec.process_chunk(&[0.0; 8]).unwrap();
        rec.process_chunk(&[0.0; 8]).unwrap();
        rec.end_span().unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            RecognizerEvent::Partial { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RecognizerEvent::Final { .. }
        ));
    }

    #[test]
    fn scripted_records_exact_span_samples() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut rec = ScriptedRecognizer::new(tx);
        let spans = rec.spans();

        rec.start_span();
        rec.process_chunk(&[1.0, 2.0]).unwrap();
        rec.process_chunk(&[3.0]).unwrap();
        rec.end_span().unwrap();

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0], vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn transcription_payload_decodes_text() {
        let payload: TranscriptionResponse =
            serde_json::from_str(r#"{"text":"  what time is it  ","duration":1.2}"#).unwrap();
        assert_eq!(payload.text.trim(), "what time is it");
        // No text field: empty transcript, not a decode error.
        let empty: TranscriptionResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.text.is_empty());
    }

    #[test]
    fn start_span_resets_accumulation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut rec = ScriptedRecognizer::new(tx);
        let spans = rec.spans();

        rec.start_span();
        rec.process_chunk(&[9.0; 4]).unwrap();
        // Span abandoned; a new span must not inherit its samples.
        rec.start_span();
        rec.process_chunk(&[1.0]).unwrap();
        rec.end_span().unwrap();

        assert_eq!(spans.lock().unwrap()[0], vec![1.0]);
    }
}
