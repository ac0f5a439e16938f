//! Conversational backend: prompt in, streamed text deltas out.
//!
//! The controller consumes deltas through `SentenceSplitter`, which
//! de-duplicates, so backends are free to send incremental or cumulative
//! chunks.

use crate::error::{VoiceError, VoiceResult};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use tracing::debug;

/// External conversational collaborator.
pub trait ChatBackend: Send {
    /// Stream a response for `prompt`. `on_delta` is called for every raw
    /// chunk (possibly cumulative); the full response text is returned on
    /// completion.
    fn chat_stream(
        &self,
        prompt: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> VoiceResult<String>;
}

/// Scripted backend replaying fixed chunks; for tests and offline demos.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChat {
    pub chunks: Vec<String>,
}

impl ScriptedChat {
    pub fn new(chunks: Vec<String>) -> Self {
        Self { chunks }
    }
}

impl ChatBackend for ScriptedChat {
    fn chat_stream(
        &self,
        _prompt: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> VoiceResult<String> {
        let mut full = String::new();
        for chunk in &self.chunks {
            let delta = crate::textflow::delta_from(&full, chunk).to_string();
            on_delta(chunk);
            full.push_str(&delta);
        }
        Ok(full)
    }
}

/// OpenAI-compatible `/chat/completions` backend with SSE streaming.
/// Reads `CHAT_API_URL`, `CHAT_API_KEY` (or `PARLEY_API_KEY`), `CHAT_MODEL`
/// and an optional `CHAT_SYSTEM_PROMPT`.
pub struct HttpChat {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpChat {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: Option<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| VoiceError::Chat(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt,
            client,
        })
    }

    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("CHAT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("CHAT_API_KEY")
            .or_else(|_| std::env::var("PARLEY_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("chat requires CHAT_API_KEY or PARLEY_API_KEY".to_string())
            })?;
        let model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let system_prompt = std::env::var("CHAT_SYSTEM_PROMPT").ok();
        Self::new(base_url, api_key, model, system_prompt)
    }
}

/// One SSE payload from a `/chat/completions` stream. Unknown fields
/// (ids, usage, finish reasons) are ignored.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one SSE data payload into its text delta, if it carries one.
/// Malformed chunks, role-only deltas and empty content all yield `None`.
fn delta_content(payload: &str) -> Option<String> {
    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            debug!("Skipping malformed SSE chunk: {}", e);
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|content| !content.is_empty())
}

impl ChatBackend for HttpChat {
    fn chat_stream(
        &self,
        prompt: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(ref system) = self.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Chat(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Chat(format!(
                "chat API error {}: {}",
                status, body
            )));
        }

        let mut full = String::new();
        let reader = BufReader::new(res);
        for line in reader.lines() {
            let line = line.map_err(|e| VoiceError::Chat(e.to_string()))?;
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload.trim() == "[DONE]" {
                break;
            }
            let Some(content) = delta_content(payload) else {
                continue;
            };
            full.push_str(&content);
            on_delta(&content);
        }
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_chunk_decodes_to_delta_content() {
        let payload =
            r#"{"id":"c-1","choices":[{"index":0,"delta":{"content":"Hel"}}],"model":"m"}"#;
        assert_eq!(delta_content(payload).as_deref(), Some("Hel"));
    }

    #[test]
    fn contentless_and_malformed_sse_chunks_are_skipped() {
        // First chunk of a stream carries only the role.
        assert!(delta_content(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
        assert!(delta_content(r#"{"choices":[{"delta":{"content":""}}]}"#).is_none());
        assert!(delta_content(r#"{"choices":[]}"#).is_none());
        assert!(delta_content("not json at all").is_none());
    }

    #[test]
    fn scripted_chat_replays_chunks() {
        let chat = ScriptedChat::new(vec!["Hel".into(), "Hello there.".into()]);
        let mut seen = Vec::new();
        let full = chat
            .chat_stream("hi", &mut |delta| seen.push(delta.to_string()))
            .unwrap();
        assert_eq!(seen, vec!["Hel", "Hello there."]);
        assert_eq!(full, "Hello there.");
    }
}
