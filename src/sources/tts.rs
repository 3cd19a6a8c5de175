//! Narration through an OpenAI-compatible speech endpoint.

use crate::{
    audio::{self, AudioBuffer},
    config::{TtsConfig, VoiceMap},
    error::{NarratorError, NarratorResult},
    sources::SpeechSynthesizer,
    transport::Voice,
};
use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;

const PROVIDER: &str = "TTS";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpSpeechSynthesizer {
    client: Client,
    api_url: String,
    model: String,
    max_chars: usize,
    response_format: String,
    voices: VoiceMap,
    api_key: String,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: &TtsConfig, api_key: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            max_chars: config.max_chars.max(1),
            response_format: config.response_format.clone(),
            voices: config.voices.clone(),
            api_key: api_key.to_string(),
        }
    }

    async fn request(&self, input: &str, voice: &str) -> NarratorResult<AudioBuffer> {
        let body = json!({
            "model": self.model,
            "input": input,
            "voice": voice,
            "response_format": self.response_format,
        });

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(NarratorError::invalid_credential(PROVIDER));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{PROVIDER} request failed with {status}: {text}").into());
        }

        let bytes = resp.bytes().await?.to_vec();
        let format = self.response_format.clone();

        // Decoding is CPU bound
        let buffer = tokio::task::spawn_blocking(move || audio::decode(bytes, Some(&format)))
            .await
            .map_err(|e| anyhow!("Decoder task failed: {e}"))??;

        Ok(buffer)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, voice: Voice) -> NarratorResult<Option<AudioBuffer>> {
        let chunks = split_text(text, self.max_chars);
        if chunks.is_empty() {
            return Ok(None);
        }

        let voice = self.voices.resolve(voice);
        let mut buffers = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            buffers.push(self.request(chunk, voice).await?);
        }

        if chunks.len() > 1 {
            debug!("Synthesized {} chars in {} requests", text.len(), chunks.len());
        }

        Ok(audio::concat(buffers)?)
    }
}

/// Splits `text` into pieces of at most `max_chars` characters.
///
/// Sentences are kept whole where possible, then words; a single word longer
/// than the limit is cut at a character boundary.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = vec![];
    let mut current = String::new();

    for sentence in sentences(text) {
        for piece in fit_sentence(sentence, max_chars) {
            let joined_len = current.chars().count() + 1 + piece.chars().count();
            if !current.is_empty() && joined_len > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Sentences including their terminating punctuation.
fn sentences(text: &str) -> Vec<&str> {
    let mut sentences = vec![];
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let ends_sentence = matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if ends_sentence {
            let end = i + c.len_utf8();
            sentences.push(text[start..end].trim());
            start = end;
        }
    }
    sentences.push(text[start..].trim());

    sentences.retain(|s| !s.is_empty());
    sentences
}

/// Breaks an over-long sentence into word-boundary pieces.
fn fit_sentence(sentence: &str, max_chars: usize) -> Vec<String> {
    if sentence.chars().count() <= max_chars {
        return vec![sentence.to_string()];
    }

    let mut pieces = vec![];
    let mut current = String::new();

    for word in sentence.split_whitespace() {
        let words: Vec<String> = if word.chars().count() > max_chars {
            let chars: Vec<char> = word.chars().collect();
            chars
                .chunks(max_chars)
                .map(|chunk| chunk.iter().collect())
                .collect()
        } else {
            vec![word.to_string()]
        };

        for word in words {
            let joined_len = current.chars().count() + 1 + word.chars().count();
            if !current.is_empty() && joined_len > max_chars {
                pieces.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&word);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}
