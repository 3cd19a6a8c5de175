use crate::constants::{SAMPLE_RATE, SYNTHESIS_CONCURRENCY, TTS_MAX_CHARS};
use crate::transport::Voice;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::read_to_string;

const CONFIG_FILE: &str = "Config.toml";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VoiceMap {
    pub narrator_a: String,
    pub narrator_b: String,
}

impl Default for VoiceMap {
    fn default() -> Self {
        VoiceMap {
            narrator_a: "alloy".to_string(),
            narrator_b: "onyx".to_string(),
        }
    }
}

impl VoiceMap {
    /// Provider-specific voice name for a narrator.
    pub fn resolve(&self, voice: Voice) -> &str {
        match voice {
            Voice::NarratorA => &self.narrator_a,
            Voice::NarratorB => &self.narrator_b,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TtsConfig {
    /// OpenAI-compatible speech endpoint
    pub api_url: String,
    pub model: String,

    /// Longest input the provider accepts per request
    pub max_chars: usize,

    /// Audio container requested from the provider (mp3, wav, flac, ...)
    pub response_format: String,

    pub voices: VoiceMap,
}

impl Default for TtsConfig {
    fn default() -> Self {
        TtsConfig {
            api_url: "https://api.openai.com/v1/audio/speech".to_string(),
            model: "tts-1".to_string(),
            max_chars: TTS_MAX_CHARS,
            response_format: "mp3".to_string(),
            voices: VoiceMap::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Minimum delay between enqueueing audio and it starting to sound
    pub lead_in_ms: u64,

    /// Concurrent synthesis requests while prefetching a section
    pub synthesis_concurrency: usize,

    pub default_rate: f64,
    pub default_voice: Voice,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            lead_in_ms: 100,
            synthesis_concurrency: SYNTHESIS_CONCURRENCY,
            default_rate: 1.0,
            default_voice: Voice::NarratorA,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Address of the raw WAV stream listeners connect to
    pub listen_addr: String,
    pub sample_rate: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            listen_addr: "0.0.0.0:7878".to_string(),
            sample_rate: SAMPLE_RATE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub playback: PlaybackConfig,
    pub output: OutputConfig,

    /// Where entered API keys are remembered between runs
    pub credentials_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            playback: PlaybackConfig::default(),
            output: OutputConfig::default(),
            credentials_path: PathBuf::from("credentials.json"),
        }
    }
}

/// Loads `Config.toml` from the working directory, or defaults if there is none.
pub async fn load() -> Result<Config> {
    if !Path::new(CONFIG_FILE).exists() {
        info!("No {CONFIG_FILE} found, using defaults");
        return Ok(Config::default());
    }
    load_from(CONFIG_FILE).await
}

pub async fn load_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config = read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&config).with_context(|| format!("Invalid config in {}", path.display()))?;

    Ok(config)
}
