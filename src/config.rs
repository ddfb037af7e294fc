use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::pcm_codec::{FRAME_SIZE, INBOUND_SAMPLE_RATE, OUTBOUND_SAMPLE_RATE};

const ENV_PREFIX: &str = "WARROOM";
const DEFAULT_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
const DEFAULT_INSTRUCTION: &str = "Be ultra-concise. Trade focus.";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub live: LiveConfig,
}

/// Device and framing parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Microphone stream rate, also declared on outbound chunks
    pub input_sample_rate: u32,
    /// Speaker stream rate, matching the server's audio
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
    /// ALSA capture period in frames; frames are accumulated up to `frame_size`
    pub capture_period_size: usize,
    /// ALSA playback period in frames (one timeline render step)
    pub playback_period_size: usize,
    /// Outbound chunks buffered in front of the socket before frames are dropped
    pub outbound_queue: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            input_sample_rate: OUTBOUND_SAMPLE_RATE,
            output_sample_rate: INBOUND_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            capture_period_size: 1024,
            playback_period_size: 480,
            outbound_queue: 32,
        }
    }
}

/// Remote live channel parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LiveConfig {
    pub ws_url: String,
    pub model: String,
    pub system_instruction: String,
    pub setup_timeout_ms: u64,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_INSTRUCTION.to_string(),
            setup_timeout_ms: 10_000,
            api_key: None,
        }
    }
}

impl Config {
    /// Load defaults, then `path` if it exists, then `WARROOM__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let mut config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if config.live.api_key.as_deref().is_none_or(|key| key.trim().is_empty()) {
            config.live.api_key = std::env::var("GEMINI_API_KEY")
                .or_else(|_| std::env::var("API_KEY"))
                .ok()
                .filter(|key| !key.trim().is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.audio.frame_size == 0 {
            anyhow::bail!("audio.frame_size must be greater than zero");
        }
        if self.audio.capture_period_size == 0 || self.audio.playback_period_size == 0 {
            anyhow::bail!("audio period sizes must be greater than zero");
        }
        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            anyhow::bail!("audio sample rates must be greater than zero");
        }
        if self.audio.outbound_queue == 0 {
            anyhow::bail!("audio.outbound_queue must be greater than zero");
        }
        Ok(())
    }

    /// The API key, required before a channel can be opened.
    pub fn api_key(&self) -> Result<&str> {
        self.live
            .api_key
            .as_deref()
            .context("No API key configured: set live.api_key, GEMINI_API_KEY or API_KEY")
    }
}
