// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Environment-driven configuration.
//!
//! Flat proxy settings (`PORT`, `FORCE_COMMIT_TIMEOUT`, …) merge over
//! serialized defaults; provider credential blocks come from prefixed
//! variables (`OPENAI_*`, `GEMINI_*`, `DEEPGRAM_*`). The resulting struct
//! is immutable for the process lifetime.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{warn, Level};

use streamscribe_backends::{
    DeepgramEncoding, DeepgramSettings, GeminiSettings, OpenAiSettings, ProviderConfig,
};
use streamscribe_core::ProviderKind;

/// Flat environment keys merged into the top-level config.
const FLAT_KEYS: &[&str] = &[
    "port",
    "host",
    "force_commit_timeout",
    "broadcast_transcripts",
    "broadcast_transcripts_max_size",
    "session_resume_enabled",
    "session_resume_grace_period",
    "providers_priority",
    "enable_dummy_provider",
    "otlp_endpoint",
    "log_level",
    "log_file",
    "log_format",
    "debug",
];

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub transcription_prompt: Option<String>,
    /// Raw JSON for the turn-detection block; invalid JSON falls back to
    /// the server-VAD default with a warning.
    #[serde(default)]
    pub turn_detection: Option<String>,
}

fn default_openai_model() -> String {
    "gpt-4o-transcribe".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default)]
    pub transcription_prompt: Option<String>,
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash-live-001".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DeepgramConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// `opus` forwards the client stream untouched; `linear16` decodes
    /// locally and streams PCM.
    #[serde(default = "default_deepgram_encoding")]
    pub encoding: String,
    #[serde(default = "default_true")]
    pub punctuate: bool,
    #[serde(default)]
    pub diarize: bool,
    #[serde(default)]
    pub include_language: bool,
    /// Comma-separated tags forwarded on every Deepgram session.
    #[serde(default)]
    pub tags: Option<String>,
}

fn default_deepgram_encoding() -> String {
    "opus".to_string()
}

const fn default_true() -> bool {
    true
}

/// Root configuration, resolved once at startup.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    /// Seconds of send-side silence before a forced commit; <= 0 disables.
    pub force_commit_timeout: i64,
    pub broadcast_transcripts: bool,
    /// Byte budget for each pipeline's shared transcript history.
    pub broadcast_transcripts_max_size: usize,
    pub session_resume_enabled: bool,
    /// Seconds a detached session survives awaiting resume.
    pub session_resume_grace_period: u64,
    /// Comma-separated provider preference order.
    pub providers_priority: String,
    pub enable_dummy_provider: bool,
    pub otlp_endpoint: Option<String>,
    pub log_level: LogLevel,
    /// Path for the optional file log; empty disables it.
    pub log_file: String,
    pub log_format: LogFormat,
    pub debug: bool,

    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub deepgram: DeepgramConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            force_commit_timeout: 0,
            broadcast_transcripts: false,
            broadcast_transcripts_max_size: 5120,
            session_resume_enabled: false,
            session_resume_grace_period: 30,
            providers_priority: "openai,gemini,deepgram".to_string(),
            enable_dummy_provider: false,
            otlp_endpoint: None,
            log_level: LogLevel::default(),
            log_file: String::new(),
            log_format: LogFormat::default(),
            debug: false,
            openai: OpenAiConfig::default(),
            gemini: GeminiConfig::default(),
            deepgram: DeepgramConfig::default(),
        }
    }
}

impl Config {
    /// Providers in priority order, unknown names dropped with a warning.
    pub fn provider_priority(&self) -> Vec<ProviderKind> {
        let mut priority: Vec<ProviderKind> = self
            .providers_priority
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|name| match name.parse() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    warn!(provider = name, "ignoring unknown provider in PROVIDERS_PRIORITY");
                    None
                },
            })
            .collect();
        if self.enable_dummy_provider && !priority.contains(&ProviderKind::Dummy) {
            priority.push(ProviderKind::Dummy);
        }
        priority
    }

    /// Whether `kind` has usable credentials (or is the enabled dummy).
    pub fn is_provider_available(&self, kind: ProviderKind) -> bool {
        match kind {
            ProviderKind::OpenAi => !self.openai.api_key.is_empty(),
            ProviderKind::Gemini => !self.gemini.api_key.is_empty(),
            ProviderKind::Deepgram => !self.deepgram.api_key.is_empty(),
            ProviderKind::Dummy => self.enable_dummy_provider,
        }
    }

    /// Highest-priority provider with credentials.
    pub fn default_provider(&self) -> Option<ProviderKind> {
        self.provider_priority().into_iter().find(|kind| self.is_provider_available(*kind))
    }

    /// Resolved adapter settings for `kind`, `None` when unavailable.
    pub fn provider_config(&self, kind: ProviderKind) -> Option<ProviderConfig> {
        if !self.is_provider_available(kind) {
            return None;
        }
        let config = match kind {
            ProviderKind::OpenAi => ProviderConfig::OpenAi(OpenAiSettings {
                api_key: self.openai.api_key.clone(),
                model: self.openai.model.clone(),
                prompt: self.openai.transcription_prompt.clone(),
                turn_detection: self.openai.turn_detection.as_deref().and_then(|raw| {
                    match serde_json::from_str(raw) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(error = %e, "invalid OPENAI_TURN_DETECTION JSON, using default");
                            None
                        },
                    }
                }),
            }),
            ProviderKind::Gemini => ProviderConfig::Gemini(GeminiSettings {
                api_key: self.gemini.api_key.clone(),
                model: self.gemini.model.clone(),
                prompt: self.gemini.transcription_prompt.clone(),
            }),
            ProviderKind::Deepgram => ProviderConfig::Deepgram(DeepgramSettings {
                api_key: self.deepgram.api_key.clone(),
                model: self.deepgram.model.clone(),
                language: self.deepgram.language.clone(),
                encoding: match self.deepgram.encoding.as_str() {
                    "linear16" => DeepgramEncoding::Linear16,
                    "opus" => DeepgramEncoding::Opus,
                    other => {
                        warn!(encoding = other, "unknown DEEPGRAM_ENCODING, defaulting to opus");
                        DeepgramEncoding::Opus
                    },
                },
                punctuate: self.deepgram.punctuate,
                diarize: self.deepgram.diarize,
                include_language: self.deepgram.include_language,
                tags: self
                    .deepgram
                    .tags
                    .as_deref()
                    .map(|t| {
                        t.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            ProviderKind::Dummy => ProviderConfig::Dummy,
        };
        Some(config)
    }

    /// Base transcription prompt for `kind`, used for context injection.
    pub fn base_prompt(&self, kind: ProviderKind) -> String {
        match kind {
            ProviderKind::OpenAi => self.openai.transcription_prompt.clone().unwrap_or_default(),
            ProviderKind::Gemini => self.gemini.transcription_prompt.clone().unwrap_or_default(),
            ProviderKind::Deepgram | ProviderKind::Dummy => String::new(),
        }
    }
}

/// Loads the configuration from defaults and environment variables.
///
/// # Errors
///
/// Returns an error when an environment value fails to parse into its
/// typed field.
pub fn load() -> Result<Config, Box<figment::Error>> {
    let mut config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Env::raw().only(FLAT_KEYS))
        .extract()
        .map_err(Box::new)?;

    config.openai = Figment::new()
        .merge(Serialized::defaults(OpenAiConfig::default()))
        .merge(Env::prefixed("OPENAI_"))
        .extract()
        .map_err(Box::new)?;
    config.gemini = Figment::new()
        .merge(Serialized::defaults(GeminiConfig::default()))
        .merge(Env::prefixed("GEMINI_"))
        .extract()
        .map_err(Box::new)?;
    config.deepgram = Figment::new()
        .merge(Serialized::defaults(DeepgramConfig::default()))
        .merge(Env::prefixed("DEEPGRAM_"))
        .extract()
        .map_err(Box::new)?;

    Ok(config)
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}
