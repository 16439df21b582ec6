use std::str::FromStr;
use std::time::Duration;

use crate::audio::AudioConfig;
use crate::controller::SessionSettings;
use crate::error::{Result, VoiceError};

/// Environment variable selecting the spoken language at runtime.
pub const LANGUAGE_ENV: &str = "MEDIVOICE_LANGUAGE";
/// Environment variable overriding the realtime endpoint.
pub const WS_URL_ENV: &str = "MEDIVOICE_WS_URL";

/// Native display names for the languages the agent is tuned for.
const NATIVE_NAMES: &[(&str, &str)] = &[
    ("English", "English"),
    ("Hindi", "हिंदी"),
    ("Marathi", "मराठी"),
];

pub fn native_name(language: &str) -> Option<&'static str> {
    NATIVE_NAMES
        .iter()
        .find(|(name, _)| *name == language)
        .map(|(_, native)| *native)
}

/// The consultant persona, pinned to one conversation language.
pub fn system_instruction(language: &str) -> String {
    format!(
        "You are MediVoice, an expert AI medical consultant. \
Your role is to answer complex medical questions with professional depth, accuracy, and empathy.\n\
\n\
CURRENT LANGUAGE SETTING: {lang}.\n\
\n\
CRITICAL INSTRUCTION:\n\
You must speak and converse with the user in {lang} ONLY.\n\
If the user speaks another language, kindly reply in {lang} that you are currently set to this language, or switch if they ask.\n\
\n\
Guidelines:\n\
1. Use professional medical terminology but explain it clearly in {lang}.\n\
2. Provide detailed, evidence-based answers.\n\
3. If a user describes serious symptoms, immediately advise them to seek emergency care.\n\
4. Be concise in conversation but thorough in explanation.\n\
5. Maintain a calm, reassuring, and professional voice tone.",
        lang = language
    )
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 网络配置
    pub ws_url: String,
    pub model: &'static str,
    pub api_key_env: &'static str,

    // 语音与语言
    pub voice: &'static str,
    pub language: String,
    pub languages: Vec<String>,

    // 音频配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub playback_period_size: usize,

    // 超时
    pub capture_timeout: Duration,
    pub connect_timeout: Duration,
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| VoiceError::Config {
        key: key.to_string(),
        message: format!("cannot parse '{}'", raw),
    })
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有默认值都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self> {
        let languages: Vec<String> = env!("LANGUAGES")
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let mut config = Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            ws_url: env!("WS_URL").to_string(),
            model: env!("MODEL"),
            api_key_env: env!("API_KEY_ENV"),

            voice: env!("VOICE_NAME"),
            language: String::new(),
            languages,

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            input_sample_rate: parse("INPUT_SAMPLE_RATE", env!("INPUT_SAMPLE_RATE"))?,
            output_sample_rate: parse("OUTPUT_SAMPLE_RATE", env!("OUTPUT_SAMPLE_RATE"))?,
            frame_size: parse("FRAME_SIZE", env!("FRAME_SIZE"))?,
            playback_period_size: parse("PLAYBACK_PERIOD_SIZE", env!("PLAYBACK_PERIOD_SIZE"))?,

            capture_timeout: Duration::from_secs(parse(
                "CAPTURE_TIMEOUT_SECS",
                env!("CAPTURE_TIMEOUT_SECS"),
            )?),
            connect_timeout: Duration::from_secs(parse(
                "CONNECT_TIMEOUT_SECS",
                env!("CONNECT_TIMEOUT_SECS"),
            )?),
        };
        config.select_language(env!("DEFAULT_LANGUAGE"))?;
        Ok(config)
    }

    /// Apply `MEDIVOICE_LANGUAGE` / `MEDIVOICE_WS_URL` from the process
    /// environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(language) = lookup(LANGUAGE_ENV) {
            self.select_language(language.trim())?;
        }
        if let Some(url) = lookup(WS_URL_ENV) {
            url::Url::parse(&url).map_err(|e| VoiceError::Config {
                key: WS_URL_ENV.to_string(),
                message: e.to_string(),
            })?;
            self.ws_url = url;
        }
        Ok(self)
    }

    pub fn select_language(&mut self, language: &str) -> Result<()> {
        if !self.languages.iter().any(|l| l == language) {
            return Err(VoiceError::Config {
                key: "language".to_string(),
                message: format!(
                    "'{}' is not one of: {}",
                    language,
                    self.languages.join(", ")
                ),
            });
        }
        self.language = language.to_string();
        Ok(())
    }

    /// The API key, read from the variable named in `[network].api_key_env`.
    pub fn api_key(&self) -> Result<String> {
        match std::env::var(self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(VoiceError::Config {
                key: self.api_key_env.to_string(),
                message: "API key not set".to_string(),
            }),
        }
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            capture_device: self.capture_device.to_string(),
            playback_device: self.playback_device.to_string(),
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
            frame_size: self.frame_size,
            playback_period_size: self.playback_period_size,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            model: self.model.to_string(),
            voice: self.voice.to_string(),
            language: self.language.clone(),
            languages: self.languages.clone(),
            output_sample_rate: self.output_sample_rate,
            capture_timeout: self.capture_timeout,
            connect_timeout: self.connect_timeout,
        }
    }
}
