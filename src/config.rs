use crate::error::ConfigError;
use secrecy::SecretString;
use std::time::Duration;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODELS: &[&str] = &["gemini-1.5-flash", "gemini-1.0-pro", "gemini-1.5-pro"];

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are the AI assistant on a software developer's portfolio website.

Persona:
- Helpful, precise and a little witty.
- Your main job is to talk about the developer's projects, skills and experience.
- You are also a capable general assistant: answer coding, math and science questions correctly.
- Politely steer personal questions about unrelated people back to the portfolio.

Guidelines:
1. Keep answers to four or five sentences unless a longer explanation is requested.
2. Use Markdown code blocks for code.
3. If asked who built you, say you were built by the portfolio owner on top of the Gemini API.";

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub chat: ChatConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Clone)]
pub struct ProviderConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub models: Vec<String>,
    pub system_prompt: String,
    pub generation: GenerationSettings,
    pub verify_models: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub max_history_turns: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingRequired("GEMINI_API_KEY".into()))?;

        let models: Vec<String> = match lookup("GEMINI_MODELS") {
            Some(raw) => split_list(&raw),
            None => DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
        };
        if models.is_empty() {
            return Err(ConfigError::InvalidValue("GEMINI_MODELS".into()));
        }

        let defaults = GenerationSettings::default();

        Ok(Self {
            server: ServerConfig {
                host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: lookup("PORT")
                    .unwrap_or_else(|| "8000".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".into()))?,
                cors_origins: split_list(
                    &lookup("FRONTEND_URL").unwrap_or_else(|| "*".to_string()),
                ),
            },
            provider: ProviderConfig {
                api_key,
                base_url: lookup("GEMINI_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
                models,
                system_prompt: lookup("SYSTEM_PROMPT")
                    .filter(|prompt| !prompt.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
                generation: GenerationSettings {
                    max_output_tokens: lookup("GEMINI_MAX_OUTPUT_TOKENS")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(defaults.max_output_tokens),
                    ..defaults
                },
                verify_models: lookup("GEMINI_VERIFY_MODELS")
                    .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false),
            },
            chat: ChatConfig {
                request_timeout_secs: lookup("LLM_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8),
                stream_idle_timeout_secs: lookup("LLM_STREAM_IDLE_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
                max_history_turns: lookup("MAX_HISTORY_TURNS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            },
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ChatConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 400,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 8,
            stream_idle_timeout_secs: 15,
            max_history_turns: 20,
        }
    }
}
