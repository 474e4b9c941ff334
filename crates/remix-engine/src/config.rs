use std::env;

use remix_contracts::quota::DEFAULT_FREE_LIMIT;
use tracing::warn;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, PartialEq)]
pub struct GeminiSettings {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub free_limit: u32,
    pub gemini: GeminiSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            free_limit: DEFAULT_FREE_LIMIT,
            gemini: GeminiSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process env.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = GeminiSettings::default();

        let free_limit = match non_empty("REMIX_FREE_LIMIT") {
            None => DEFAULT_FREE_LIMIT,
            Some(raw) => match raw.parse::<u32>() {
                Ok(value) if value > 0 => value,
                _ => {
                    warn!(value = %raw, "REMIX_FREE_LIMIT must be a positive integer; using default");
                    DEFAULT_FREE_LIMIT
                }
            },
        };

        let gemini = GeminiSettings {
            api_base: non_empty("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            api_key: non_empty("GEMINI_API_KEY").or_else(|| non_empty("GOOGLE_API_KEY")),
            model: non_empty("REMIX_GEMINI_MODEL").unwrap_or(defaults.model),
            request_timeout_s: clamped_f64(
                non_empty("REMIX_REQUEST_TIMEOUT_S"),
                defaults.request_timeout_s,
                15.0,
                300.0,
            ),
            transport_retries: clamped_f64(
                non_empty("REMIX_TRANSPORT_RETRIES"),
                defaults.transport_retries as f64,
                0.0,
                4.0,
            )
            .round() as usize,
            retry_backoff_s: clamped_f64(
                non_empty("REMIX_RETRY_BACKOFF_S"),
                defaults.retry_backoff_s,
                0.1,
                10.0,
            ),
        };

        Self { free_limit, gemini }
    }
}

fn clamped_f64(raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}
