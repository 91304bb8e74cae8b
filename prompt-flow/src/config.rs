use thiserror::Error;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-pro-exp-03-25";
pub const DEFAULT_VISION_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_RESPONSE_LANGUAGE: &str = "Spanish";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the generative-AI endpoint.
///
/// Built once at startup and handed to [`crate::GeminiClient`]. The credential is
/// optional here: its absence only fails the calls that need it.
#[derive(Debug, Clone)]
pub struct GenerativeConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub text_model: String,
    pub vision_model: String,
    /// Ask the remote model for `application/json` output.
    pub json_output: bool,
    pub response_language: String,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            json_output: true,
            response_language: DEFAULT_RESPONSE_LANGUAGE.to_string(),
        }
    }
}

impl GenerativeConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    ///
    /// | Variable              | Default                                    |
    /// |-----------------------|--------------------------------------------|
    /// | `GEMINI_API_KEY`      | unset                                      |
    /// | `GEMINI_BASE_URL`     | `https://generativelanguage.googleapis.com`|
    /// | `GEMINI_TEXT_MODEL`   | `gemini-2.5-pro-exp-03-25`                 |
    /// | `GEMINI_VISION_MODEL` | `gemini-2.0-flash`                         |
    /// | `GEMINI_JSON_OUTPUT`  | `true`                                     |
    /// | `RESPONSE_LANGUAGE`   | `Spanish`                                  |
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let json_output = match non_empty(lookup("GEMINI_JSON_OUTPUT")) {
            Some(raw) => parse_bool("GEMINI_JSON_OUTPUT", &raw)?,
            None => defaults.json_output,
        };

        Ok(Self {
            api_key: non_empty(lookup("GEMINI_API_KEY")),
            base_url: non_empty(lookup("GEMINI_BASE_URL")).unwrap_or(defaults.base_url),
            text_model: non_empty(lookup("GEMINI_TEXT_MODEL")).unwrap_or(defaults.text_model),
            vision_model: non_empty(lookup("GEMINI_VISION_MODEL"))
                .unwrap_or(defaults.vision_model),
            json_output,
            response_language: non_empty(lookup("RESPONSE_LANGUAGE"))
                .unwrap_or(defaults.response_language),
        })
    }
}

/// Treat blank values the same as unset ones.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
