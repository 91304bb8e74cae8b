use std::path::PathBuf;

use prompt_flow::config::non_empty;
use prompt_flow::{ConfigError, GenerativeConfig};

use crate::gateways::transcription::SpeechConfig;
use crate::gateways::weather::WeatherConfig;

pub const DEFAULT_RECORDS_PATH: &str = "insurance_data.json";
pub const DEFAULT_PORT: u16 = 8001;

/// Shape of the log lines written to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(ConfigError::InvalidValue {
                key: "LOG_FORMAT",
                value: raw.to_string(),
                reason: "expected \"json\" or \"pretty\"".to_string(),
            }),
        }
    }
}

/// Everything the service reads from the environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub generative: GenerativeConfig,
    pub weather: WeatherConfig,
    pub speech: SpeechConfig,
    pub records_path: PathBuf,
    /// When set, records and checklist sessions live in PostgreSQL.
    pub database_url: Option<String>,
    pub port: u16,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `SPEECH_API_KEY` falls back to `GEMINI_API_KEY`; both are Google Cloud keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let generative = GenerativeConfig::from_lookup(&lookup)?;

        let weather = WeatherConfig {
            api_key: non_empty(lookup("AEMET_API_KEY")),
            base_url: non_empty(lookup("AEMET_BASE_URL"))
                .unwrap_or_else(|| WeatherConfig::default().base_url),
        };

        let speech_defaults = SpeechConfig::default();
        let speech = SpeechConfig {
            api_key: non_empty(lookup("SPEECH_API_KEY")).or_else(|| generative.api_key.clone()),
            base_url: non_empty(lookup("SPEECH_BASE_URL")).unwrap_or(speech_defaults.base_url),
            language: non_empty(lookup("SPEECH_LANGUAGE")).unwrap_or(speech_defaults.language),
        };

        let port = match non_empty(lookup("PORT")) {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                key: "PORT",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let log_format = match non_empty(lookup("LOG_FORMAT")) {
            Some(raw) => LogFormat::parse(&raw)?,
            None => LogFormat::default(),
        };

        Ok(Self {
            generative,
            weather,
            speech,
            records_path: non_empty(lookup("RECORDS_PATH"))
                .unwrap_or_else(|| DEFAULT_RECORDS_PATH.to_string())
                .into(),
            database_url: non_empty(lookup("DATABASE_URL")),
            port,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        Config::from_lookup(|key| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 8001);
        assert_eq!(config.records_path, PathBuf::from("insurance_data.json"));
        assert!(config.database_url.is_none());
        assert!(config.weather.api_key.is_none());
        assert_eq!(config.speech.language, "es-ES");
        assert_eq!(config.generative.response_language, "Spanish");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn log_format_is_read_from_the_environment() {
        let config = config_from(&[("LOG_FORMAT", "Pretty")]).unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);

        let err = config_from(&[("LOG_FORMAT", "xml")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "LOG_FORMAT", .. }));
    }

    #[test]
    fn speech_key_falls_back_to_gemini_key() {
        let config = config_from(&[("GEMINI_API_KEY", "g-key")]).unwrap();
        assert_eq!(config.speech.api_key.as_deref(), Some("g-key"));

        let config =
            config_from(&[("GEMINI_API_KEY", "g-key"), ("SPEECH_API_KEY", "s-key")]).unwrap();
        assert_eq!(config.speech.api_key.as_deref(), Some("s-key"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("DATABASE_URL", "  "), ("AEMET_API_KEY", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.weather.api_key.is_none());
    }
}
