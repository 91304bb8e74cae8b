use thiserror::Error;

/// Failures raised anywhere along the prompt → generate → parse pipeline.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Missing or unusable configuration, e.g. no API credential.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The generative endpoint errored, or its stream ended abnormally.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The accumulated model output was not valid JSON.
    #[error("Failed to parse model response as JSON: {message}")]
    Parse { raw: String, message: String },

    /// Valid JSON that does not match the task's result schema.
    #[error("Response for {task} does not match its schema: {}", violations.join("; "))]
    SchemaMismatch {
        task: String,
        violations: Vec<String>,
    },

    /// Input media could not be converted to its canonical encoding.
    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl FlowError {
    /// Stable machine-readable name used at the HTTP boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Configuration(_) => "configuration_error",
            FlowError::Upstream(_) => "upstream_error",
            FlowError::Parse { .. } => "parse_error",
            FlowError::SchemaMismatch { .. } => "schema_mismatch",
            FlowError::Conversion(_) => "conversion_error",
            FlowError::Storage(_) => "storage_error",
        }
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::Storage(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        FlowError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
