pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod parser;
pub mod prompt;
pub mod runner;
pub mod schema;
pub mod storage;

#[cfg(feature = "postgres")]
pub mod storage_postgres;

// Re-export commonly used types
pub use client::{GeminiClient, GenerativeClient, accumulate_fragments};
pub use config::{ConfigError, GenerativeConfig};
pub use error::{FlowError, Result};
pub use models::{Attachment, Coordinates, InsuranceRecord, StructuredRecommendation};
pub use parser::parse_response;
pub use prompt::{GenerationRequest, PromptBuilder, PromptTask, TaskKind};
pub use runner::PromptRunner;
pub use schema::ResultSchema;
pub use storage::{
    ChecklistSession, ChecklistSessionStore, InMemoryChecklistSessionStore, InMemoryRecordStore,
    JsonFileRecordStore, RecordStore,
};
#[cfg(feature = "postgres")]
pub use storage_postgres::{PostgresChecklistSessionStore, PostgresRecordStore};
