//! PromptRunner – convenience wrapper that renders a task, makes exactly **one** generation
//! call, and decodes the answer.
//!
//! ## Pipeline
//! 1. [`PromptBuilder`] renders the [`PromptTask`] into a prompt (+ optional attachment).
//! 2. The model is picked by task: image tasks go to the vision model, the rest to the
//!    text model.
//! 3. [`GenerativeClient`] streams the answer and returns the accumulated text.
//! 4. [`parse_response`] decodes it strictly; nothing partial ever reaches the caller.
//! 5. The decoded value is checked against the task's [`ResultSchema`] (skipped in
//!    [`PromptRunner::lenient`] mode, which passes any valid JSON through untouched).
//!
//! No step retries. Whatever fails first is returned to the caller.
//!
//! ## Sharing
//! `PromptRunner` is cheap to clone (one `Arc` plus a few strings), so build it once at
//! startup and keep it in the HTTP state.

use std::sync::Arc;

use tracing::info;

use crate::{
    client::GenerativeClient,
    config::GenerativeConfig,
    error::Result,
    models::StructuredRecommendation,
    parser::parse_response,
    prompt::{PromptBuilder, PromptTask},
    schema::ResultSchema,
};

#[derive(Clone)]
pub struct PromptRunner {
    client: Arc<dyn GenerativeClient>,
    builder: PromptBuilder,
    text_model: String,
    vision_model: String,
    validate_schema: bool,
}

impl PromptRunner {
    pub fn new(
        client: Arc<dyn GenerativeClient>,
        builder: PromptBuilder,
        text_model: impl Into<String>,
        vision_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            builder,
            text_model: text_model.into(),
            vision_model: vision_model.into(),
            validate_schema: true,
        }
    }

    /// Models and response language taken from `config`.
    pub fn from_config(client: Arc<dyn GenerativeClient>, config: &GenerativeConfig) -> Self {
        Self::new(
            client,
            PromptBuilder::new(config.response_language.clone()),
            config.text_model.clone(),
            config.vision_model.clone(),
        )
    }

    /// Skip schema validation and return any valid JSON unchanged.
    pub fn lenient(mut self) -> Self {
        self.validate_schema = false;
        self
    }

    pub fn model_for(&self, task: &PromptTask) -> &str {
        if task.kind().requires_vision() {
            &self.vision_model
        } else {
            &self.text_model
        }
    }

    /// Run one task through build → generate → parse → validate.
    pub async fn run(&self, task: PromptTask) -> Result<StructuredRecommendation> {
        let kind = task.kind();
        let model = self.model_for(&task).to_string();
        let request = self.builder.request(task);

        info!(task = %kind, model = %model, "Running prompt task");

        let raw = self.client.generate(&request, &model).await?;
        let value = parse_response(&raw)?;

        if self.validate_schema {
            ResultSchema::for_task(kind).validate(&value)?;
        }

        info!(task = %kind, "Prompt task completed");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::models::Attachment;
    use crate::prompt::GenerationRequest;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Returns a canned body and remembers what it was asked.
    struct StubClient {
        reply: std::result::Result<String, String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl StubClient {
        fn replying(body: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(body.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GenerativeClient for StubClient {
        async fn generate(&self, request: &GenerationRequest, model: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), request.prompt().to_string()));
            self.reply.clone().map_err(FlowError::Upstream)
        }
    }

    fn runner(client: Arc<StubClient>) -> PromptRunner {
        PromptRunner::new(client, PromptBuilder::default(), "text-model", "vision-model")
    }

    fn coverage_task() -> PromptTask {
        PromptTask::CoverageAnalysis {
            description: "dent on rear bumper".to_string(),
            coverage_data: json!({"policy": "12345", "coverage": ["Collision"]}),
        }
    }

    #[tokio::test]
    async fn coverage_analysis_end_to_end() {
        let body = r#"{"coverage_analysis": [{"item": "Collision", "is_covered": true, "explanation": "A dent from an impact is collision damage."}]}"#;
        let client = StubClient::replying(body);
        let result = runner(client.clone()).run(coverage_task()).await.unwrap();

        let items = result["coverage_analysis"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        for item in items {
            assert!(item["item"].is_string());
            assert!(item["is_covered"].is_boolean());
            assert!(item["explanation"].is_string());
        }

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].0, "text-model");
        assert!(calls[0].1.contains("dent on rear bumper"));
    }

    #[tokio::test]
    async fn malformed_output_is_a_parse_error_with_raw_text() {
        let client = StubClient::replying("The vehicle is covered for collision.");
        let err = runner(client).run(coverage_task()).await.unwrap_err();
        match err {
            FlowError::Parse { raw, .. } => {
                assert_eq!(raw, "The vehicle is covered for collision.")
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_shape_is_a_schema_mismatch_unless_lenient() {
        let body = r#"{"coverage": "yes"}"#;

        let err = runner(StubClient::replying(body))
            .run(coverage_task())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::SchemaMismatch { .. }));

        let value = runner(StubClient::replying(body))
            .lenient()
            .run(coverage_task())
            .await
            .unwrap();
        assert_eq!(value, json!({"coverage": "yes"}));
    }

    #[tokio::test]
    async fn image_tasks_use_the_vision_model() {
        let body = r#"{"tractor_model": "Kubota L1", "condition": "good", "color": "orange", "year": 2020, "additional_description": ""}"#;
        let client = StubClient::replying(body);
        runner(client.clone())
            .run(PromptTask::ImageInsuranceExtraction {
                image: Attachment::png(vec![0u8; 4]),
            })
            .await
            .unwrap();
        assert_eq!(client.calls.lock().unwrap()[0].0, "vision-model");
    }

    #[tokio::test]
    async fn upstream_errors_propagate_without_retry() {
        let client = StubClient::failing("503 Service Unavailable");
        let err = runner(client.clone()).run(coverage_task()).await.unwrap_err();
        assert!(matches!(err, FlowError::Upstream(_)));
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }
}
