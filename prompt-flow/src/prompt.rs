//! Prompt templates for every generative task.
//!
//! Each [`PromptTask`] variant owns one fixed template. A template states the
//! output protocol, lists the JSON fields the model must produce, and then
//! embeds the caller's input exactly as received. Inputs are never validated
//! or sanitized here; whatever the caller sends reaches the model unchanged.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::models::{Attachment, Coordinates, InsuranceRecord};

/// One request's worth of work for the generative model.
#[derive(Debug, Clone)]
pub enum PromptTask {
    /// Decide which items of a policy cover the described vehicle condition.
    CoverageAnalysis {
        description: String,
        coverage_data: Value,
    },
    /// Pull structured accident facts out of a free-text (or transcribed) report.
    AccidentFacts { report: String },
    /// Propose a coverage plan tailored to a saved record and its local weather.
    PersonalizedPlan {
        record: InsuranceRecord,
        weather: Option<Value>,
    },
    /// Identify the tractor in a photo and assess the incident.
    ImageAnalysis {
        image: Attachment,
        notes: Option<String>,
    },
    /// Extract the fields needed to open a new policy from a photo.
    ImageInsuranceExtraction { image: Attachment },
    /// Recommend coverages from the weather around a location.
    WeatherRecommendation {
        coordinates: Coordinates,
        weather: Value,
    },
}

/// Fieldless discriminant of [`PromptTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CoverageAnalysis,
    AccidentFacts,
    PersonalizedPlan,
    ImageAnalysis,
    ImageInsuranceExtraction,
    WeatherRecommendation,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::CoverageAnalysis,
        TaskKind::AccidentFacts,
        TaskKind::PersonalizedPlan,
        TaskKind::ImageAnalysis,
        TaskKind::ImageInsuranceExtraction,
        TaskKind::WeatherRecommendation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CoverageAnalysis => "coverage_analysis",
            TaskKind::AccidentFacts => "accident_facts",
            TaskKind::PersonalizedPlan => "personalized_plan",
            TaskKind::ImageAnalysis => "image_analysis",
            TaskKind::ImageInsuranceExtraction => "image_insurance_extraction",
            TaskKind::WeatherRecommendation => "weather_recommendation",
        }
    }

    /// Image tasks go to the vision-capable model.
    pub fn requires_vision(&self) -> bool {
        matches!(
            self,
            TaskKind::ImageAnalysis | TaskKind::ImageInsuranceExtraction
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PromptTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            PromptTask::CoverageAnalysis { .. } => TaskKind::CoverageAnalysis,
            PromptTask::AccidentFacts { .. } => TaskKind::AccidentFacts,
            PromptTask::PersonalizedPlan { .. } => TaskKind::PersonalizedPlan,
            PromptTask::ImageAnalysis { .. } => TaskKind::ImageAnalysis,
            PromptTask::ImageInsuranceExtraction { .. } => TaskKind::ImageInsuranceExtraction,
            PromptTask::WeatherRecommendation { .. } => TaskKind::WeatherRecommendation,
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            PromptTask::ImageAnalysis { image, .. }
            | PromptTask::ImageInsuranceExtraction { image } => Some(image),
            _ => None,
        }
    }
}

/// A fully rendered call: the task, its prompt text and optional binary payload.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    task: PromptTask,
    prompt: String,
    attachment: Option<Attachment>,
}

impl GenerationRequest {
    pub fn task(&self) -> &PromptTask {
        &self.task
    }

    pub fn kind(&self) -> TaskKind {
        self.task.kind()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }
}

/// Renders [`PromptTask`]s into natural-language instructions.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    response_language: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RESPONSE_LANGUAGE)
    }
}

impl PromptBuilder {
    pub fn new(response_language: impl Into<String>) -> Self {
        Self {
            response_language: response_language.into(),
        }
    }

    pub fn build(&self, task: &PromptTask) -> String {
        let body = match task {
            PromptTask::CoverageAnalysis {
                description,
                coverage_data,
            } => coverage_analysis_prompt(description, &embed_value(coverage_data)),
            PromptTask::AccidentFacts { report } => accident_facts_prompt(report),
            PromptTask::PersonalizedPlan { record, weather } => personalized_plan_prompt(
                &embed_serialized(record),
                &weather
                    .as_ref()
                    .map(embed_value)
                    .unwrap_or_else(|| "No weather data available.".to_string()),
            ),
            PromptTask::ImageAnalysis { notes, .. } => image_analysis_prompt(notes.as_deref()),
            PromptTask::ImageInsuranceExtraction { .. } => image_extraction_prompt(),
            PromptTask::WeatherRecommendation {
                coordinates,
                weather,
            } => weather_recommendation_prompt(coordinates, &embed_value(weather)),
        };

        format!(
            "{PROTOCOL}\nWrite every free-text value in {}.\n{body}",
            self.response_language
        )
    }

    /// Render `task` and freeze it into an immutable [`GenerationRequest`].
    pub fn request(&self, task: PromptTask) -> GenerationRequest {
        let prompt = self.build(&task);
        let attachment = task.attachment().cloned();
        GenerationRequest {
            task,
            prompt,
            attachment,
        }
    }
}

const PROTOCOL: &str = "Follow this protocol strictly: respond with exactly one JSON object and nothing else. \
No markdown fences, no commentary before or after it. Use exactly the field names and types listed below.";

/// Strings go in as written; anything else as compact JSON.
fn embed_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn embed_serialized<T: Serialize + fmt::Debug>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"))
}

fn coverage_analysis_prompt(description: &str, coverage: &str) -> String {
    format!(
        r#"
Given the following description of a vehicle's condition and the coverage information provided, produce a JSON object with these fields:

1. `coverage_analysis` (array of objects). Each object must contain:
    - `item` (string): name of the coverage or exclusion.
    - `is_covered` (boolean): whether it is covered.
    - `explanation` (string): a short explanation of why it is or is not covered.

Vehicle description:
{description}

Coverage information:
{coverage}

Generate the output JSON."#
    )
}

fn accident_facts_prompt(report: &str) -> String {
    format!(
        r#"
Extract the facts of the accident described in the report below. Produce a JSON object with these fields:

1. `summary` (string): one-paragraph neutral summary of what happened.
2. `date` (string): when it happened as stated in the report, or "unknown".
3. `location` (string): where it happened as stated in the report, or "unknown".
4. `vehicles_involved` (array of strings): every vehicle mentioned.
5. `injuries` (boolean): whether anyone was hurt.
6. `third_parties` (array of strings): people or property other than the reporter that were affected.
7. `police_report` (boolean): whether the police were called or a report was filed.
8. `missing_information` (array of strings): facts an insurer would still need to ask for.

Accident report:
{report}

Generate the output JSON."#
    )
}

fn personalized_plan_prompt(record: &str, weather: &str) -> String {
    format!(
        r#"
Design a personalized insurance plan for the tractor described in the record below, taking its local weather into account. Produce a JSON object with these fields:

1. `plan_name` (string): a short name for the plan.
2. `risk_profile` (string): one of "low", "medium" or "high".
3. `coverages` (array of objects). Each object must contain:
    - `name` (string): the coverage.
    - `included` (boolean): whether the plan includes it.
    - `reason` (string): why it is or is not included for this tractor.
4. `recommendations` (array of strings): practical advice for the owner.

Insurance record:
{record}

Local weather:
{weather}

Generate the output JSON."#
    )
}

fn image_analysis_prompt(notes: Option<&str>) -> String {
    let notes = notes
        .map(|n| format!("\nNotes from the reporter:\n{n}\n"))
        .unwrap_or_default();
    format!(
        r#"
Analyze the attached image to identify the tractor model, determine the insurance problem and explain what happened. Produce a JSON object with these fields:

1. `tractor_model` (string): the identified tractor model.
2. `damage_assessment` (object): a breakdown of the damage visible in the image.
    - `vehicle_damage` (array of strings): damage to the tractor.
    - `third_party_damage` (array of strings): damage to third-party property or people.
3. `incident_analysis` (string): a detailed explanation of what happened, based on the image.
4. `insurance_recommendations` (array of strings): coverage or claim recommendations based on the analysis.
{notes}
Generate the output JSON."#
    )
}

fn image_extraction_prompt() -> String {
    r#"
Analyze the attached image to extract the data needed to create an insurance policy. Produce a JSON object with these fields:

1. `tractor_model` (string): the identified tractor model.
2. `condition` (string): the physical condition of the tractor.
3. `color` (string): the tractor's color.
4. `year` (integer): the estimated year of manufacture.
5. `additional_description` (string): any other relevant detail visible in the image.

Generate the output JSON."#
        .to_string()
}

fn weather_recommendation_prompt(coordinates: &Coordinates, weather: &str) -> String {
    format!(
        r#"
Using the current weather and forecast for the location below, recommend insurance coverages for an agricultural vehicle kept there. Produce a JSON object with these fields:

1. `risk_level` (string): one of "low", "medium" or "high".
2. `weather_risks` (array of strings): weather hazards relevant to the location.
3. `recommended_coverages` (array of objects). Each object must contain:
    - `coverage` (string): the recommended coverage.
    - `priority` (string): one of "essential", "recommended" or "optional".
    - `reason` (string): why it is recommended given the weather.
4. `summary` (string): a short explanation for the customer.

Location: latitude {lat}, longitude {lon}

Weather data:
{weather}

Generate the output JSON."#,
        lat = coordinates.lat,
        lon = coordinates.lon,
    )
}
