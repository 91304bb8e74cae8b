use prompt_flow::{InsuranceRecord, StructuredRecommendation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checklist::ReportStatus;

#[derive(Debug, Deserialize)]
pub struct AnalyzeConditionRequest {
    pub description: String,
    /// Policy data the description is checked against; `null` when omitted.
    #[serde(default)]
    pub coverage_data: Value,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeConditionResponse {
    pub description: String,
    pub coverage_analysis: StructuredRecommendation,
}

#[derive(Debug, Deserialize)]
pub struct AccidentFactsRequest {
    pub report: String,
}

#[derive(Debug, Serialize)]
pub struct AccidentFactsResponse {
    pub accident_facts: StructuredRecommendation,
}

#[derive(Debug, Serialize)]
pub struct PersonalizedPlanResponse {
    pub record: InsuranceRecord,
    pub weather_data: Map<String, Value>,
    pub personalized_plan: StructuredRecommendation,
}

#[derive(Debug, Serialize)]
pub struct ImageAnalysisResponse {
    pub filename: String,
    pub image_analysis: StructuredRecommendation,
}

#[derive(Debug, Serialize)]
pub struct InsuranceExtractionResponse {
    pub filename: String,
    pub insurance_data: StructuredRecommendation,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub session_id: String,
    /// The transcript of this turn's recording.
    pub message: String,
    pub status: ReportStatus,
    pub unanswered_questions: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct SaveRecordResponse {
    pub message: String,
    pub record: InsuranceRecord,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub records: Vec<InsuranceRecord>,
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub lat: f64,
    pub lon: f64,
    /// INE municipality code used for the forecast.
    pub municipality: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub location: Location,
    pub weather_data: Map<String, Value>,
    pub insurance_recommendations: StructuredRecommendation,
}

#[derive(Debug, Deserialize)]
pub struct ClimatologyQuery {
    pub start: String,
    pub end: String,
    pub station: String,
}

#[derive(Debug, Serialize)]
pub struct ClimatologyResponse {
    pub station: String,
    pub start: String,
    pub end: String,
    pub data: Value,
}
