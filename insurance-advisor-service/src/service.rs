use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        DefaultBodyLimit, Multipart, Query, State,
        multipart::MultipartError,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::{Json, Response},
    routing::{get, post},
};
use bytes::Bytes;
use chrono::NaiveDate;
use prompt_flow::{
    ChecklistSession, ChecklistSessionStore, Coordinates, FlowError, GeminiClient,
    InMemoryChecklistSessionStore, InsuranceRecord, JsonFileRecordStore, PromptRunner, PromptTask,
    RecordStore,
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    checklist::{ReportChecklist, ReportStatus},
    config::Config,
    gateways::{
        transcription::{GoogleSpeechGateway, TranscriptionError, TranscriptionGateway},
        weather::{AemetClient, WeatherGateway},
    },
    media::{normalize_audio, normalize_image},
    models::{
        AccidentFactsRequest, AccidentFactsResponse, AnalyzeConditionRequest,
        AnalyzeConditionResponse, ClimatologyQuery, ClimatologyResponse, ImageAnalysisResponse,
        InsuranceExtractionResponse, Location, PersonalizedPlanResponse, PredictQuery,
        PredictResponse, RecordsResponse, ReportResponse, SaveRecordResponse,
    },
};

/// Largest accepted request body; sized for phone photos and voice notes.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

const CORRELATION_HEADER: &str = "x-correlation-id";

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, kind: &str, detail: &str) -> ApiError {
    (status, Json(json!({ "detail": detail, "error": kind })))
}

fn bad_request_error(message: &str) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "detail": message,
            "error": "not_found",
            "session_id": id
        })),
    )
}

/// Model output never reaches the caller; it is only logged.
fn flow_error(err: FlowError) -> ApiError {
    let status = match &err {
        FlowError::Configuration(_) | FlowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        FlowError::Upstream(_) | FlowError::Parse { .. } | FlowError::SchemaMismatch { .. } => {
            StatusCode::BAD_GATEWAY
        }
        FlowError::Conversion(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
    };
    let detail = match &err {
        FlowError::Configuration(_) => "The generative AI service is not configured".to_string(),
        FlowError::Upstream(_) => "The generative AI service failed to answer".to_string(),
        FlowError::Parse { .. } => {
            "The generative AI service returned a response that is not valid JSON".to_string()
        }
        FlowError::Storage(_) => "Failed to access insurance records".to_string(),
        FlowError::SchemaMismatch { .. } | FlowError::Conversion(_) => err.to_string(),
    };
    error!(kind = err.kind(), error = %err, "Request failed");
    error_response(status, err.kind(), &detail)
}

fn transcription_error(err: TranscriptionError) -> ApiError {
    let status = match &err {
        TranscriptionError::Conversion(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        TranscriptionError::UnintelligibleAudio => StatusCode::UNPROCESSABLE_ENTITY,
        TranscriptionError::Service(_) => StatusCode::BAD_GATEWAY,
    };
    warn!(kind = err.kind(), error = %err, "Transcription failed");
    error_response(status, err.kind(), &err.to_string())
}

fn multipart_error(err: MultipartError) -> ApiError {
    error_response(err.status(), "bad_request", &err.body_text())
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    warn!(error = %rejection.body_text(), "Rejected JSON body");
    bad_request_error(&rejection.body_text())
}

fn query_rejection(rejection: QueryRejection) -> ApiError {
    warn!(error = %rejection.body_text(), "Rejected query string");
    bad_request_error(&rejection.body_text())
}

#[derive(Clone)]
pub struct AppState {
    pub runner: PromptRunner,
    pub records: Arc<dyn RecordStore>,
    pub sessions: Arc<dyn ChecklistSessionStore>,
    pub weather: WeatherGateway,
    pub transcriber: Arc<dyn TranscriptionGateway>,
    pub checklist: ReportChecklist,
}

pub async fn create_app(config: &Config) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state))
}

async fn create_app_state(config: &Config) -> anyhow::Result<AppState> {
    let (records, sessions) = create_storage(config).await?;
    let client = Arc::new(GeminiClient::new(config.generative.clone()));

    Ok(AppState {
        runner: PromptRunner::from_config(client, &config.generative),
        records,
        sessions,
        weather: WeatherGateway::new(Arc::new(AemetClient::new(config.weather.clone()))),
        transcriber: Arc::new(GoogleSpeechGateway::new(config.speech.clone())),
        checklist: ReportChecklist::default(),
    })
}

async fn create_storage(
    config: &Config,
) -> anyhow::Result<(Arc<dyn RecordStore>, Arc<dyn ChecklistSessionStore>)> {
    match &config.database_url {
        Some(database_url) => {
            info!("Using PostgreSQL storage for records and report sessions");
            let pool = prompt_flow::storage_postgres::connect(database_url).await?;
            Ok((
                Arc::new(prompt_flow::PostgresRecordStore::new(pool.clone())),
                Arc::new(prompt_flow::PostgresChecklistSessionStore::new(pool)),
            ))
        }
        None => {
            info!(
                path = %config.records_path.display(),
                "Using JSON file record storage (set DATABASE_URL to use PostgreSQL)"
            );
            Ok((
                Arc::new(JsonFileRecordStore::new(config.records_path.clone())),
                Arc::new(InMemoryChecklistSessionStore::new()),
            ))
        }
    }
}

/// Tags every request with a correlation ID, reusing the caller's when it sends one.
async fn correlation_id_middleware(mut request: Request<axum::body::Body>, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/analyze_vehicle_condition", post(analyze_vehicle_condition))
        .route("/accident_facts", post(accident_facts))
        .route("/personalized_plan", post(personalized_plan))
        .route("/process_image", post(process_image))
        .route("/extract_insurance_data", post(extract_insurance_data))
        .route("/analyze_report", post(analyze_report))
        .route("/insurance", post(save_record).get(list_records))
        .route("/predict", get(predict))
        .route("/weather/climatology", get(climatology))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Tractor Insurance Advisor",
        "version": "1.0.0",
        "description": "AI-assisted coverage analysis, claims intake and weather-aware recommendations",
        "endpoints": {
            "POST /analyze_vehicle_condition": "Check a described condition against policy coverage",
            "POST /accident_facts": "Extract structured facts from an accident report",
            "POST /personalized_plan": "Coverage plan for an insurance record and its local weather",
            "POST /process_image": "Analyze a tractor incident photo",
            "POST /extract_insurance_data": "Extract policy fields from a tractor photo",
            "POST /analyze_report": "Transcribe a spoken accident report and track missing details",
            "POST /insurance": "Save an insurance record",
            "GET /insurance": "List saved insurance records",
            "GET /predict": "Weather-based coverage recommendations for a location",
            "GET /weather/climatology": "Daily climatological values for a weather station",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn require_text(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(bad_request_error(&format!("{field} cannot be empty")));
    }
    Ok(())
}

async fn analyze_vehicle_condition(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeConditionRequest>, JsonRejection>,
) -> ApiResult<AnalyzeConditionResponse> {
    let Json(request) = payload.map_err(json_rejection)?;
    require_text(&request.description, "description")?;
    info!("Analyzing vehicle condition against coverage");

    let coverage_analysis = state
        .runner
        .run(PromptTask::CoverageAnalysis {
            description: request.description.clone(),
            coverage_data: request.coverage_data,
        })
        .await
        .map_err(flow_error)?;

    Ok(Json(AnalyzeConditionResponse {
        description: request.description,
        coverage_analysis,
    }))
}

async fn accident_facts(
    State(state): State<AppState>,
    payload: Result<Json<AccidentFactsRequest>, JsonRejection>,
) -> ApiResult<AccidentFactsResponse> {
    let Json(request) = payload.map_err(json_rejection)?;
    require_text(&request.report, "report")?;

    let accident_facts = state
        .runner
        .run(PromptTask::AccidentFacts {
            report: request.report,
        })
        .await
        .map_err(flow_error)?;

    Ok(Json(AccidentFactsResponse { accident_facts }))
}

fn validate_record(record: &InsuranceRecord) -> Result<(), ApiError> {
    require_text(&record.tractor_model, "tractor_model")?;
    validate_coordinates(record.coordinates)
}

fn validate_coordinates(coordinates: Coordinates) -> Result<(), ApiError> {
    if !(-90.0..=90.0).contains(&coordinates.lat) || !(-180.0..=180.0).contains(&coordinates.lon) {
        return Err(bad_request_error(
            "Coordinates out of range: lat must be within [-90, 90] and lon within [-180, 180]",
        ));
    }
    Ok(())
}

async fn personalized_plan(
    State(state): State<AppState>,
    payload: Result<Json<InsuranceRecord>, JsonRejection>,
) -> ApiResult<PersonalizedPlanResponse> {
    let Json(record) = payload.map_err(json_rejection)?;
    validate_record(&record)?;
    info!(tractor_model = %record.tractor_model, "Building personalized plan");

    let weather_data = state.weather.snapshot(record.coordinates, None).await;
    let personalized_plan = state
        .runner
        .run(PromptTask::PersonalizedPlan {
            record: record.clone(),
            weather: Some(Value::Object(weather_data.clone())),
        })
        .await
        .map_err(flow_error)?;

    Ok(Json(PersonalizedPlanResponse {
        record,
        weather_data,
        personalized_plan,
    }))
}

/// A multipart upload: the `file` part plus any other text fields.
struct Upload {
    filename: String,
    data: Bytes,
    fields: HashMap<String, String>,
}

impl Upload {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut file = None;
    let mut fields = HashMap::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let data = field.bytes().await.map_err(multipart_error)?;
            file = Some((filename, data));
        } else {
            let text = field.text().await.map_err(multipart_error)?;
            fields.insert(name, text);
        }
    }

    let (filename, data) = file.ok_or_else(|| bad_request_error("Missing 'file' field"))?;
    if data.is_empty() {
        return Err(bad_request_error("Uploaded file is empty"));
    }
    info!(filename = %filename, bytes = data.len(), "Upload received");

    Ok(Upload {
        filename,
        data,
        fields,
    })
}

async fn process_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<ImageAnalysisResponse> {
    let upload = read_upload(multipart).await?;
    let notes = upload.field("notes").map(str::to_string);
    let image = normalize_image(upload.data).await.map_err(flow_error)?;

    let image_analysis = state
        .runner
        .run(PromptTask::ImageAnalysis { image, notes })
        .await
        .map_err(flow_error)?;

    Ok(Json(ImageAnalysisResponse {
        filename: upload.filename,
        image_analysis,
    }))
}

async fn extract_insurance_data(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<InsuranceExtractionResponse> {
    let upload = read_upload(multipart).await?;
    let image = normalize_image(upload.data).await.map_err(flow_error)?;

    let insurance_data = state
        .runner
        .run(PromptTask::ImageInsuranceExtraction { image })
        .await
        .map_err(flow_error)?;

    Ok(Json(InsuranceExtractionResponse {
        filename: upload.filename,
        insurance_data,
    }))
}

async fn load_report_session(
    state: &AppState,
    session_id: Option<&str>,
) -> Result<ChecklistSession, ApiError> {
    let Some(session_id) = session_id else {
        return Ok(ChecklistSession::new());
    };
    match state.sessions.get(session_id).await {
        Ok(Some(session)) => Ok(session),
        Ok(None) => Err(not_found_error("Report session not found", session_id)),
        Err(e) => Err(flow_error(e)),
    }
}

async fn analyze_report(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<ReportResponse> {
    let upload = read_upload(multipart).await?;
    let mut session = load_report_session(&state, upload.field("session_id")).await?;

    let clip = normalize_audio(upload.data).await.map_err(transcription_error)?;
    let transcript = state
        .transcriber
        .transcribe(&clip)
        .await
        .map_err(transcription_error)?;

    let answered = state.checklist.evaluate(&transcript);
    let newly_answered = session.absorb(&answered);
    let status = state.checklist.status(&session.answered);
    let unanswered_questions = state.checklist.remaining(&session.answered);

    info!(
        session_id = %session.id,
        newly_answered,
        remaining = unanswered_questions.len(),
        "Report turn processed"
    );

    let session_id = session.id.clone();
    if status == ReportStatus::Complete {
        state.sessions.delete(&session_id).await.map_err(flow_error)?;
    } else {
        state.sessions.save(session).await.map_err(flow_error)?;
    }

    Ok(Json(ReportResponse {
        session_id,
        message: transcript,
        status,
        unanswered_questions,
    }))
}

async fn save_record(
    State(state): State<AppState>,
    payload: Result<Json<InsuranceRecord>, JsonRejection>,
) -> ApiResult<SaveRecordResponse> {
    let Json(record) = payload.map_err(json_rejection)?;
    validate_record(&record)?;

    state
        .records
        .append(record.clone())
        .await
        .map_err(flow_error)?;

    Ok(Json(SaveRecordResponse {
        message: "Insurance record saved".to_string(),
        record,
    }))
}

async fn list_records(State(state): State<AppState>) -> ApiResult<RecordsResponse> {
    let records = state.records.list_all().await.map_err(flow_error)?;
    Ok(Json(RecordsResponse { records }))
}

async fn predict(
    State(state): State<AppState>,
    query: Result<Query<PredictQuery>, QueryRejection>,
) -> ApiResult<PredictResponse> {
    let Query(query) = query.map_err(query_rejection)?;
    let coordinates = Coordinates {
        lat: query.lat,
        lon: query.lon,
    };
    validate_coordinates(coordinates)?;

    let weather_data = state
        .weather
        .snapshot(coordinates, query.municipality.as_deref())
        .await;
    let insurance_recommendations = state
        .runner
        .run(PromptTask::WeatherRecommendation {
            coordinates,
            weather: Value::Object(weather_data.clone()),
        })
        .await
        .map_err(flow_error)?;

    Ok(Json(PredictResponse {
        location: Location {
            latitude: query.lat,
            longitude: query.lon,
        },
        weather_data,
        insurance_recommendations,
    }))
}

fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        bad_request_error(&format!("{field} must be a date formatted as YYYY-MM-DD"))
    })
}

async fn climatology(
    State(state): State<AppState>,
    query: Result<Query<ClimatologyQuery>, QueryRejection>,
) -> ApiResult<ClimatologyResponse> {
    let Query(query) = query.map_err(query_rejection)?;
    require_text(&query.station, "station")?;
    let start = parse_date(&query.start, "start")?;
    let end = parse_date(&query.end, "end")?;
    if end < start {
        return Err(bad_request_error("end must not be before start"));
    }

    let data = state.weather.climatology(start, end, query.station.trim()).await;

    Ok(Json(ClimatologyResponse {
        station: query.station,
        start: query.start,
        end: query.end,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::transcription::AudioClip;
    use crate::gateways::transcription::tests::{m4a_bytes, wav_bytes};
    use crate::gateways::weather::tests::{StubWeather, sample_observations};
    use async_trait::async_trait;
    use axum::body::Body;
    use prompt_flow::{
        GenerationRequest, GenerativeClient, GenerativeConfig, InMemoryRecordStore, PromptBuilder,
        TaskKind,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Answers every task with a body that satisfies its schema.
    struct CannedClient {
        override_body: Option<&'static str>,
    }

    fn canned_body(kind: TaskKind) -> Value {
        match kind {
            TaskKind::CoverageAnalysis => json!({"coverage_analysis": [
                {"item": "Colisión", "is_covered": true, "explanation": "Daño por impacto."}
            ]}),
            TaskKind::AccidentFacts => json!({
                "summary": "Salida de vía", "date": "ayer", "location": "camino rural",
                "vehicles_involved": ["tractor"], "injuries": false, "third_parties": [],
                "police_report": false, "missing_information": ["hora exacta"]
            }),
            TaskKind::PersonalizedPlan => json!({
                "plan_name": "Plan Campo", "risk_profile": "medium",
                "coverages": [{"name": "Incendio", "included": true, "reason": "Riesgo estival"}],
                "recommendations": ["Guardar en garaje"]
            }),
            TaskKind::ImageAnalysis => json!({
                "tractor_model": "John Deere 6120M",
                "damage_assessment": {"vehicle_damage": ["faro roto"], "third_party_damage": []},
                "incident_analysis": "Golpe frontal leve",
                "insurance_recommendations": ["Cobertura de daños propios"]
            }),
            TaskKind::ImageInsuranceExtraction => json!({
                "tractor_model": "Kubota M7", "condition": "good", "color": "orange",
                "year": 2019, "additional_description": ""
            }),
            TaskKind::WeatherRecommendation => json!({
                "risk_level": "high", "weather_risks": ["incendio"],
                "recommended_coverages": [{"coverage": "Incendio", "priority": "essential", "reason": "Calor extremo"}],
                "summary": "Temporada de riesgo de incendio"
            }),
        }
    }

    #[async_trait]
    impl GenerativeClient for CannedClient {
        async fn generate(
            &self,
            request: &GenerationRequest,
            _model: &str,
        ) -> prompt_flow::Result<String> {
            Ok(match self.override_body {
                Some(body) => body.to_string(),
                None => canned_body(request.kind()).to_string(),
            })
        }
    }

    /// Hands out transcripts in order.
    struct ScriptedTranscriber {
        transcripts: Mutex<VecDeque<Result<String, TranscriptionError>>>,
    }

    #[async_trait]
    impl TranscriptionGateway for ScriptedTranscriber {
        async fn transcribe(&self, _clip: &AudioClip) -> Result<String, TranscriptionError> {
            self.transcripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TranscriptionError::UnintelligibleAudio))
        }
    }

    fn state_with(
        client: Arc<dyn GenerativeClient>,
        records: Arc<dyn RecordStore>,
        transcripts: Vec<Result<String, TranscriptionError>>,
    ) -> AppState {
        AppState {
            runner: PromptRunner::new(client, PromptBuilder::default(), "text", "vision"),
            records,
            sessions: Arc::new(InMemoryChecklistSessionStore::new()),
            weather: WeatherGateway::new(Arc::new(StubWeather {
                observations: Some(sample_observations()),
                forecast: None,
            })),
            transcriber: Arc::new(ScriptedTranscriber {
                transcripts: Mutex::new(transcripts.into()),
            }),
            checklist: ReportChecklist::default(),
        }
    }

    fn app() -> Router {
        build_router(state_with(
            Arc::new(CannedClient {
                override_body: None,
            }),
            Arc::new(InMemoryRecordStore::new()),
            Vec::new(),
        ))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    const BOUNDARY: &str = "----advisor-test-boundary";

    /// `parts` are (field name, filename, content).
    fn multipart_request(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn png_bytes() -> Vec<u8> {
        let mut buffer = Vec::new();
        image::DynamicImage::new_rgb8(8, 8)
            .write_to(
                &mut std::io::Cursor::new(&mut buffer),
                image::ImageFormat::Png,
            )
            .unwrap();
        buffer
    }

    #[tokio::test]
    async fn health_echoes_correlation_id() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(CORRELATION_HEADER, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CORRELATION_HEADER], "abc-123");
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn coverage_analysis_round_trip() {
        let response = app()
            .oneshot(json_request(
                "POST",
                "/analyze_vehicle_condition",
                json!({"description": "Abolladura en el guardabarros"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(CORRELATION_HEADER));
        let body = body_json(response).await;
        assert_eq!(body["description"], "Abolladura en el guardabarros");
        assert_eq!(
            body["coverage_analysis"]["coverage_analysis"][0]["is_covered"],
            true
        );
    }

    #[tokio::test]
    async fn empty_description_is_a_bad_request() {
        let response = app()
            .oneshot(json_request(
                "POST",
                "/analyze_vehicle_condition",
                json!({"description": "   "}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn unparseable_model_output_is_not_leaked() {
        let app = build_router(state_with(
            Arc::new(CannedClient {
                override_body: Some("Sorry, here is prose instead of JSON"),
            }),
            Arc::new(InMemoryRecordStore::new()),
            Vec::new(),
        ));
        let response = app
            .oneshot(json_request(
                "POST",
                "/accident_facts",
                json!({"report": "Volqué el tractor"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "parse_error");
        assert!(!body.to_string().contains("prose instead"));
    }

    #[tokio::test]
    async fn missing_credential_is_a_configuration_error() {
        let client = Arc::new(GeminiClient::new(GenerativeConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..GenerativeConfig::default()
        }));
        let app = build_router(state_with(
            client,
            Arc::new(InMemoryRecordStore::new()),
            Vec::new(),
        ));
        let response = app
            .oneshot(json_request(
                "POST",
                "/accident_facts",
                json!({"report": "Choque en la finca"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "configuration_error");
    }

    #[tokio::test]
    async fn records_are_saved_to_file_and_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileRecordStore::new(dir.path().join("records.json")));
        let app = build_router(state_with(
            Arc::new(CannedClient {
                override_body: None,
            }),
            store,
            Vec::new(),
        ));
        let record = json!({
            "tractor_model": "Massey Ferguson 5S", "condition": "used", "color": "red",
            "year": 2017, "description": "Viñedo", "coordinates": {"lat": 42.46, "lon": -2.44},
            "garage": true
        });

        let response = app
            .clone()
            .oneshot(json_request("POST", "/insurance", record.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["record"], record);

        let response = app
            .oneshot(Request::builder().uri("/insurance").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["records"], json!([record]));
    }

    #[tokio::test]
    async fn predict_combines_weather_and_recommendations() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/predict?lat=40.4168&lon=-3.7038")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["location"]["latitude"], 40.4168);
        assert_eq!(body["weather_data"]["region"], "MADRID RETIRO");
        assert_eq!(body["weather_data"]["forecast"], "No data");
        assert_eq!(body["insurance_recommendations"]["risk_level"], "high");
    }

    #[tokio::test]
    async fn predict_rejects_out_of_range_coordinates() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/predict?lat=123&lon=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn personalized_plan_includes_weather() {
        let record = json!({
            "tractor_model": "Fendt 724", "condition": "new", "color": "green",
            "year": 2024, "description": "", "coordinates": {"lat": 40.41, "lon": -3.68},
            "garage": false
        });
        let response = app()
            .oneshot(json_request("POST", "/personalized_plan", record))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["weather_data"]["station"], "3195");
        assert_eq!(body["personalized_plan"]["plan_name"], "Plan Campo");
    }

    #[tokio::test]
    async fn image_upload_is_analyzed() {
        let png = png_bytes();
        let response = app()
            .oneshot(multipart_request(
                "/process_image",
                &[
                    ("file", Some("tractor.png"), &png[..]),
                    ("notes", None, &b"Golpe contra un poste"[..]),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["filename"], "tractor.png");
        assert_eq!(body["image_analysis"]["tractor_model"], "John Deere 6120M");
    }

    #[tokio::test]
    async fn non_image_upload_is_unsupported_media() {
        let response = app()
            .oneshot(multipart_request(
                "/extract_insurance_data",
                &[("file", Some("notes.txt"), &b"plain text"[..])],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body_json(response).await["error"], "conversion_error");
    }

    #[tokio::test]
    async fn missing_file_field_is_a_bad_request() {
        let response = app()
            .oneshot(multipart_request(
                "/process_image",
                &[("notes", None, &b"no file here"[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn report_answers_accumulate_across_turns() {
        let app = build_router(state_with(
            Arc::new(CannedClient {
                override_body: None,
            }),
            Arc::new(InMemoryRecordStore::new()),
            vec![
                Ok("Ayer volqué el tractor en el camino".to_string()),
                Ok("No hay heridos, golpeé la valla del vecino y vino la guardia civil".to_string()),
            ],
        ));
        let wav = wav_bytes(16, 64);

        let response = app
            .clone()
            .oneshot(multipart_request(
                "/analyze_report",
                &[("file", Some("turn1.wav"), &wav[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = body_json(response).await;
        assert_eq!(first["status"], "incomplete");
        assert_eq!(first["unanswered_questions"].as_array().unwrap().len(), 3);
        let session_id = first["session_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(multipart_request(
                "/analyze_report",
                &[
                    ("file", Some("turn2.wav"), &wav[..]),
                    ("session_id", None, session_id.as_bytes()),
                ],
            ))
            .await
            .unwrap();
        let second = body_json(response).await;
        assert_eq!(second["session_id"], session_id);
        assert_eq!(second["status"], "complete");
        assert!(second["unanswered_questions"].as_array().unwrap().is_empty());

        // A finished report is discarded.
        let response = app
            .oneshot(multipart_request(
                "/analyze_report",
                &[
                    ("file", Some("turn3.wav"), &wav[..]),
                    ("session_id", None, session_id.as_bytes()),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completed_report_session_is_removed_from_the_store() {
        let state = state_with(
            Arc::new(CannedClient {
                override_body: None,
            }),
            Arc::new(InMemoryRecordStore::new()),
            vec![
                Ok("Ayer choqué con el tractor en el camino".to_string()),
                Ok("Esta mañana volqué el tractor en la carretera; no hay heridos, \
                    rompí la valla del vecino y la guardia civil hizo el atestado"
                    .to_string()),
            ],
        );
        let sessions = state.sessions.clone();
        let app = build_router(state);
        let wav = wav_bytes(16, 64);

        let response = app
            .clone()
            .oneshot(multipart_request("/analyze_report", &[("file", Some("a.wav"), &wav[..])]))
            .await
            .unwrap();
        let first = body_json(response).await;
        assert_eq!(first["status"], "incomplete");
        let open_id = first["session_id"].as_str().unwrap().to_string();
        assert!(sessions.get(&open_id).await.unwrap().is_some());

        let response = app
            .oneshot(multipart_request("/analyze_report", &[("file", Some("b.wav"), &wav[..])]))
            .await
            .unwrap();
        let single_turn = body_json(response).await;
        assert_eq!(single_turn["status"], "complete");
        let done_id = single_turn["session_id"].as_str().unwrap();
        assert!(sessions.get(done_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn m4a_voice_note_is_transcribed() {
        let app = build_router(state_with(
            Arc::new(CannedClient {
                override_body: None,
            }),
            Arc::new(InMemoryRecordStore::new()),
            vec![Ok("Ayer choqué con el tractor".to_string())],
        ));
        let m4a = m4a_bytes(20);
        let response = app
            .oneshot(multipart_request(
                "/analyze_report",
                &[("file", Some("audio.m4a"), &m4a[..])],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Ayer choqué con el tractor");
        assert_eq!(body["status"], "incomplete");
    }

    #[tokio::test]
    async fn unknown_report_session_is_not_found() {
        let wav = wav_bytes(16, 16);
        let response = app()
            .oneshot(multipart_request(
                "/analyze_report",
                &[
                    ("file", Some("a.wav"), &wav[..]),
                    ("session_id", None, &b"does-not-exist"[..]),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unintelligible_audio_is_unprocessable() {
        let wav = wav_bytes(16, 16);
        let response = app()
            .oneshot(multipart_request(
                "/analyze_report",
                &[("file", Some("silence.wav"), &wav[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"], "unintelligible_audio");
    }

    #[tokio::test]
    async fn undecodable_report_audio_is_unsupported_media() {
        let response = app()
            .oneshot(multipart_request(
                "/analyze_report",
                &[("file", Some("a.mp3"), &b"ID3\x04\x00mp3"[..])],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn malformed_json_body_is_a_bad_request() {
        for (uri, body) in [
            ("/accident_facts", r#"{"text": "x"}"#),
            ("/analyze_vehicle_condition", "{not json"),
            ("/insurance", r#"{"tractor_model": "Kubota M7"}"#),
        ] {
            let response = app()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(uri)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(
                response.headers()["content-type"],
                "application/json",
                "{uri}"
            );
            let body = body_json(response).await;
            assert_eq!(body["error"], "bad_request");
            assert!(body["detail"].is_string());
        }
    }

    #[tokio::test]
    async fn missing_query_parameter_is_a_bad_request() {
        for uri in [
            "/predict?lat=40.4",
            "/predict?lat=north&lon=0",
            "/weather/climatology?start=2024-07-01",
        ] {
            let response = app()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            let body = body_json(response).await;
            assert_eq!(body["error"], "bad_request");
            assert!(body["detail"].as_str().unwrap().contains("query"));
        }
    }

    #[tokio::test]
    async fn climatology_validates_dates() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/weather/climatology?start=01-07-2024&end=2024-07-02&station=C3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/weather/climatology?start=2024-07-01&end=2024-07-02&station=C3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["indicativo"], "C3");
    }
}
