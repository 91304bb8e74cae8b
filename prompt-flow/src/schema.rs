//! Per-task result schemas.
//!
//! The templates in [`crate::prompt`] describe the JSON the model must return;
//! these schemas check the parsed value actually has that shape, including
//! the closed value sets the templates name. Only the listed fields are
//! checked, extra fields are allowed.

use serde_json::Value;
use tracing::warn;

use crate::error::{FlowError, Result};
use crate::prompt::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Array,
    Object,
    String,
    Integer,
    Boolean,
}

impl JsonType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
            JsonType::String => value.is_string(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Boolean => value.is_boolean(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            JsonType::Array => "array",
            JsonType::Object => "object",
            JsonType::String => "string",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One required field.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: JsonType,
    /// Element type for arrays.
    pub element: Option<JsonType>,
    /// Required sub-fields of an object, or of each object element of an array.
    pub fields: &'static [FieldRule],
    /// Accepted values of a string field; empty means any string.
    pub allowed: &'static [&'static str],
}

const fn field(name: &'static str, kind: JsonType) -> FieldRule {
    FieldRule {
        name,
        kind,
        element: None,
        fields: &[],
        allowed: &[],
    }
}

const fn list_of(name: &'static str, element: JsonType) -> FieldRule {
    FieldRule {
        name,
        kind: JsonType::Array,
        element: Some(element),
        fields: &[],
        allowed: &[],
    }
}

const fn objects(name: &'static str, fields: &'static [FieldRule]) -> FieldRule {
    FieldRule {
        name,
        kind: JsonType::Array,
        element: Some(JsonType::Object),
        fields,
        allowed: &[],
    }
}

const fn object(name: &'static str, fields: &'static [FieldRule]) -> FieldRule {
    FieldRule {
        name,
        kind: JsonType::Object,
        element: None,
        fields,
        allowed: &[],
    }
}

const fn one_of(name: &'static str, allowed: &'static [&'static str]) -> FieldRule {
    FieldRule {
        name,
        kind: JsonType::String,
        element: None,
        fields: &[],
        allowed,
    }
}

const RISK_LEVELS: &[&str] = &["low", "medium", "high"];
const PRIORITIES: &[&str] = &["essential", "recommended", "optional"];

use JsonType::{Boolean, Integer, String as Str};

const COVERAGE_ITEM: &[FieldRule] = &[
    field("item", Str),
    field("is_covered", Boolean),
    field("explanation", Str),
];

const COVERAGE_ANALYSIS: &[FieldRule] = &[objects("coverage_analysis", COVERAGE_ITEM)];

const ACCIDENT_FACTS: &[FieldRule] = &[
    field("summary", Str),
    field("date", Str),
    field("location", Str),
    list_of("vehicles_involved", Str),
    field("injuries", Boolean),
    list_of("third_parties", Str),
    field("police_report", Boolean),
    list_of("missing_information", Str),
];

const PLAN_COVERAGE: &[FieldRule] = &[
    field("name", Str),
    field("included", Boolean),
    field("reason", Str),
];

const PERSONALIZED_PLAN: &[FieldRule] = &[
    field("plan_name", Str),
    one_of("risk_profile", RISK_LEVELS),
    objects("coverages", PLAN_COVERAGE),
    list_of("recommendations", Str),
];

const DAMAGE_ASSESSMENT: &[FieldRule] = &[
    list_of("vehicle_damage", Str),
    list_of("third_party_damage", Str),
];

const IMAGE_ANALYSIS: &[FieldRule] = &[
    field("tractor_model", Str),
    object("damage_assessment", DAMAGE_ASSESSMENT),
    field("incident_analysis", Str),
    list_of("insurance_recommendations", Str),
];

const IMAGE_INSURANCE_EXTRACTION: &[FieldRule] = &[
    field("tractor_model", Str),
    field("condition", Str),
    field("color", Str),
    field("year", Integer),
    field("additional_description", Str),
];

const RECOMMENDED_COVERAGE: &[FieldRule] = &[
    field("coverage", Str),
    one_of("priority", PRIORITIES),
    field("reason", Str),
];

const WEATHER_RECOMMENDATION: &[FieldRule] = &[
    one_of("risk_level", RISK_LEVELS),
    list_of("weather_risks", Str),
    objects("recommended_coverages", RECOMMENDED_COVERAGE),
    field("summary", Str),
];

/// Expected top-level shape of one task's output.
#[derive(Debug, Clone, Copy)]
pub struct ResultSchema {
    pub task: TaskKind,
    pub fields: &'static [FieldRule],
}

impl ResultSchema {
    pub fn for_task(task: TaskKind) -> Self {
        let fields = match task {
            TaskKind::CoverageAnalysis => COVERAGE_ANALYSIS,
            TaskKind::AccidentFacts => ACCIDENT_FACTS,
            TaskKind::PersonalizedPlan => PERSONALIZED_PLAN,
            TaskKind::ImageAnalysis => IMAGE_ANALYSIS,
            TaskKind::ImageInsuranceExtraction => IMAGE_INSURANCE_EXTRACTION,
            TaskKind::WeatherRecommendation => WEATHER_RECOMMENDATION,
        };
        Self { task, fields }
    }

    /// List every way `value` departs from the schema.
    pub fn violations(&self, value: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        if !value.is_object() {
            violations.push(format!("$: expected object, found {}", type_name(value)));
            return violations;
        }
        check_fields(value, self.fields, "$", &mut violations);
        violations
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        let violations = self.violations(value);
        if violations.is_empty() {
            return Ok(());
        }
        warn!(task = %self.task, ?violations, "Model response does not match schema");
        Err(FlowError::SchemaMismatch {
            task: self.task.to_string(),
            violations,
        })
    }
}

fn check_fields(value: &Value, rules: &[FieldRule], path: &str, out: &mut Vec<String>) {
    for rule in rules {
        let field_path = format!("{path}.{}", rule.name);
        match value.get(rule.name) {
            None => out.push(format!("{field_path}: missing")),
            Some(found) => check_rule(found, rule, &field_path, out),
        }
    }
}

fn check_rule(value: &Value, rule: &FieldRule, path: &str, out: &mut Vec<String>) {
    if !rule.kind.matches(value) {
        out.push(format!(
            "{path}: expected {}, found {}",
            rule.kind.name(),
            type_name(value)
        ));
        return;
    }

    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{path}[{i}]");
                if let Some(element) = rule.element {
                    if !element.matches(item) {
                        out.push(format!(
                            "{item_path}: expected {}, found {}",
                            element.name(),
                            type_name(item)
                        ));
                        continue;
                    }
                }
                if !rule.fields.is_empty() {
                    check_fields(item, rule.fields, &item_path, out);
                }
            }
        }
        Value::Object(_) => check_fields(value, rule.fields, path, out),
        Value::String(text)
            if !rule.allowed.is_empty() && !rule.allowed.contains(&text.as_str()) =>
        {
            out.push(format!(
                "{path}: expected one of {}, found {text:?}",
                rule.allowed.join(", ")
            ));
        }
        _ => {}
    }
}
