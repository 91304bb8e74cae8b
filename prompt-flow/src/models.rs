use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Parsed model output. Its shape is whatever the task template asked for.
pub type StructuredRecommendation = serde_json::Value;

/// Binary payload sent alongside a prompt, tagged with its mime type.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn png(data: impl Into<Bytes>) -> Self {
        Self::new("image/png", data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// A user-submitted tractor insurance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsuranceRecord {
    pub tractor_model: String,
    pub condition: String,
    pub color: String,
    pub year: i32,
    pub description: String,
    pub coordinates: Coordinates,
    pub garage: bool,
}

#[cfg(test)]
pub(crate) fn sample_record(model: &str) -> InsuranceRecord {
    InsuranceRecord {
        tractor_model: model.to_string(),
        condition: "good".to_string(),
        color: "green".to_string(),
        year: 2018,
        description: "Used for vineyard work".to_string(),
        coordinates: Coordinates {
            lat: 40.4168,
            lon: -3.7038,
        },
        garage: true,
    }
}
