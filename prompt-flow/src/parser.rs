use serde_json::Value;
use tracing::warn;

use crate::error::{FlowError, Result};

/// Strictly decode the accumulated model output.
///
/// No cleanup is attempted (no fence stripping, no partial recovery): text
/// that is not a single JSON document fails with [`FlowError::Parse`], which
/// keeps the offending text for diagnostics.
pub fn parse_response(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        warn!(error = %e, raw = %raw, "Model response is not valid JSON");
        FlowError::Parse {
            raw: raw.to_string(),
            message: e.to_string(),
        }
    })
}
