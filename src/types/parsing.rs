//! Strict parsing of model output.

use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed output: {0}")]
    Malformed(String),
    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("unknown action type '{0}'")]
    UnknownAction(String),
}

/// A record a model stage must produce.
pub trait StageOutput: DeserializeOwned + Send + 'static {
    /// Range and consistency checks serde cannot express.
    fn validate(&self) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Deserialize and validate one stage's raw output.
///
/// Missing fields, unknown fields, wrong types and out-of-range values are
/// all rejected. A partial record is never returned.
pub fn parse_stage_output<T: StageOutput>(raw: Value) -> Result<T, ParseError> {
    let parsed: T =
        serde_json::from_value(raw).map_err(|e| ParseError::Malformed(e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

/// Reject NaN and anything outside `[0, 1]`.
pub(crate) fn check_unit(field: &'static str, value: f64) -> Result<(), ParseError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ParseError::OutOfRange {
            field,
            value: value.to_string(),
        })
    }
}
