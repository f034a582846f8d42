//! Result normalisation before event emission.
//!
//! Arbitrary-precision decimals coming out of SQL tools become a JSON number
//! when the value survives the f64 round trip losslessly, a string
//! otherwise. The worker owns this step: every result passes through
//! [`normalize_result`] before it is emitted, whatever the executor did.

use rust_decimal::prelude::*;
use serde_json::{Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("result cannot be represented as an event payload: {0}")]
    Unrepresentable(String),
}

/// Convert a decimal to a JSON number when lossless, a string otherwise.
pub fn decimal_to_json(decimal: Decimal) -> Value {
    if decimal.scale() == 0 {
        // Integral: fits i64?
        if let Some(int) = decimal.to_i64() {
            return Value::from(int);
        }
    }
    if let Some(float) = decimal.to_f64() {
        let round_trip = Decimal::from_f64(float);
        if round_trip == Some(decimal) {
            if let Some(number) = Number::from_f64(float) {
                return Value::Number(number);
            }
        }
    }
    Value::String(decimal.to_string())
}

/// Walk a result and verify every value is event-representable.
///
/// serde_json values are already JSON-shaped, so this is a validation pass:
/// it exists so emission never fails halfway through a payload, and so the
/// rule lives in one place if executors ever hand over richer values.
pub fn normalize_result(value: Value) -> Result<Value, NormalizeError> {
    match value {
        Value::Number(number) => {
            if number.as_f64().map(f64::is_finite) == Some(false) {
                return Err(NormalizeError::Unrepresentable(format!(
                    "non-finite number {number}"
                )));
            }
            Ok(Value::Number(number))
        }
        Value::Array(items) => items
            .into_iter()
            .map(normalize_result)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut normalized = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                normalized.insert(key, normalize_result(item)?);
            }
            Ok(Value::Object(normalized))
        }
        other => Ok(other),
    }
}
