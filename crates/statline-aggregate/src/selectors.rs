//! Stock value selectors for [`crate::aggregate`].

use serde_json::Value;
use statline_core::Record;

/// Every record is worth one.
pub fn count(_record: &Record) -> f64 {
    1.0
}

/// Reads a numeric payload field. Missing or non-numeric fields count as 0;
/// numeric strings are accepted since some sources stringify everything.
pub fn payload_number(field: &str) -> impl Fn(&Record) -> f64 + '_ {
    move |record| match record.payload.get(field) {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(flag)) => f64::from(u8::from(*flag)),
        _ => 0.0,
    }
}
