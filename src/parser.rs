//! Tolerant parsing of upstream signal payloads.
//!
//! The provider's response schema is duck-typed JSON. Everything here is
//! total: malformed items degrade to defaults or get dropped, and no input
//! shape ever produces an error.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::{Signal, TimeframeSignal};

/// Candidate keys under which a wrapped response may carry its item list,
/// checked in order; the first present key wins.
pub const ITEM_KEYS: [&str; 4] = ["data", "results", "items", "symbols"];

/// Locate the item list in a payload: either the payload itself is a list,
/// or it is an object carrying the list under one of [`ITEM_KEYS`].
pub fn extract_items(payload: &Value) -> Option<&Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => ITEM_KEYS
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(Value::as_array),
        _ => None,
    }
}

/// Parse an API payload into signals. Items without a usable symbol are
/// silently skipped; unrecognized payload shapes yield an empty list.
pub fn parse_signals(payload: &Value) -> Vec<Signal> {
    let Some(items) = extract_items(payload) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| item.as_object().and_then(parse_signal))
        .collect()
}

/// Parse one signal object. Returns `None` when the item has no symbol.
/// Unknown fields are preserved in `Signal::raw` for UI transparency.
pub fn parse_signal(item: &Map<String, Value>) -> Option<Signal> {
    let symbol = upper_string(item.get("symbol")).unwrap_or_default();
    if symbol.is_empty() {
        return None;
    }

    let mut timeframes = BTreeMap::new();
    if let Some(Value::Object(tf_map)) = item.get("timeframes") {
        for (tf, tf_payload) in tf_map {
            let Some(tf_obj) = tf_payload.as_object() else {
                continue;
            };
            let label = tf.trim().to_uppercase();
            if label.is_empty() {
                continue;
            }
            timeframes.insert(label, parse_timeframe_signal(tf_obj));
        }
    }

    Some(Signal {
        symbol,
        bias: upper_string(item.get("bias")).unwrap_or_default(),
        market_phase: upper_string(item.get("market_phase")),
        confidence: number(item.get("confidence")),
        is_stale: boolean(item.get("is_stale")),
        price: number(item.get("price")),
        timeframes,
        raw: Value::Object(item.clone()),
    })
}

fn parse_timeframe_signal(tf: &Map<String, Value>) -> TimeframeSignal {
    TimeframeSignal {
        signal: upper_string(tf.get("signal")).unwrap_or_else(|| "NEUTRAL".to_string()),
        confidence: number(tf.get("confidence")),
        strength: number(tf.get("strength")),
        trend: upper_string(tf.get("trend")),
        entry: tf.get("entry").cloned(),
        stop_loss: tf.get("stop_loss").cloned(),
        take_profit: tf.get("take_profit").cloned(),
        risk_reward: tf.get("risk_reward").cloned(),
    }
}

/// Upper-cased, trimmed string; `None` for absent/null/empty values.
fn upper_string(value: Option<&Value>) -> Option<String> {
    let normalized = match value? {
        Value::String(s) => s.trim().to_uppercase(),
        Value::Null => return None,
        other => other.to_string().trim().to_uppercase(),
    };
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Accept a value only if it is numeric.
fn number(value: Option<&Value>) -> Option<f64> {
    value?.as_f64()
}

/// Accept a value only if it is a boolean.
fn boolean(value: Option<&Value>) -> Option<bool> {
    value?.as_bool()
}
