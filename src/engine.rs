//! Rule engine - pure evaluation of automation rules against signals.
//!
//! Evaluation is a short-circuiting checklist: the first failing check
//! terminates with a specific reason. A rule matches only when every
//! timeframe in its chain agrees with the bias-implied direction
//! (full-chain alignment, not majority).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::types::{
    ActivePair, AutomationRule, Direction, MatchReason, RuleMatchResult, Signal,
};

/// Biases that are never tradable, regardless of filters.
const NO_TRADE_BIASES: [&str; 3] = ["NEUTRAL", "PENDING", ""];

/// Map a normalized bias to a trade direction. Anything outside
/// BULLISH/BEARISH has no direction.
pub fn direction_for_bias(bias: &str) -> Option<Direction> {
    match bias.trim().to_uppercase().as_str() {
        "BULLISH" => Some(Direction::Buy),
        "BEARISH" => Some(Direction::Sell),
        _ => None,
    }
}

/// Evaluate a single signal against a rule. Pure and deterministic apart
/// from the `matched_at` timestamp.
pub fn evaluate_rule(rule: &AutomationRule, signal: &Signal) -> RuleMatchResult {
    let now = Utc::now();
    let mut reasons = Vec::new();
    let mut debug = base_debug(rule, signal);

    if !rule.enabled {
        reasons.push(MatchReason::RuleDisabled);
        return no_match(rule, signal, reasons, debug, now);
    }

    // An upstream-flagged inactive signal is never tradable.
    if signal.is_stale == Some(true) {
        reasons.push(MatchReason::SignalStale);
        return no_match(rule, signal, reasons, debug, now);
    }

    if !rule.symbols.is_empty() && !contains_normalized(&rule.symbols, &signal.symbol) {
        reasons.push(MatchReason::SymbolNotSelected);
        return no_match(rule, signal, reasons, debug, now);
    }

    let bias = signal.bias.trim().to_uppercase();
    if NO_TRADE_BIASES.contains(&bias.as_str()) {
        reasons.push(MatchReason::NoTradeBias { bias });
        return no_match(rule, signal, reasons, debug, now);
    }

    if !rule.biases.is_empty() && !contains_normalized(&rule.biases, &bias) {
        reasons.push(MatchReason::BiasNotSelected);
        return no_match(rule, signal, reasons, debug, now);
    }

    let Some(direction) = direction_for_bias(&bias) else {
        reasons.push(MatchReason::UnrecognizedBias { bias });
        return no_match(rule, signal, reasons, debug, now);
    };

    let phase = signal
        .market_phase
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_uppercase();
    if !rule.market_phases.is_empty() && !contains_normalized(&rule.market_phases, &phase) {
        reasons.push(MatchReason::MarketPhaseNotSelected);
        return no_match(rule, signal, reasons, debug, now);
    }

    let chain: Vec<String> = rule
        .timeframe_chain
        .iter()
        .map(|tf| tf.trim().to_uppercase())
        .filter(|tf| !tf.is_empty())
        .collect();
    if chain.is_empty() {
        // A rule with no timeframe is meaningless; structural no-trade.
        reasons.push(MatchReason::EmptyTimeframeChain);
        return no_match(rule, signal, reasons, debug, now);
    }

    let expected = direction.expected_timeframe_signal();
    let mut tf_debug = Map::new();

    for tf in &chain {
        let Some(tf_sig) = signal.timeframes.get(tf) else {
            // Missing data blocks the whole rule; no partial matches.
            tf_debug.insert(tf.clone(), json!({"present": false}));
            debug["timeframes"] = Value::Object(tf_debug);
            reasons.push(MatchReason::TimeframeMissing {
                timeframe: tf.clone(),
            });
            return no_match(rule, signal, reasons, debug, now);
        };

        let tf_value = tf_sig.signal.trim().to_uppercase();
        tf_debug.insert(
            tf.clone(),
            json!({
                "present": true,
                "signal": tf_value,
                "confidence": tf_sig.confidence,
                "strength": tf_sig.strength,
                "trend": tf_sig.trend,
            }),
        );

        if tf_value.is_empty() || tf_value == "NEUTRAL" {
            debug["timeframes"] = Value::Object(tf_debug);
            reasons.push(MatchReason::TimeframeNeutral {
                timeframe: tf.clone(),
            });
            return no_match(rule, signal, reasons, debug, now);
        }

        if tf_value != expected {
            debug["timeframes"] = Value::Object(tf_debug);
            reasons.push(MatchReason::TimeframeMisaligned {
                timeframe: tf.clone(),
                found: tf_value,
                expected: expected.to_string(),
            });
            return no_match(rule, signal, reasons, debug, now);
        }
    }

    debug["timeframes"] = Value::Object(tf_debug);
    reasons.push(MatchReason::Aligned);

    RuleMatchResult {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        symbol: signal.symbol.clone(),
        direction: Some(direction),
        matched: true,
        reasons,
        debug,
        matched_at: now,
    }
}

/// Evaluate all rules across all signals and resolve the active-pair set.
///
/// Conflict policy: a symbol matched with more than one distinct direction
/// is excluded entirely - ambiguity never resolves to an arbitrary trade.
pub fn evaluate_rules(
    signals: &[Signal],
    rules: &[AutomationRule],
) -> (Vec<RuleMatchResult>, BTreeMap<String, ActivePair>) {
    let mut results = Vec::new();
    let mut activations: BTreeMap<String, Activation> = BTreeMap::new();

    for rule in rules {
        for signal in signals {
            // Cheap prefilter by the rule's symbol allow-list.
            if !rule.symbols.is_empty() && !contains_normalized(&rule.symbols, &signal.symbol) {
                continue;
            }

            let result = evaluate_rule(rule, signal);
            if !result.matched {
                continue;
            }

            let entry = activations
                .entry(signal.symbol.clone())
                .or_insert_with(|| Activation {
                    directions: BTreeSet::new(),
                    rule_ids: BTreeSet::new(),
                    rule_names: BTreeSet::new(),
                    market_phase: signal.market_phase.clone(),
                    bias: signal.bias.clone(),
                    confidence: signal.confidence,
                    timeframes: rule.timeframe_chain.clone(),
                    matched_at: result.matched_at,
                });
            if let Some(direction) = result.direction {
                entry.directions.insert(direction);
            }
            entry.rule_ids.insert(result.rule_id);
            entry.rule_names.insert(result.rule_name.clone());

            results.push(result);
        }
    }

    let mut active_pairs = BTreeMap::new();
    for (symbol, activation) in activations {
        // Conflict => do not activate.
        if activation.directions.len() != 1 {
            continue;
        }
        let Some(direction) = activation.directions.iter().next().copied() else {
            continue;
        };

        active_pairs.insert(
            symbol.clone(),
            ActivePair {
                symbol,
                direction,
                timeframes: activation.timeframes,
                market_phase: activation.market_phase,
                bias: activation.bias,
                confidence: activation.confidence,
                matched_rule_ids: activation.rule_ids.into_iter().collect(),
                matched_rule_names: activation.rule_names.into_iter().collect(),
                matched_at: activation.matched_at,
            },
        );
    }

    (results, active_pairs)
}

struct Activation {
    directions: BTreeSet<Direction>,
    rule_ids: BTreeSet<i64>,
    rule_names: BTreeSet<String>,
    market_phase: Option<String>,
    bias: String,
    confidence: Option<f64>,
    timeframes: Vec<String>,
    matched_at: DateTime<Utc>,
}

fn contains_normalized(haystack: &[String], needle: &str) -> bool {
    haystack
        .iter()
        .any(|v| v.trim().to_uppercase() == needle)
}

fn base_debug(rule: &AutomationRule, signal: &Signal) -> Value {
    json!({
        "signal_bias": signal.bias,
        "signal_market_phase": signal.market_phase,
        "signal_is_stale": signal.is_stale,
        "rule": {
            "id": rule.id,
            "name": rule.name,
            "enabled": rule.enabled,
            "symbols": rule.symbols,
            "biases": rule.biases,
            "market_phases": rule.market_phases,
            "timeframe_chain": rule.timeframe_chain,
        },
    })
}

fn no_match(
    rule: &AutomationRule,
    signal: &Signal,
    reasons: Vec<MatchReason>,
    debug: Value,
    now: DateTime<Utc>,
) -> RuleMatchResult {
    RuleMatchResult {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        symbol: signal.symbol.clone(),
        direction: None,
        matched: false,
        reasons,
        debug,
        matched_at: now,
    }
}
