//! Domain types shared across the fetcher, rule engine and store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved trade direction derived from a signal's bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "buy",
            Direction::Sell => "sell",
        }
    }

    /// The per-timeframe signal value that counts as alignment
    /// with this direction.
    pub fn expected_timeframe_signal(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(Direction::Buy),
            "sell" => Some(Direction::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timeframe's verdict for a symbol.
///
/// Price-level fields (`entry`, `stop_loss`, `take_profit`, `risk_reward`)
/// are opaque pass-through values preserved for the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeSignal {
    /// "BUY" | "SELL" | "NEUTRAL", upper-cased at parse time.
    pub signal: String,
    pub confidence: Option<f64>,
    pub strength: Option<f64>,
    pub trend: Option<String>,
    pub entry: Option<Value>,
    pub stop_loss: Option<Value>,
    pub take_profit: Option<Value>,
    pub risk_reward: Option<Value>,
}

/// One symbol's full upstream picture for the current cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Upper-cased, trimmed, never empty.
    pub symbol: String,
    /// "BULLISH" | "BEARISH" | "NEUTRAL" | "PENDING" | other, upper-cased.
    pub bias: String,
    pub market_phase: Option<String>,
    pub confidence: Option<f64>,
    pub is_stale: Option<bool>,
    pub price: Option<f64>,
    /// Timeframe label (e.g. "D1", "H4") to verdict.
    pub timeframes: BTreeMap<String, TimeframeSignal>,
    /// Original payload, preserved verbatim for audit/UI.
    pub raw: Value,
}

/// A user-owned automation rule. Empty filter lists match everything;
/// an empty timeframe chain never matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub enabled: bool,
    pub symbols: Vec<String>,
    pub biases: Vec<String>,
    pub market_phases: Vec<String>,
    pub timeframe_chain: Vec<String>,
}

/// Structured short-circuit trail entry for a rule evaluation.
///
/// Kept as a tagged enum so tests and the UI can match on the specific
/// outcome without string parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MatchReason {
    RuleDisabled,
    SignalStale,
    SymbolNotSelected,
    NoTradeBias { bias: String },
    BiasNotSelected,
    UnrecognizedBias { bias: String },
    MarketPhaseNotSelected,
    EmptyTimeframeChain,
    TimeframeMissing { timeframe: String },
    TimeframeNeutral { timeframe: String },
    TimeframeMisaligned {
        timeframe: String,
        found: String,
        expected: String,
    },
    Aligned,
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::RuleDisabled => write!(f, "rule is disabled"),
            MatchReason::SignalStale => write!(f, "signal is stale (not active)"),
            MatchReason::SymbolNotSelected => write!(f, "symbol not selected by rule"),
            MatchReason::NoTradeBias { bias } => {
                write!(f, "bias '{}' treated as no-trade", bias)
            }
            MatchReason::BiasNotSelected => write!(f, "bias filter did not match"),
            MatchReason::UnrecognizedBias { bias } => {
                write!(f, "unrecognized bias '{}' (no-trade)", bias)
            }
            MatchReason::MarketPhaseNotSelected => {
                write!(f, "market phase filter did not match")
            }
            MatchReason::EmptyTimeframeChain => {
                write!(f, "rule has no timeframe configured")
            }
            MatchReason::TimeframeMissing { timeframe } => {
                write!(f, "missing timeframe '{}' in signal payload", timeframe)
            }
            MatchReason::TimeframeNeutral { timeframe } => {
                write!(f, "timeframe '{}' is NEUTRAL (no alignment)", timeframe)
            }
            MatchReason::TimeframeMisaligned {
                timeframe,
                found,
                expected,
            } => write!(
                f,
                "timeframe '{}' signal '{}' != expected '{}'",
                timeframe, found, expected
            ),
            MatchReason::Aligned => {
                write!(f, "matched: bias, market phase and timeframe chain aligned")
            }
        }
    }
}

/// Outcome of evaluating one rule against one signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatchResult {
    pub rule_id: i64,
    pub rule_name: String,
    pub symbol: String,
    pub direction: Option<Direction>,
    pub matched: bool,
    /// Ordered short-circuit trail; the last entry is the deciding one.
    pub reasons: Vec<MatchReason>,
    /// Structured trace of every input consulted.
    pub debug: Value,
    pub matched_at: DateTime<Utc>,
}

/// A published "this symbol is authorized to trade" decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePair {
    pub symbol: String,
    pub direction: Direction,
    pub timeframes: Vec<String>,
    pub market_phase: Option<String>,
    pub bias: String,
    pub confidence: Option<f64>,
    pub matched_rule_ids: Vec<i64>,
    pub matched_rule_names: Vec<String>,
    pub matched_at: DateTime<Utc>,
}

/// A stored active pair as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct ActivePairRow {
    pub symbol: String,
    pub direction: Direction,
    pub timeframes: Vec<String>,
    pub market_phase: Option<String>,
    pub confidence: Option<f64>,
    pub matched_rule_ids: Vec<i64>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A stored rule match as read back from the store, joined to its rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatchRow {
    pub rule_id: i64,
    pub rule_name: String,
    pub symbol: String,
    pub direction: Direction,
    pub reason: Value,
    pub matched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A stored per-symbol snapshot of the last raw upstream payload.
#[derive(Debug, Clone, Serialize)]
pub struct SignalSnapshot {
    pub symbol: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// Diagnostics for one fetch, surfaced on the runner status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMeta {
    pub source: String,
    pub pages_fetched: u32,
    pub signals_count: usize,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Errors from the fetch protocol. Transport and status errors are retried
/// internally; callers only see the terminal variants.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("signals URL is not configured")]
    MissingUrl,

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}: {snippet}")]
    Status {
        url: String,
        status: u16,
        snippet: String,
    },

    #[error("failed to read signals file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("signals file {path} is not valid JSON: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("fetch failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Upper-case and trim a list of filter tokens, dropping empties.
/// Duplicates are preserved.
pub fn normalize_tokens<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().trim().to_uppercase())
        .filter(|v| !v.is_empty())
        .collect()
}
