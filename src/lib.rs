//! Automation runner library.
//!
//! Ingests third-party trading signals, evaluates user-defined automation
//! rules against them, and publishes the resolved active-pair set with a
//! fail-safe expiry for an external trade-execution component.

pub mod config;
pub mod engine;
pub mod fetcher;
pub mod parser;
pub mod runner;
pub mod store;
pub mod types;


// Re-export main types for convenience
pub use config::{AuthMode, FetchConfig, RunnerConfig, SignalSource};
pub use engine::{evaluate_rule, evaluate_rules};
pub use fetcher::SignalFetcher;
pub use parser::parse_signals;
pub use runner::{Runner, RunnerStatus};
pub use store::{NewRule, RuleUpdate, Store};
pub use types::{
    ActivePair, ActivePairRow, AutomationRule, Direction, FetchError, FetchMeta, MatchReason,
    RuleMatchResult, Signal, TimeframeSignal,
};
