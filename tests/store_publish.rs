//! State store integration tests: rule CRUD scoping, round-trip
//! normalization, and replace-and-expire publish semantics.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;

use automation_runner::store::{NewRule, RuleUpdate, Store};
use automation_runner::types::{ActivePair, Direction, MatchReason, RuleMatchResult};

async fn store() -> Store {
    Store::connect("sqlite::memory:").await.unwrap()
}

fn new_rule(user_id: &str, name: &str) -> NewRule {
    NewRule {
        user_id: user_id.to_string(),
        name: name.to_string(),
        enabled: true,
        symbols: vec![" eurusd ".to_string(), "gbpusd".to_string()],
        biases: vec!["bullish".to_string()],
        market_phases: vec!["Range".to_string()],
        timeframe_chain: vec!["d1".to_string(), "h4".to_string()],
    }
}

fn active_pair(symbol: &str, direction: Direction, rule_id: i64) -> ActivePair {
    ActivePair {
        symbol: symbol.to_string(),
        direction,
        timeframes: vec!["D1".to_string()],
        market_phase: Some("RANGE".to_string()),
        bias: "BULLISH".to_string(),
        confidence: Some(0.8),
        matched_rule_ids: vec![rule_id],
        matched_rule_names: vec![format!("rule-{rule_id}")],
        matched_at: Utc::now(),
    }
}

fn matched_result(rule_id: i64, symbol: &str, direction: Direction) -> RuleMatchResult {
    RuleMatchResult {
        rule_id,
        rule_name: format!("rule-{rule_id}"),
        symbol: symbol.to_string(),
        direction: Some(direction),
        matched: true,
        reasons: vec![MatchReason::Aligned],
        debug: json!({"signal_bias": "BULLISH"}),
        matched_at: Utc::now(),
    }
}

#[tokio::test]
async fn rule_crud_round_trip_is_normalized() {
    let store = store().await;

    let id = store.create_rule(&new_rule("user-1", "  London open  ")).await.unwrap();
    let rules = store.list_rules("user-1").await.unwrap();
    assert_eq!(rules.len(), 1);

    let rule = &rules[0];
    assert_eq!(rule.id, id);
    assert_eq!(rule.name, "London open");
    assert!(rule.enabled);
    assert_eq!(rule.symbols, vec!["EURUSD", "GBPUSD"]);
    assert_eq!(rule.biases, vec!["BULLISH"]);
    assert_eq!(rule.market_phases, vec!["RANGE"]);
    assert_eq!(rule.timeframe_chain, vec!["D1", "H4"]);
}

#[tokio::test]
async fn update_writes_only_supplied_fields() {
    let store = store().await;
    let id = store.create_rule(&new_rule("user-1", "base")).await.unwrap();

    let update = RuleUpdate {
        enabled: Some(false),
        timeframe_chain: Some(vec!["m15".to_string()]),
        ..RuleUpdate::default()
    };
    assert!(store.update_rule(id, "user-1", &update).await.unwrap());

    let rule = &store.list_rules("user-1").await.unwrap()[0];
    assert!(!rule.enabled);
    assert_eq!(rule.timeframe_chain, vec!["M15"]);
    // Untouched fields survive.
    assert_eq!(rule.name, "base");
    assert_eq!(rule.symbols, vec!["EURUSD", "GBPUSD"]);
}

#[tokio::test]
async fn mutation_is_scoped_to_owner() {
    let store = store().await;
    let id = store.create_rule(&new_rule("user-1", "mine")).await.unwrap();

    // A foreign rule is invisible to mutation: reported as not-found.
    let update = RuleUpdate {
        enabled: Some(false),
        ..RuleUpdate::default()
    };
    assert!(!store.update_rule(id, "user-2", &update).await.unwrap());
    assert!(!store.delete_rule(id, "user-2").await.unwrap());
    assert!(store.list_rules("user-2").await.unwrap().is_empty());

    // The owner still sees it untouched, then deletes it.
    let rule = &store.list_rules("user-1").await.unwrap()[0];
    assert!(rule.enabled);
    assert!(store.delete_rule(id, "user-1").await.unwrap());
    assert!(store.list_rules("user-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn enabled_only_listing_for_the_runner() {
    let store = store().await;
    store.create_rule(&new_rule("user-1", "on")).await.unwrap();
    let off_id = store.create_rule(&new_rule("user-2", "off")).await.unwrap();
    let update = RuleUpdate {
        enabled: Some(false),
        ..RuleUpdate::default()
    };
    store.update_rule(off_id, "user-2", &update).await.unwrap();

    let all = store.list_all_rules(false).await.unwrap();
    assert_eq!(all.len(), 2);

    let enabled = store.list_all_rules(true).await.unwrap();
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].name, "on");
}

#[tokio::test]
async fn replace_active_pairs_drops_absent_symbols_immediately() {
    let store = store().await;

    let mut pairs = BTreeMap::new();
    pairs.insert("EURUSD".to_string(), active_pair("EURUSD", Direction::Buy, 1));
    store.replace_active_pairs(&pairs, 60).await.unwrap();

    let listed = store.list_active_pairs().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].symbol, "EURUSD");
    assert_eq!(listed[0].direction, Direction::Buy);
    assert_eq!(listed[0].matched_rule_ids, vec![1]);
    assert!(listed[0].expires_at > listed[0].updated_at);

    // Next cycle: EURUSD absent, GBPUSD present. EURUSD must disappear
    // immediately, not merely expire.
    let mut pairs = BTreeMap::new();
    pairs.insert("GBPUSD".to_string(), active_pair("GBPUSD", Direction::Sell, 2));
    store.replace_active_pairs(&pairs, 60).await.unwrap();

    let listed = store.list_active_pairs().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].symbol, "GBPUSD");
    assert_eq!(listed[0].direction, Direction::Sell);
}

#[tokio::test]
async fn lapsed_rows_are_purged_and_filtered() {
    let store = store().await;

    let mut pairs = BTreeMap::new();
    pairs.insert("EURUSD".to_string(), active_pair("EURUSD", Direction::Buy, 1));
    // A non-positive TTL means the row is already lapsed on publish.
    store.replace_active_pairs(&pairs, -1).await.unwrap();
    assert!(store.list_active_pairs().await.unwrap().is_empty());

    store
        .replace_rule_matches(&[matched_result(1, "EURUSD", Direction::Buy)], -1)
        .await
        .unwrap();
    assert!(store.list_rule_matches("user-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_publish_clears_the_table() {
    let store = store().await;

    let mut pairs = BTreeMap::new();
    pairs.insert("EURUSD".to_string(), active_pair("EURUSD", Direction::Buy, 1));
    store.replace_active_pairs(&pairs, 60).await.unwrap();

    store.replace_active_pairs(&BTreeMap::new(), 60).await.unwrap();
    assert!(store.list_active_pairs().await.unwrap().is_empty());
}

#[tokio::test]
async fn rule_matches_are_scoped_and_joined() {
    let store = store().await;
    let mine = store.create_rule(&new_rule("user-1", "mine")).await.unwrap();
    let theirs = store.create_rule(&new_rule("user-2", "theirs")).await.unwrap();

    let matches = vec![
        matched_result(mine, "EURUSD", Direction::Buy),
        matched_result(theirs, "GBPUSD", Direction::Sell),
        // Unmatched results carry no direction and are not persisted.
        RuleMatchResult {
            direction: None,
            matched: false,
            ..matched_result(mine, "USDJPY", Direction::Buy)
        },
    ];
    store.replace_rule_matches(&matches, 60).await.unwrap();

    let listed = store.list_rule_matches("user-1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].symbol, "EURUSD");
    assert_eq!(listed[0].rule_name, "mine");
    assert_eq!(listed[0].reason["reasons"][0]["reason"], "aligned");

    let listed = store.list_rule_matches("user-2").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].symbol, "GBPUSD");
}

#[tokio::test]
async fn signal_snapshots_are_last_write_wins() {
    let store = store().await;

    store
        .upsert_signal_snapshots(&[
            ("EURUSD".to_string(), json!({"v": 1})),
            ("GBPUSD".to_string(), json!({"v": 1})),
        ])
        .await
        .unwrap();
    store
        .upsert_signal_snapshots(&[("EURUSD".to_string(), json!({"v": 2}))])
        .await
        .unwrap();

    let snapshots = store.list_signal_snapshots(10).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    let eur = snapshots.iter().find(|s| s.symbol == "EURUSD").unwrap();
    assert_eq!(eur.payload["v"], 2);
}
