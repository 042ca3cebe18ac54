//! SQLite-backed state store.
//!
//! Two concerns live here: rule CRUD (scoped by `user_id` for mutation and
//! listing) and the published per-cycle state (signal snapshots, active
//! pairs, rule matches). Publishes are replace-not-merge and run inside a
//! single transaction, so readers always observe either the complete prior
//! cycle's result set or the complete new one. `expires_at` is a fail-safe
//! for a stalled runner; the primary removal mechanism is the replace.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::types::{
    normalize_tokens, ActivePair, ActivePairRow, AutomationRule, Direction, RuleMatchResult,
    RuleMatchRow, SignalSnapshot,
};

/// Fields for a new rule. Filter lists are normalized on write.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub user_id: String,
    pub name: String,
    pub enabled: bool,
    pub symbols: Vec<String>,
    pub biases: Vec<String>,
    pub market_phases: Vec<String>,
    pub timeframe_chain: Vec<String>,
}

/// Partial rule update: only supplied fields are written.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub symbols: Option<Vec<String>>,
    pub biases: Option<Vec<String>>,
    pub market_phases: Option<Vec<String>>,
    pub timeframe_chain: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect and create tables if missing.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // In-memory databases exist per connection; a pool of one keeps
        // every query on the same database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    async fn ensure_tables(&self) -> sqlx::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS automation_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                symbols_json TEXT NOT NULL DEFAULT '[]',
                biases_json TEXT NOT NULL DEFAULT '[]',
                phases_json TEXT NOT NULL DEFAULT '[]',
                timeframes_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_automation_rules_user ON automation_rules(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_automation_rules_enabled ON automation_rules(enabled)",
            r#"
            CREATE TABLE IF NOT EXISTS automation_active_pairs (
                symbol TEXT PRIMARY KEY,
                direction TEXT NOT NULL CHECK(direction IN ('buy','sell')),
                timeframes_json TEXT NOT NULL DEFAULT '[]',
                market_phase TEXT,
                confidence REAL,
                matched_rule_ids_json TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_automation_active_pairs_expires \
             ON automation_active_pairs(expires_at)",
            r#"
            CREATE TABLE IF NOT EXISTS automation_rule_matches (
                rule_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL CHECK(direction IN ('buy','sell')),
                reason_json TEXT NOT NULL DEFAULT '{}',
                matched_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (rule_id, symbol)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_automation_rule_matches_expires \
             ON automation_rule_matches(expires_at)",
            r#"
            CREATE TABLE IF NOT EXISTS automation_signal_snapshots (
                symbol TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- Rule CRUD ----

    /// List one user's rules, newest first.
    pub async fn list_rules(&self, user_id: &str) -> sqlx::Result<Vec<AutomationRule>> {
        let rows = sqlx::query(
            "SELECT * FROM automation_rules WHERE user_id = ? ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    /// Unscoped rule listing for the runner.
    pub async fn list_all_rules(&self, enabled_only: bool) -> sqlx::Result<Vec<AutomationRule>> {
        let query = if enabled_only {
            "SELECT * FROM automation_rules WHERE enabled = 1 ORDER BY id DESC"
        } else {
            "SELECT * FROM automation_rules ORDER BY id DESC"
        };
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    pub async fn create_rule(&self, rule: &NewRule) -> sqlx::Result<i64> {
        let now = Utc::now();
        let name = rule.name.trim();
        let result = sqlx::query(
            r#"
            INSERT INTO automation_rules
            (user_id, name, enabled, symbols_json, biases_json, phases_json, timeframes_json,
             created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.user_id)
        .bind(if name.is_empty() { "Rule" } else { name })
        .bind(rule.enabled)
        .bind(tokens_json(&rule.symbols))
        .bind(tokens_json(&rule.biases))
        .bind(tokens_json(&rule.market_phases))
        .bind(tokens_json(&rule.timeframe_chain))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Update only the supplied fields. Returns false when no rule matches
    /// both `rule_id` and `user_id` - a foreign rule is invisible here.
    pub async fn update_rule(
        &self,
        rule_id: i64,
        user_id: &str,
        update: &RuleUpdate,
    ) -> sqlx::Result<bool> {
        let name = update.name.as_deref().map(|n| {
            let n = n.trim();
            if n.is_empty() { "Rule".to_string() } else { n.to_string() }
        });
        let result = sqlx::query(
            r#"
            UPDATE automation_rules SET
                name = COALESCE(?, name),
                enabled = COALESCE(?, enabled),
                symbols_json = COALESCE(?, symbols_json),
                biases_json = COALESCE(?, biases_json),
                phases_json = COALESCE(?, phases_json),
                timeframes_json = COALESCE(?, timeframes_json),
                updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(name)
        .bind(update.enabled)
        .bind(update.symbols.as_deref().map(tokens_json))
        .bind(update.biases.as_deref().map(tokens_json))
        .bind(update.market_phases.as_deref().map(tokens_json))
        .bind(update.timeframe_chain.as_deref().map(tokens_json))
        .bind(Utc::now())
        .bind(rule_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns false when no rule matches both `rule_id` and `user_id`.
    pub async fn delete_rule(&self, rule_id: i64, user_id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = ? AND user_id = ?")
            .bind(rule_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- Signal snapshots ----

    /// Last-write-wins upsert of raw payloads, keyed by symbol.
    pub async fn upsert_signal_snapshots(
        &self,
        snapshots: &[(String, Value)],
    ) -> sqlx::Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (symbol, payload) in snapshots {
            sqlx::query(
                r#"
                INSERT INTO automation_signal_snapshots (symbol, payload_json, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(symbol) DO UPDATE SET
                    payload_json = excluded.payload_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(symbol)
            .bind(payload.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn list_signal_snapshots(&self, limit: i64) -> sqlx::Result<Vec<SignalSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, payload_json, updated_at
            FROM automation_signal_snapshots
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SignalSnapshot {
                    symbol: row.try_get("symbol")?,
                    payload: json_or_default(row.try_get("payload_json")?, json!({})),
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    // ---- Publish surface ----

    /// Replace the published active-pair set in one transaction. Symbols
    /// absent from `pairs` disappear immediately; `expires_at` is computed
    /// once and applied uniformly to every row of the cycle.
    pub async fn replace_active_pairs(
        &self,
        pairs: &BTreeMap<String, ActivePair>,
        ttl_seconds: i64,
    ) -> sqlx::Result<()> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM automation_active_pairs")
            .execute(&mut *tx)
            .await?;

        for pair in pairs.values() {
            sqlx::query(
                r#"
                INSERT INTO automation_active_pairs
                (symbol, direction, timeframes_json, market_phase, confidence,
                 matched_rule_ids_json, updated_at, expires_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&pair.symbol)
            .bind(pair.direction.as_str())
            .bind(tokens_json(&pair.timeframes))
            .bind(&pair.market_phase)
            .bind(pair.confidence)
            .bind(serde_json::to_string(&pair.matched_rule_ids).unwrap_or_else(|_| "[]".into()))
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }

        // Purge already-lapsed rows; defense in depth after the replace.
        sqlx::query("DELETE FROM automation_active_pairs WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Replace the current cycle's match audit records in one transaction.
    /// Only matched results carry a direction and get stored.
    pub async fn replace_rule_matches(
        &self,
        matches: &[RuleMatchResult],
        ttl_seconds: i64,
    ) -> sqlx::Result<()> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM automation_rule_matches")
            .execute(&mut *tx)
            .await?;

        for result in matches {
            let Some(direction) = result.direction else {
                continue;
            };
            let reason = json!({
                "reasons": result.reasons,
                "debug": result.debug,
            });
            sqlx::query(
                r#"
                INSERT INTO automation_rule_matches
                (rule_id, symbol, direction, reason_json, matched_at, expires_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(rule_id, symbol) DO UPDATE SET
                    direction = excluded.direction,
                    reason_json = excluded.reason_json,
                    matched_at = excluded.matched_at,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(result.rule_id)
            .bind(&result.symbol)
            .bind(direction.as_str())
            .bind(reason.to_string())
            .bind(result.matched_at)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM automation_rule_matches WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    // ---- Read surface ----

    /// Non-expired active pairs, newest first.
    pub async fn list_active_pairs(&self) -> sqlx::Result<Vec<ActivePairRow>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, direction, timeframes_json, market_phase, confidence,
                   matched_rule_ids_json, updated_at, expires_at
            FROM automation_active_pairs
            WHERE expires_at > ?
            ORDER BY updated_at DESC, symbol ASC
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ActivePairRow {
                    symbol: row.try_get("symbol")?,
                    direction: decode_direction(row.try_get("direction")?)?,
                    timeframes: json_list(row.try_get("timeframes_json")?),
                    market_phase: row.try_get("market_phase")?,
                    confidence: row.try_get("confidence")?,
                    matched_rule_ids: json_list(row.try_get("matched_rule_ids_json")?),
                    updated_at: row.try_get("updated_at")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }

    /// One user's non-expired match audit records, joined to rule names.
    pub async fn list_rule_matches(&self, user_id: &str) -> sqlx::Result<Vec<RuleMatchRow>> {
        let rows = sqlx::query(
            r#"
            SELECT rm.rule_id, r.name AS rule_name, rm.symbol, rm.direction,
                   rm.reason_json, rm.matched_at, rm.expires_at
            FROM automation_rule_matches rm
            JOIN automation_rules r ON r.id = rm.rule_id
            WHERE r.user_id = ? AND rm.expires_at > ?
            ORDER BY rm.matched_at DESC, rm.symbol ASC
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RuleMatchRow {
                    rule_id: row.try_get("rule_id")?,
                    rule_name: row.try_get("rule_name")?,
                    symbol: row.try_get("symbol")?,
                    direction: decode_direction(row.try_get("direction")?)?,
                    reason: json_or_default(row.try_get("reason_json")?, json!({})),
                    matched_at: row.try_get("matched_at")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }
}

fn rule_from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<AutomationRule> {
    Ok(AutomationRule {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        symbols: normalize_tokens(json_list::<String>(row.try_get("symbols_json")?)),
        biases: normalize_tokens(json_list::<String>(row.try_get("biases_json")?)),
        market_phases: normalize_tokens(json_list::<String>(row.try_get("phases_json")?)),
        timeframe_chain: normalize_tokens(json_list::<String>(row.try_get("timeframes_json")?)),
    })
}

fn tokens_json(values: &[String]) -> String {
    serde_json::to_string(&normalize_tokens(values)).unwrap_or_else(|_| "[]".into())
}

fn json_list<T: serde::de::DeserializeOwned>(raw: String) -> Vec<T> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn json_or_default(raw: String, default: Value) -> Value {
    serde_json::from_str(&raw).unwrap_or(default)
}

fn decode_direction(raw: String) -> sqlx::Result<Direction> {
    Direction::parse(&raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("invalid direction '{raw}'").into()))
}
