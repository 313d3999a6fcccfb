//! SQLite ledger backend.
//!
//! Uses a single SQLite database file with four tables:
//! - `budget_scopes` — per-(type, id, period) balance rows
//! - `budget_reservations` — in-flight holds, unique on request_id
//! - `usage_events` — permanent billing records, unique on request_id
//! - `usage_rollups_daily` — derived (day, team, key) aggregates
//!
//! Monetary columns are canonical decimal strings; all arithmetic
//! happens in `rust_decimal` before the row is written back. Each
//! compound operation (hold / settle / release) runs in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use spendgate_core::error::LedgerError;
use spendgate_core::money::{fmt_usd, parse_usd, round_usd};
use spendgate_core::reservation::{Reservation, ReservationStatus};
use spendgate_core::scope::{BudgetScope, ScopeKind, ScopeRef, ScopeSpec};
use spendgate_core::store::{HoldOutcome, LedgerStore, ReleaseOutcome, SettleOutcome};
use spendgate_core::usage::{UsageEvent, UsageRollup};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

type SqliteTx<'a> = Transaction<'a, sqlx::Sqlite>;

/// A production SQLite ledger store.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Create a new SQLite ledger from a file path.
    ///
    /// The database and all tables/indexes are created automatically.
    /// Pass `"sqlite::memory:"` for an in-process ephemeral ledger
    /// (useful for tests).
    pub async fn new(path: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| LedgerError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        // An in-memory SQLite database exists per connection; a larger
        // pool would hand each caller a different empty ledger.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite ledger initialized at {path}");
        Ok(store)
    }

    /// Run schema migrations — creates all ledger tables and indexes.
    async fn run_migrations(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS budget_scopes (
                id            TEXT PRIMARY KEY,
                scope_type    TEXT NOT NULL,
                scope_id      TEXT NOT NULL,
                period_start  TEXT NOT NULL,
                limit_usd     TEXT NOT NULL,
                used_usd      TEXT NOT NULL DEFAULT '0',
                reserved_usd  TEXT NOT NULL DEFAULT '0',
                overdraft_usd TEXT NOT NULL DEFAULT '0',
                last_alert_at TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                UNIQUE (scope_type, scope_id, period_start),
                CHECK (CAST(limit_usd AS NUMERIC) >= 0),
                CHECK (CAST(used_usd AS NUMERIC) >= 0),
                CHECK (CAST(reserved_usd AS NUMERIC) >= 0),
                CHECK (CAST(overdraft_usd AS NUMERIC) >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("budget_scopes table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS budget_reservations (
                id            TEXT PRIMARY KEY,
                request_id    TEXT UNIQUE NOT NULL,
                scope_team_id TEXT NOT NULL,
                scope_key_id  TEXT NOT NULL,
                reserved_usd  TEXT NOT NULL,
                status        TEXT NOT NULL
                              CHECK (status IN ('active', 'committed', 'released')),
                expires_at    TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                CHECK (CAST(reserved_usd AS NUMERIC) >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("budget_reservations table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reservations_expiry \
             ON budget_reservations(status, expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("expiry index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_events (
                id                 TEXT PRIMARY KEY,
                request_id         TEXT UNIQUE NOT NULL,
                team_id            TEXT NOT NULL,
                key_id             TEXT NOT NULL,
                cost_usd           TEXT NOT NULL,
                input_tokens       INTEGER NOT NULL DEFAULT 0,
                output_tokens      INTEGER NOT NULL DEFAULT 0,
                pricing_version    TEXT NOT NULL,
                token_count_source TEXT NOT NULL,
                latency_ms         INTEGER NOT NULL DEFAULT 0,
                status             TEXT NOT NULL,
                timestamp          TEXT NOT NULL,
                CHECK (CAST(cost_usd AS NUMERIC) >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("usage_events table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_events_team \
             ON usage_events(team_id, timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("usage_events index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_rollups_daily (
                id            TEXT PRIMARY KEY,
                day           TEXT NOT NULL,
                team_id       TEXT NOT NULL,
                key_id        TEXT NOT NULL,
                used_usd      TEXT NOT NULL DEFAULT '0',
                input_tokens  INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                updated_at    TEXT NOT NULL,
                UNIQUE (day, team_id, key_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError::MigrationFailed(format!("usage_rollups_daily table: {e}")))?;

        debug!("SQLite ledger migrations complete");
        Ok(())
    }

    // ── Row mapping ───────────────────────────────────────────────────

    fn row_to_scope(row: &sqlx::sqlite::SqliteRow) -> Result<BudgetScope, LedgerError> {
        let kind_raw: String = get_text(row, "scope_type")?;
        let kind = ScopeKind::from_str(&kind_raw)
            .map_err(|e| LedgerError::QueryFailed(format!("scope_type column: {e}")))?;

        let last_alert_at: Option<String> = row
            .try_get("last_alert_at")
            .map_err(|e| LedgerError::QueryFailed(format!("last_alert_at column: {e}")))?;

        Ok(BudgetScope {
            id: get_text(row, "id")?,
            kind,
            scope_id: get_text(row, "scope_id")?,
            period_start: parse_day(&get_text(row, "period_start")?, "period_start")?,
            limit_usd: get_amount(row, "limit_usd")?,
            used_usd: get_amount(row, "used_usd")?,
            reserved_usd: get_amount(row, "reserved_usd")?,
            overdraft_usd: get_amount(row, "overdraft_usd")?,
            last_alert_at: last_alert_at
                .map(|raw| parse_ts(&raw, "last_alert_at"))
                .transpose()?,
        })
    }

    fn row_to_reservation(row: &sqlx::sqlite::SqliteRow) -> Result<Reservation, LedgerError> {
        let status_raw: String = get_text(row, "status")?;
        let status = ReservationStatus::from_str(&status_raw)
            .map_err(|e| LedgerError::QueryFailed(format!("status column: {e}")))?;

        Ok(Reservation {
            id: get_text(row, "id")?,
            request_id: get_text(row, "request_id")?,
            team_id: get_text(row, "scope_team_id")?,
            key_id: get_text(row, "scope_key_id")?,
            reserved_usd: get_amount(row, "reserved_usd")?,
            status,
            expires_at: parse_ts(&get_text(row, "expires_at")?, "expires_at")?,
            created_at: parse_ts(&get_text(row, "created_at")?, "created_at")?,
        })
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<UsageEvent, LedgerError> {
        Ok(UsageEvent {
            id: get_text(row, "id")?,
            request_id: get_text(row, "request_id")?,
            team_id: get_text(row, "team_id")?,
            key_id: get_text(row, "key_id")?,
            cost_usd: get_amount(row, "cost_usd")?,
            input_tokens: get_count(row, "input_tokens")? as u32,
            output_tokens: get_count(row, "output_tokens")? as u32,
            pricing_version: get_text(row, "pricing_version")?,
            token_count_source: get_text(row, "token_count_source")?
                .parse()
                .map_err(|e| LedgerError::QueryFailed(format!("token_count_source: {e}")))?,
            latency_ms: get_count(row, "latency_ms")? as u32,
            status: get_text(row, "status")?
                .parse()
                .map_err(|e| LedgerError::QueryFailed(format!("status column: {e}")))?,
            timestamp: parse_ts(&get_text(row, "timestamp")?, "timestamp")?,
        })
    }

    fn row_to_rollup(row: &sqlx::sqlite::SqliteRow) -> Result<UsageRollup, LedgerError> {
        Ok(UsageRollup {
            day: parse_day(&get_text(row, "day")?, "day")?,
            team_id: get_text(row, "team_id")?,
            key_id: get_text(row, "key_id")?,
            used_usd: get_amount(row, "used_usd")?,
            input_tokens: get_count(row, "input_tokens")? as u64,
            output_tokens: get_count(row, "output_tokens")? as u64,
            request_count: get_count(row, "request_count")? as u64,
        })
    }

    // ── Transactional helpers ─────────────────────────────────────────

    async fn fetch_scope_tx(
        tx: &mut SqliteTx<'_>,
        scope: &ScopeRef,
        period: NaiveDate,
    ) -> Result<Option<BudgetScope>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM budget_scopes \
             WHERE scope_type = ?1 AND scope_id = ?2 AND period_start = ?3",
        )
        .bind(scope.kind.as_str())
        .bind(&scope.id)
        .bind(fmt_day(period))
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_db_err("scope lookup", e))?;

        row.as_ref().map(Self::row_to_scope).transpose()
    }

    /// Fetch-or-create inside an open transaction. Lazy creation copies
    /// limit and overdraft from the policy spec.
    async fn ensure_scope_tx(
        tx: &mut SqliteTx<'_>,
        spec: &ScopeSpec,
        period: NaiveDate,
    ) -> Result<BudgetScope, LedgerError> {
        if let Some(scope) = Self::fetch_scope_tx(tx, &spec.scope_ref(), period).await? {
            return Ok(scope);
        }

        let now = fmt_ts(Utc::now());
        let scope = BudgetScope {
            id: Uuid::new_v4().to_string(),
            kind: spec.kind,
            scope_id: spec.id.clone(),
            period_start: period,
            limit_usd: round_usd(spec.limit_usd),
            used_usd: Decimal::ZERO,
            reserved_usd: Decimal::ZERO,
            overdraft_usd: round_usd(spec.overdraft_usd),
            last_alert_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO budget_scopes
                (id, scope_type, scope_id, period_start,
                 limit_usd, used_usd, reserved_usd, overdraft_usd,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, '0', '0', ?6, ?7, ?7)
            "#,
        )
        .bind(&scope.id)
        .bind(scope.kind.as_str())
        .bind(&scope.scope_id)
        .bind(fmt_day(period))
        .bind(fmt_usd(scope.limit_usd))
        .bind(fmt_usd(scope.overdraft_usd))
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_db_err("scope insert", e))?;

        debug!(scope = %spec.scope_ref(), %period, "Budget scope created lazily");
        Ok(scope)
    }

    /// Write a scope's mutable balances back inside a transaction.
    async fn write_balances_tx(
        tx: &mut SqliteTx<'_>,
        scope: &BudgetScope,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE budget_scopes \
             SET used_usd = ?1, reserved_usd = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(fmt_usd(scope.used_usd))
        .bind(fmt_usd(scope.reserved_usd))
        .bind(fmt_ts(Utc::now()))
        .bind(&scope.id)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_db_err("scope balance update", e))?;
        Ok(())
    }

    async fn find_reservation_tx(
        tx: &mut SqliteTx<'_>,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query("SELECT * FROM budget_reservations WHERE request_id = ?1")
            .bind(request_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_db_err("reservation lookup", e))?;

        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn set_reservation_status_tx(
        tx: &mut SqliteTx<'_>,
        reservation_id: &str,
        status: ReservationStatus,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE budget_reservations SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(reservation_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_db_err("reservation status update", e))?;
        Ok(())
    }

    /// Reverse an active hold on both of its scopes. Shared by settle
    /// and release; returns the updated scope rows in lock order.
    async fn reverse_hold_tx(
        tx: &mut SqliteTx<'_>,
        reservation: &Reservation,
        charge_usd: Option<Decimal>,
    ) -> Result<Vec<BudgetScope>, LedgerError> {
        let period = reservation.period();
        let mut scopes = Vec::with_capacity(2);

        for scope_ref in reservation.scope_refs() {
            let mut scope = Self::fetch_scope_tx(tx, &scope_ref, period)
                .await?
                .ok_or_else(|| {
                    LedgerError::Storage(format!(
                        "scope row {scope_ref} missing for active reservation {}",
                        reservation.request_id
                    ))
                })?;

            let mut new_reserved = round_usd(scope.reserved_usd - reservation.reserved_usd);
            if new_reserved < Decimal::ZERO {
                warn!(
                    scope = %scope_ref,
                    reserved = %scope.reserved_usd,
                    hold = %reservation.reserved_usd,
                    "Hold reversal would drive reserved_usd negative; clamping to zero"
                );
                new_reserved = Decimal::ZERO;
            }
            scope.reserved_usd = new_reserved;
            if let Some(actual) = charge_usd {
                scope.used_usd = round_usd(scope.used_usd + actual);
            }

            Self::write_balances_tx(tx, &scope).await?;
            scopes.push(scope);
        }

        Ok(scopes)
    }

    /// Merge a usage event into its daily rollup row.
    ///
    /// Decimal columns are strings, so the increment is a
    /// read-modify-write inside the surrounding transaction rather
    /// than an SQL-side `ON CONFLICT DO UPDATE` expression.
    async fn merge_rollup_tx(
        tx: &mut SqliteTx<'_>,
        event: &UsageEvent,
    ) -> Result<(), LedgerError> {
        let day = fmt_day(event.day());
        let now = fmt_ts(Utc::now());

        let existing = sqlx::query(
            "SELECT * FROM usage_rollups_daily \
             WHERE day = ?1 AND team_id = ?2 AND key_id = ?3",
        )
        .bind(&day)
        .bind(&event.team_id)
        .bind(&event.key_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_db_err("rollup lookup", e))?;

        match existing {
            Some(ref row) => {
                let rollup = Self::row_to_rollup(row)?;
                sqlx::query(
                    "UPDATE usage_rollups_daily \
                     SET used_usd = ?1, input_tokens = ?2, output_tokens = ?3, \
                         request_count = ?4, updated_at = ?5 \
                     WHERE day = ?6 AND team_id = ?7 AND key_id = ?8",
                )
                .bind(fmt_usd(rollup.used_usd + event.cost_usd))
                .bind((rollup.input_tokens + u64::from(event.input_tokens)) as i64)
                .bind((rollup.output_tokens + u64::from(event.output_tokens)) as i64)
                .bind((rollup.request_count + 1) as i64)
                .bind(&now)
                .bind(&day)
                .bind(&event.team_id)
                .bind(&event.key_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_db_err("rollup update", e))?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO usage_rollups_daily
                        (id, day, team_id, key_id, used_usd,
                         input_tokens, output_tokens, request_count, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&day)
                .bind(&event.team_id)
                .bind(&event.key_id)
                .bind(fmt_usd(event.cost_usd))
                .bind(i64::from(event.input_tokens))
                .bind(i64::from(event.output_tokens))
                .bind(&now)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_db_err("rollup insert", e))?;
            }
        }

        Ok(())
    }

    async fn begin(&self) -> Result<SqliteTx<'_>, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_db_err("begin transaction", e))
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn fetch_scope(
        &self,
        scope: &ScopeRef,
        period: NaiveDate,
    ) -> Result<Option<BudgetScope>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM budget_scopes \
             WHERE scope_type = ?1 AND scope_id = ?2 AND period_start = ?3",
        )
        .bind(scope.kind.as_str())
        .bind(&scope.id)
        .bind(fmt_day(period))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_err("scope lookup", e))?;

        row.as_ref().map(Self::row_to_scope).transpose()
    }

    async fn ensure_scope(
        &self,
        spec: &ScopeSpec,
        period: NaiveDate,
    ) -> Result<BudgetScope, LedgerError> {
        let mut tx = self.begin().await?;
        let scope = Self::ensure_scope_tx(&mut tx, spec, period).await?;
        tx.commit()
            .await
            .map_err(|e| map_db_err("ensure scope commit", e))?;
        Ok(scope)
    }

    async fn find_reservation(
        &self,
        request_id: &str,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query("SELECT * FROM budget_reservations WHERE request_id = ?1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_err("reservation lookup", e))?;

        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn place_hold(
        &self,
        reservation: &Reservation,
        chain: &[ScopeSpec],
        period: NaiveDate,
        enforce: bool,
    ) -> Result<HoldOutcome, LedgerError> {
        let mut tx = self.begin().await?;

        let mut scopes = Vec::with_capacity(chain.len());
        let mut breaches = Vec::new();

        for spec in chain {
            let scope = Self::ensure_scope_tx(&mut tx, spec, period).await?;
            if !scope.admits(reservation.reserved_usd) {
                if enforce {
                    // Nothing has been written for this hold yet; the
                    // transaction is dropped and every scope stays as it was.
                    return Ok(HoldOutcome::Rejected {
                        scope: spec.scope_ref(),
                        used: scope.used_usd,
                        remaining: scope.remaining_usd().max(Decimal::ZERO),
                        limit: scope.effective_limit(),
                    });
                }
                breaches.push(spec.scope_ref());
            }
            scopes.push(scope);
        }

        for scope in &mut scopes {
            scope.reserved_usd = round_usd(scope.reserved_usd + reservation.reserved_usd);
            Self::write_balances_tx(&mut tx, scope).await?;
        }

        let insert = sqlx::query(
            r#"
            INSERT INTO budget_reservations
                (id, request_id, scope_team_id, scope_key_id,
                 reserved_usd, status, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&reservation.id)
        .bind(&reservation.request_id)
        .bind(&reservation.team_id)
        .bind(&reservation.key_id)
        .bind(fmt_usd(reservation.reserved_usd))
        .bind(reservation.status.as_str())
        .bind(fmt_ts(reservation.expires_at))
        .bind(fmt_ts(reservation.created_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            // A concurrent call won the race on this request_id. Report
            // a conflict; the caller's idempotency path picks up the
            // stored reservation on retry.
            if is_unique_violation(&e) {
                return Err(LedgerError::Conflict(format!(
                    "reservation already exists for request {}",
                    reservation.request_id
                )));
            }
            return Err(map_db_err("reservation insert", e));
        }

        tx.commit()
            .await
            .map_err(|e| map_db_err("place hold commit", e))?;

        Ok(HoldOutcome::Held { scopes, breaches })
    }

    async fn settle_hold(
        &self,
        request_id: &str,
        event: &UsageEvent,
    ) -> Result<SettleOutcome, LedgerError> {
        let mut tx = self.begin().await?;

        let Some(reservation) = Self::find_reservation_tx(&mut tx, request_id).await? else {
            return Ok(SettleOutcome::NotFound);
        };
        if reservation.status.is_terminal() {
            return Ok(SettleOutcome::AlreadyTerminal {
                status: reservation.status,
            });
        }

        let scopes = Self::reverse_hold_tx(&mut tx, &reservation, Some(event.cost_usd)).await?;

        let insert = sqlx::query(
            r#"
            INSERT INTO usage_events
                (id, request_id, team_id, key_id, cost_usd,
                 input_tokens, output_tokens, pricing_version,
                 token_count_source, latency_ms, status, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&event.id)
        .bind(&event.request_id)
        .bind(&event.team_id)
        .bind(&event.key_id)
        .bind(fmt_usd(event.cost_usd))
        .bind(i64::from(event.input_tokens))
        .bind(i64::from(event.output_tokens))
        .bind(&event.pricing_version)
        .bind(event.token_count_source.as_str())
        .bind(i64::from(event.latency_ms))
        .bind(event.status.as_str())
        .bind(fmt_ts(event.timestamp))
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            // The unique index on request_id makes double settlement
            // structurally impossible: a duplicate means the request
            // was already billed, so the whole transaction unwinds.
            if is_unique_violation(&e) {
                return Ok(SettleOutcome::AlreadyTerminal {
                    status: ReservationStatus::Committed,
                });
            }
            return Err(map_db_err("usage event insert", e));
        }

        Self::merge_rollup_tx(&mut tx, event).await?;
        Self::set_reservation_status_tx(&mut tx, &reservation.id, ReservationStatus::Committed)
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("settle commit", e))?;

        Ok(SettleOutcome::Settled { scopes })
    }

    async fn release_hold(&self, request_id: &str) -> Result<ReleaseOutcome, LedgerError> {
        let mut tx = self.begin().await?;

        let Some(reservation) = Self::find_reservation_tx(&mut tx, request_id).await? else {
            return Ok(ReleaseOutcome::NotFound);
        };
        if reservation.status.is_terminal() {
            return Ok(ReleaseOutcome::AlreadyTerminal {
                status: reservation.status,
            });
        }

        Self::reverse_hold_tx(&mut tx, &reservation, None).await?;
        Self::set_reservation_status_tx(&mut tx, &reservation.id, ReservationStatus::Released)
            .await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("release commit", e))?;

        Ok(ReleaseOutcome::Released {
            amount: reservation.reserved_usd,
        })
    }

    async fn expired_holds(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM budget_reservations \
             WHERE status = 'active' AND expires_at < ?1 \
             ORDER BY expires_at ASC LIMIT ?2",
        )
        .bind(fmt_ts(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_err("expired holds scan", e))?;

        rows.iter().map(Self::row_to_reservation).collect()
    }

    async fn stamp_alert(
        &self,
        scope: &ScopeRef,
        period: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE budget_scopes SET last_alert_at = ?1, updated_at = ?1 \
             WHERE scope_type = ?2 AND scope_id = ?3 AND period_start = ?4",
        )
        .bind(fmt_ts(at))
        .bind(scope.kind.as_str())
        .bind(&scope.id)
        .bind(fmt_day(period))
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err("alert stamp", e))?;
        Ok(())
    }

    async fn scopes_with_holds(&self) -> Result<Vec<BudgetScope>, LedgerError> {
        // All writes go through fmt_usd, so a zero balance is always
        // the literal string '0'.
        let rows = sqlx::query("SELECT * FROM budget_scopes WHERE reserved_usd != '0'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_err("scopes with holds scan", e))?;

        rows.iter().map(Self::row_to_scope).collect()
    }

    async fn active_hold_total(&self, scope: &ScopeRef) -> Result<Decimal, LedgerError> {
        let column = match scope.kind {
            ScopeKind::Team => "scope_team_id",
            ScopeKind::Key => "scope_key_id",
        };
        let sql = format!(
            "SELECT reserved_usd FROM budget_reservations \
             WHERE status = 'active' AND {column} = ?1"
        );

        let rows = sqlx::query(&sql)
            .bind(&scope.id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_db_err("active hold scan", e))?;

        let mut total = Decimal::ZERO;
        for row in &rows {
            total += get_amount(row, "reserved_usd")?;
        }
        Ok(round_usd(total))
    }

    async fn override_reserved(
        &self,
        scope: &ScopeRef,
        period: NaiveDate,
        reserved_usd: Decimal,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE budget_scopes SET reserved_usd = ?1, updated_at = ?2 \
             WHERE scope_type = ?3 AND scope_id = ?4 AND period_start = ?5",
        )
        .bind(fmt_usd(reserved_usd))
        .bind(fmt_ts(Utc::now()))
        .bind(scope.kind.as_str())
        .bind(&scope.id)
        .bind(fmt_day(period))
        .execute(&self.pool)
        .await
        .map_err(|e| map_db_err("reserved override", e))?;
        Ok(())
    }

    async fn usage_event(&self, request_id: &str) -> Result<Option<UsageEvent>, LedgerError> {
        let row = sqlx::query("SELECT * FROM usage_events WHERE request_id = ?1")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_err("usage event lookup", e))?;

        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn rollup(
        &self,
        day: NaiveDate,
        team_id: &str,
        key_id: &str,
    ) -> Result<Option<UsageRollup>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM usage_rollups_daily \
             WHERE day = ?1 AND team_id = ?2 AND key_id = ?3",
        )
        .bind(fmt_day(day))
        .bind(team_id)
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_err("rollup lookup", e))?;

        row.as_ref().map(Self::row_to_rollup).transpose()
    }
}

// ── Column helpers ────────────────────────────────────────────────────

fn get_text(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<String, LedgerError> {
    row.try_get(column)
        .map_err(|e| LedgerError::QueryFailed(format!("{column} column: {e}")))
}

fn get_count(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<i64, LedgerError> {
    row.try_get(column)
        .map_err(|e| LedgerError::QueryFailed(format!("{column} column: {e}")))
}

fn get_amount(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Decimal, LedgerError> {
    let raw = get_text(row, column)?;
    parse_usd(&raw).map_err(|_| LedgerError::CorruptAmount {
        column: column.to_string(),
        value: raw,
    })
}

/// Fixed-width RFC 3339 (microseconds, `Z` suffix) so stored timestamps
/// compare correctly as strings.
fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::QueryFailed(format!("{column} timestamp: {e}")))
}

fn fmt_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn parse_day(raw: &str, column: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| LedgerError::QueryFailed(format!("{column} date: {e}")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Busy/locked failures become retryable conflicts; everything else is
/// a storage error.
fn map_db_err(context: &str, e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db) = e {
        let msg = db.message();
        if msg.contains("database is locked") || msg.contains("database table is locked") {
            return LedgerError::Conflict(format!("{context}: {msg}"));
        }
    }
    LedgerError::Storage(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration as ChronoDuration};
    use rust_decimal_macros::dec;
    use spendgate_core::period_for;

    async fn test_store() -> SqliteLedger {
        SqliteLedger::new("sqlite::memory:").await.unwrap()
    }

    fn key_spec(id: &str, limit: Decimal) -> ScopeSpec {
        ScopeSpec {
            kind: ScopeKind::Key,
            id: id.into(),
            limit_usd: limit,
            overdraft_usd: Decimal::ZERO,
        }
    }

    fn team_spec(id: &str, limit: Decimal) -> ScopeSpec {
        ScopeSpec {
            kind: ScopeKind::Team,
            id: id.into(),
            limit_usd: limit,
            overdraft_usd: Decimal::ZERO,
        }
    }

    fn chain(key_limit: Decimal, team_limit: Decimal) -> Vec<ScopeSpec> {
        vec![key_spec("vk-1", key_limit), team_spec("acme", team_limit)]
    }

    fn hold(request_id: &str, amount: Decimal) -> Reservation {
        Reservation::new(
            request_id,
            "acme",
            "vk-1",
            amount,
            Utc::now() + ChronoDuration::minutes(15),
        )
    }

    fn period() -> NaiveDate {
        period_for(Utc::now())
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = test_store().await;
        // Re-running against an already-migrated database is harmless
        // and existing data survives.
        let scope = store
            .ensure_scope(&team_spec("acme", dec!(25)), period())
            .await
            .unwrap();
        store.run_migrations().await.unwrap();
        let again = store
            .fetch_scope(&ScopeRef::new(ScopeKind::Team, "acme"), period())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, scope.id);
    }

    #[tokio::test]
    async fn scopes_are_created_lazily() {
        let store = test_store().await;
        let spec = team_spec("acme", dec!(25));

        assert!(
            store
                .fetch_scope(&spec.scope_ref(), period())
                .await
                .unwrap()
                .is_none()
        );

        let scope = store.ensure_scope(&spec, period()).await.unwrap();
        assert_eq!(scope.limit_usd, dec!(25));
        assert_eq!(scope.used_usd, Decimal::ZERO);
        assert_eq!(scope.reserved_usd, Decimal::ZERO);

        // Second ensure returns the same row, not a new one
        let again = store.ensure_scope(&spec, period()).await.unwrap();
        assert_eq!(again.id, scope.id);
    }

    #[tokio::test]
    async fn place_hold_debits_every_scope() {
        let store = test_store().await;
        let outcome = store
            .place_hold(&hold("req-1", dec!(0.03)), &chain(dec!(5), dec!(25)), period(), true)
            .await
            .unwrap();

        let HoldOutcome::Held { scopes, breaches } = outcome else {
            panic!("expected hold to be placed");
        };
        assert!(breaches.is_empty());
        assert_eq!(scopes.len(), 2);
        for scope in &scopes {
            assert_eq!(scope.reserved_usd, dec!(0.03));
        }
    }

    #[tokio::test]
    async fn rejected_hold_modifies_nothing() {
        let store = test_store().await;
        // Key scope has room, team scope does not — and the key scope
        // is checked first.
        let outcome = store
            .place_hold(
                &hold("req-1", dec!(0.03)),
                &chain(dec!(100), dec!(0.01)),
                period(),
                true,
            )
            .await
            .unwrap();

        let HoldOutcome::Rejected { scope, remaining, .. } = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(scope.kind, ScopeKind::Team);
        assert_eq!(remaining, dec!(0.01));

        // The key scope that passed its check first must be untouched.
        let key_scope = store
            .fetch_scope(&ScopeRef::new(ScopeKind::Key, "vk-1"), period())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key_scope.reserved_usd, Decimal::ZERO);
        assert!(store.find_reservation("req-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unenforced_hold_reports_breaches_but_applies() {
        let store = test_store().await;
        let outcome = store
            .place_hold(
                &hold("req-1", dec!(0.03)),
                &chain(dec!(100), dec!(0.01)),
                period(),
                false,
            )
            .await
            .unwrap();

        let HoldOutcome::Held { scopes, breaches } = outcome else {
            panic!("expected hold to be placed");
        };
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].kind, ScopeKind::Team);
        // The ledger stays numerically accurate even past the limit.
        assert!(scopes.iter().all(|s| s.reserved_usd == dec!(0.03)));
    }

    #[tokio::test]
    async fn duplicate_request_id_is_a_conflict() {
        let store = test_store().await;
        let specs = chain(dec!(5), dec!(25));
        store
            .place_hold(&hold("req-1", dec!(0.01)), &specs, period(), true)
            .await
            .unwrap();

        let err = store
            .place_hold(&hold("req-1", dec!(0.01)), &specs, period(), true)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn settle_uses_estimate_for_reserved_and_actual_for_used() {
        let store = test_store().await;
        store
            .place_hold(&hold("req-1", dec!(0.03)), &chain(dec!(5), dec!(25)), period(), true)
            .await
            .unwrap();

        let event = UsageEvent::new("req-1", "acme", "vk-1", dec!(0.02));
        let outcome = store.settle_hold("req-1", &event).await.unwrap();

        let SettleOutcome::Settled { scopes } = outcome else {
            panic!("expected settlement");
        };
        for scope in &scopes {
            assert_eq!(scope.reserved_usd, Decimal::ZERO, "estimate reversed");
            assert_eq!(scope.used_usd, dec!(0.02), "actual charged");
        }

        let reservation = store.find_reservation("req-1").await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Committed);
        assert!(store.usage_event("req-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn settle_twice_is_terminal_with_one_event() {
        let store = test_store().await;
        store
            .place_hold(&hold("req-1", dec!(0.03)), &chain(dec!(5), dec!(25)), period(), true)
            .await
            .unwrap();

        let event = UsageEvent::new("req-1", "acme", "vk-1", dec!(0.02));
        store.settle_hold("req-1", &event).await.unwrap();

        let again = UsageEvent::new("req-1", "acme", "vk-1", dec!(0.02));
        let outcome = store.settle_hold("req-1", &again).await.unwrap();
        assert!(matches!(
            outcome,
            SettleOutcome::AlreadyTerminal {
                status: ReservationStatus::Committed
            }
        ));

        // Balances changed exactly once
        let team = store
            .fetch_scope(&ScopeRef::new(ScopeKind::Team, "acme"), period())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(team.used_usd, dec!(0.02));
    }

    #[tokio::test]
    async fn settle_unknown_request_is_not_found() {
        let store = test_store().await;
        let event = UsageEvent::new("ghost", "acme", "vk-1", dec!(0.02));
        assert!(matches!(
            store.settle_hold("ghost", &event).await.unwrap(),
            SettleOutcome::NotFound
        ));
    }

    #[tokio::test]
    async fn release_returns_exactly_the_held_amount() {
        let store = test_store().await;
        store
            .place_hold(&hold("req-1", dec!(0.03)), &chain(dec!(5), dec!(25)), period(), true)
            .await
            .unwrap();

        let outcome = store.release_hold("req-1").await.unwrap();
        let ReleaseOutcome::Released { amount } = outcome else {
            panic!("expected release");
        };
        assert_eq!(amount, dec!(0.03));

        let team = store
            .fetch_scope(&ScopeRef::new(ScopeKind::Team, "acme"), period())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(team.reserved_usd, Decimal::ZERO);
        assert_eq!(team.used_usd, Decimal::ZERO);

        // Releasing again is a terminal no-op
        assert!(matches!(
            store.release_hold("req-1").await.unwrap(),
            ReleaseOutcome::AlreadyTerminal {
                status: ReservationStatus::Released
            }
        ));
    }

    #[tokio::test]
    async fn expired_holds_scan_skips_live_and_terminal_rows() {
        let store = test_store().await;
        let specs = chain(dec!(5), dec!(25));

        let mut expired = hold("req-old", dec!(0.01));
        expired.expires_at = Utc::now() - ChronoDuration::minutes(5);
        store.place_hold(&expired, &specs, period(), true).await.unwrap();

        store
            .place_hold(&hold("req-live", dec!(0.01)), &specs, period(), true)
            .await
            .unwrap();

        let mut released = hold("req-done", dec!(0.01));
        released.expires_at = Utc::now() - ChronoDuration::minutes(5);
        store.place_hold(&released, &specs, period(), true).await.unwrap();
        store.release_hold("req-done").await.unwrap();

        let found = store.expired_holds(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].request_id, "req-old");
    }

    #[tokio::test]
    async fn rollup_merges_across_events() {
        let store = test_store().await;
        let specs = chain(dec!(5), dec!(25));

        for (req, cost, tokens) in [("req-1", dec!(0.02), 100), ("req-2", dec!(0.03), 50)] {
            store
                .place_hold(&hold(req, cost), &specs, period(), true)
                .await
                .unwrap();
            let mut event = UsageEvent::new(req, "acme", "vk-1", cost);
            event.input_tokens = tokens;
            event.output_tokens = tokens / 2;
            store.settle_hold(req, &event).await.unwrap();
        }

        let rollup = store
            .rollup(Utc::now().date_naive(), "acme", "vk-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rollup.used_usd, dec!(0.05));
        assert_eq!(rollup.input_tokens, 150);
        assert_eq!(rollup.output_tokens, 75);
        assert_eq!(rollup.request_count, 2);
    }

    #[tokio::test]
    async fn active_hold_total_matches_ledger() {
        let store = test_store().await;
        let specs = chain(dec!(5), dec!(25));

        store
            .place_hold(&hold("req-1", dec!(0.01)), &specs, period(), true)
            .await
            .unwrap();
        store
            .place_hold(&hold("req-2", dec!(0.02)), &specs, period(), true)
            .await
            .unwrap();
        store.release_hold("req-2").await.unwrap();

        let team_ref = ScopeRef::new(ScopeKind::Team, "acme");
        assert_eq!(store.active_hold_total(&team_ref).await.unwrap(), dec!(0.01));

        let scopes = store.scopes_with_holds().await.unwrap();
        assert_eq!(scopes.len(), 2, "key and team scope both hold funds");
    }

    #[tokio::test]
    async fn override_reserved_heals_a_scope_row() {
        let store = test_store().await;
        let spec = team_spec("acme", dec!(25));
        store.ensure_scope(&spec, period()).await.unwrap();

        let scope_ref = spec.scope_ref();
        store
            .override_reserved(&scope_ref, period(), dec!(0.07))
            .await
            .unwrap();

        let scope = store.fetch_scope(&scope_ref, period()).await.unwrap().unwrap();
        assert_eq!(scope.reserved_usd, dec!(0.07));
    }

    #[tokio::test]
    async fn stamp_alert_sets_timestamp() {
        let store = test_store().await;
        let spec = key_spec("vk-1", dec!(5));
        store.ensure_scope(&spec, period()).await.unwrap();

        let at = Utc::now();
        store.stamp_alert(&spec.scope_ref(), period(), at).await.unwrap();

        let scope = store
            .fetch_scope(&spec.scope_ref(), period())
            .await
            .unwrap()
            .unwrap();
        let stamped = scope.last_alert_at.unwrap();
        assert!((stamped - at).num_milliseconds().abs() < 10);
    }

    #[tokio::test]
    async fn corrupt_amount_surfaces_not_defaults() {
        let store = test_store().await;
        let spec = team_spec("acme", dec!(25));
        store.ensure_scope(&spec, period()).await.unwrap();

        sqlx::query("UPDATE budget_scopes SET used_usd = 'NaN-ish' WHERE scope_id = 'acme'")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .fetch_scope(&spec.scope_ref(), period())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CorruptAmount { .. }));
    }

    #[tokio::test]
    async fn periods_partition_scopes() {
        let store = test_store().await;
        let spec = team_spec("acme", dec!(25));
        let this_month = period();
        let next_month = if this_month.month() == 12 {
            NaiveDate::from_ymd_opt(this_month.year() + 1, 1, 1).unwrap()
        } else {
            NaiveDate::from_ymd_opt(this_month.year(), this_month.month() + 1, 1).unwrap()
        };

        store.ensure_scope(&spec, this_month).await.unwrap();
        assert!(
            store
                .fetch_scope(&spec.scope_ref(), next_month)
                .await
                .unwrap()
                .is_none()
        );
    }
}
