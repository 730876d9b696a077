// DBQ
// Copyright 2024 The DBQ Authors
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! SQL dialect strategies for the relational backend.
//!
//! Every supported engine gets one self-contained strategy that spells out
//! all of its statements: dialects do not share SQL fragments with each
//! other, so the differences in auto-increment and locking syntax stay
//! isolated here.  Which strategy applies to a live connection is decided by
//! a capability probe: each candidate is asked whether it recognizes the
//! engine on the other end, and the first match wins.

use crate::model::{QueueError, QueueResult};
use async_trait::async_trait;
use dbq_core::db::{DbResult, Executor};
use log::debug;
use std::sync::Arc;

/// A self-contained SQL strategy for one database engine.
///
/// Placeholder syntax follows the engine (`$1` for PostgreSQL, `?` for
/// SQLite), as do the column types; the backend matches on the executor
/// variant when binding, so the two always agree.
#[async_trait]
pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    /// Name of the dialect, for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns true if the database behind `ex` speaks this dialect.
    ///
    /// Implementations query an engine-identifying function or variable and
    /// treat a failure to answer as "not mine".
    async fn probe(&self, ex: &mut Executor) -> bool;

    /// Statement that creates the queue table if it does not exist, bounding
    /// the serialized item length to `max_payload_bytes`.
    fn create_table_sql(&self, table: &str, max_payload_bytes: usize) -> String;

    /// Statement that appends one unclaimed item.  Binds: payload.
    fn insert_sql(&self, table: &str) -> String;

    /// Statement that selects the id and payload of the lowest-id unclaimed
    /// row, locking it where the engine requires an explicit lock.  No binds.
    fn claim_select_sql(&self, table: &str) -> String;

    /// Statement that stamps the claim time on a row.  Binds: timestamp
    /// (engine-specific representation), then id.
    fn claim_mark_sql(&self, table: &str) -> String;

    /// Statement that deletes a row by id.  Binds: id.
    fn remove_sql(&self, table: &str) -> String;

    /// Statement that counts all rows, aliased as `count`.  No binds.
    fn count_sql(&self, table: &str) -> String;
}

/// Runs `sql` on whatever engine `ex` is connected to and returns the first
/// column of the first row as text.  Used by dialect probes, for which any
/// error simply means "this is not my engine".
async fn fetch_scalar_text(ex: &mut Executor, sql: &str) -> DbResult<String> {
    use sqlx::Row;

    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            use dbq_core::db::postgres::map_sqlx_error;
            let row = sqlx::query(sql).fetch_one(ex.conn()).await.map_err(map_sqlx_error)?;
            row.try_get::<String, _>(0).map_err(map_sqlx_error)
        }

        #[cfg(feature = "sqlite")]
        Executor::Sqlite(ex) => {
            use dbq_core::db::sqlite::map_sqlx_error;
            let row = sqlx::query(sql).fetch_one(ex.conn()).await.map_err(map_sqlx_error)?;
            row.try_get::<String, _>(0).map_err(map_sqlx_error)
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!("No SQL database feature enabled"),
    }
}

/// The PostgreSQL strategy.
#[cfg(feature = "postgres")]
#[derive(Default, Debug)]
pub struct PostgresDialect {}

#[cfg(feature = "postgres")]
#[async_trait]
impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn probe(&self, ex: &mut Executor) -> bool {
        match fetch_scalar_text(ex, "SELECT version()").await {
            Ok(version) => version.starts_with("PostgreSQL"),
            Err(_) => false,
        }
    }

    fn create_table_sql(&self, table: &str, max_payload_bytes: usize) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                item VARCHAR({}) NOT NULL,
                started_at TIMESTAMPTZ
            )",
            table, max_payload_bytes
        )
    }

    fn insert_sql(&self, table: &str) -> String {
        format!("INSERT INTO {} (item, started_at) VALUES ($1, NULL)", table)
    }

    fn claim_select_sql(&self, table: &str) -> String {
        format!(
            "SELECT id, item FROM {} WHERE started_at IS NULL ORDER BY id LIMIT 1 FOR UPDATE",
            table
        )
    }

    fn claim_mark_sql(&self, table: &str) -> String {
        format!("UPDATE {} SET started_at = $1 WHERE id = $2", table)
    }

    fn remove_sql(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE id = $1", table)
    }

    fn count_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) AS count FROM {}", table)
    }
}

/// The SQLite strategy.
///
/// SQLite has no `SELECT ... FOR UPDATE`; the claim relies on the engine's
/// single-writer transaction lock instead.  Timestamps are stored as a
/// seconds/nanoseconds integer pair, and the payload bound is a `CHECK`
/// constraint because SQLite ignores `VARCHAR` lengths.
#[cfg(feature = "sqlite")]
#[derive(Default, Debug)]
pub struct SqliteDialect {}

#[cfg(feature = "sqlite")]
#[async_trait]
impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn probe(&self, ex: &mut Executor) -> bool {
        fetch_scalar_text(ex, "SELECT sqlite_version()").await.is_ok()
    }

    fn create_table_sql(&self, table: &str, max_payload_bytes: usize) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item TEXT NOT NULL CHECK (LENGTH(item) <= {}),
                started_at_sec INTEGER,
                started_at_nsec INTEGER
            )",
            table, max_payload_bytes
        )
    }

    fn insert_sql(&self, table: &str) -> String {
        format!("INSERT INTO {} (item, started_at_sec, started_at_nsec) VALUES (?, NULL, NULL)", table)
    }

    fn claim_select_sql(&self, table: &str) -> String {
        format!(
            "SELECT id, item FROM {} WHERE started_at_sec IS NULL ORDER BY id LIMIT 1",
            table
        )
    }

    fn claim_mark_sql(&self, table: &str) -> String {
        format!("UPDATE {} SET started_at_sec = ?, started_at_nsec = ? WHERE id = ?", table)
    }

    fn remove_sql(&self, table: &str) -> String {
        format!("DELETE FROM {} WHERE id = ?", table)
    }

    fn count_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) AS count FROM {}", table)
    }
}

/// Returns the built-in dialects, in probe order.
pub fn default_dialects() -> Vec<Arc<dyn SqlDialect>> {
    #[allow(unused_mut)]
    let mut dialects: Vec<Arc<dyn SqlDialect>> = vec![];
    #[cfg(feature = "postgres")]
    dialects.push(Arc::new(PostgresDialect::default()));
    #[cfg(feature = "sqlite")]
    dialects.push(Arc::new(SqliteDialect::default()));
    dialects
}

/// Finds the first dialect among `dialects` that recognizes the database
/// behind `ex`.
///
/// The candidate list is an explicit parameter, not process-wide state, so
/// callers (and tests) can supply their own strategies.  Finding no match is
/// a fatal configuration error.
pub async fn resolve_dialect(
    dialects: &[Arc<dyn SqlDialect>],
    ex: &mut Executor,
) -> QueueResult<Arc<dyn SqlDialect>> {
    for dialect in dialects {
        if dialect.probe(ex).await {
            debug!("Database recognized by the {} dialect", dialect.name());
            return Ok(dialect.clone());
        }
    }
    Err(QueueError::Config("No registered dialect recognizes this database".to_owned()))
}
