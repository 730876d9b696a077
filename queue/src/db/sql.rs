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

//! Relational storage backend.

use crate::db::{validate_queue_name, RawItem, SqlDialect, StorageBackend};
use crate::db::dialect::resolve_dialect;
use crate::model::{QueueOptions, QueueResult};
use async_trait::async_trait;
use dbq_core::clocks::Clock;
use dbq_core::db::{Db, DbError, DbResult, Executor};
use log::debug;
use sqlx::Row;
use std::sync::Arc;

/// Validates that a statement that should have touched one row did so.
fn ensure_one_row(affected: u64, op: &str) -> DbResult<()> {
    if affected != 1 {
        return Err(DbError::BackendError(format!("{} affected {} rows, not 1", op, affected)));
    }
    Ok(())
}

/// Storage backend for the relational family.
///
/// The backend resolves which `SqlDialect` strategy to use by probing the
/// live connection at construction time and then uses that dialect's
/// statements for the rest of its life.  All read-modify-write sequences go
/// through the store's own transactions; this type holds no in-process locks.
pub struct SqlBackend {
    /// Connection to the database that holds the queue.
    db: Arc<dyn Db + Send + Sync>,

    /// Clock used to stamp claims.
    clock: Arc<dyn Clock + Send + Sync>,

    /// The dialect strategy resolved for `db`.
    dialect: Arc<dyn SqlDialect>,

    /// Queue name; doubles as the table name.
    name: String,

    /// Bound on the serialized item length, baked into the schema.
    max_payload_bytes: usize,
}

impl SqlBackend {
    /// Creates a backend for the queue described by `opts` on top of `db`.
    ///
    /// The dialect is resolved by probing the connection against the
    /// `dialects` candidates; an unrecognized database is a fatal
    /// configuration error.  The backing table is created if missing.
    pub async fn connect(
        db: Arc<dyn Db + Send + Sync>,
        clock: Arc<dyn Clock + Send + Sync>,
        dialects: &[Arc<dyn SqlDialect>],
        opts: &QueueOptions,
    ) -> QueueResult<Self> {
        validate_queue_name(&opts.name)?;

        let dialect = {
            let mut ex = db.ex().await?;
            resolve_dialect(dialects, &mut ex).await?
        };

        let backend = Self {
            db,
            clock,
            dialect,
            name: opts.name.clone(),
            max_payload_bytes: opts.max_payload_bytes,
        };
        backend.ensure_schema().await?;
        Ok(backend)
    }
}

#[async_trait]
impl StorageBackend for SqlBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn ensure_schema(&self) -> DbResult<()> {
        let sql = self.dialect.create_table_sql(&self.name, self.max_payload_bytes);

        let mut tx = self.db.begin().await?;
        match tx.ex() {
            #[cfg(feature = "postgres")]
            Executor::Postgres(ex) => {
                use dbq_core::db::postgres::map_sqlx_error;
                sqlx::query(&sql).execute(ex.conn()).await.map_err(map_sqlx_error)?;
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(ex) => {
                use dbq_core::db::sqlite::map_sqlx_error;
                sqlx::query(&sql).execute(ex.conn()).await.map_err(map_sqlx_error)?;
            }

            #[allow(unreachable_patterns)]
            _ => unreachable!("No SQL database feature enabled"),
        }
        tx.commit().await
    }

    async fn next_sequence(&self) -> DbResult<Option<i64>> {
        // The auto-increment primary key assigns claim order at insert time.
        Ok(None)
    }

    async fn insert(&self, sequence: Option<i64>, payload: &str) -> DbResult<()> {
        debug_assert!(sequence.is_none(), "Relational backends assign their own sequence");
        let sql = self.dialect.insert_sql(&self.name);

        let affected = match self.db.ex().await? {
            #[cfg(feature = "postgres")]
            Executor::Postgres(mut ex) => {
                use dbq_core::db::postgres::map_sqlx_error;
                sqlx::query(&sql)
                    .bind(payload)
                    .execute(ex.conn())
                    .await
                    .map_err(map_sqlx_error)?
                    .rows_affected()
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(mut ex) => {
                use dbq_core::db::sqlite::map_sqlx_error;
                sqlx::query(&sql)
                    .bind(payload)
                    .execute(ex.conn())
                    .await
                    .map_err(map_sqlx_error)?
                    .rows_affected()
            }

            #[allow(unreachable_patterns)]
            _ => unreachable!("No SQL database feature enabled"),
        };
        ensure_one_row(affected, "Insert")
    }

    async fn claim_next(&self) -> DbResult<Option<RawItem>> {
        let now = self.clock.now_utc();
        let select_sql = self.dialect.claim_select_sql(&self.name);
        let mark_sql = self.dialect.claim_mark_sql(&self.name);

        let mut tx = self.db.begin().await?;
        let claimed = match tx.ex() {
            #[cfg(feature = "postgres")]
            Executor::Postgres(ex) => {
                use dbq_core::db::postgres::map_sqlx_error;

                let row = sqlx::query(&select_sql)
                    .fetch_optional(ex.conn())
                    .await
                    .map_err(map_sqlx_error)?;
                match row {
                    None => None,
                    Some(row) => {
                        let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
                        let payload: String = row.try_get("item").map_err(map_sqlx_error)?;

                        let affected = sqlx::query(&mark_sql)
                            .bind(now)
                            .bind(id)
                            .execute(ex.conn())
                            .await
                            .map_err(map_sqlx_error)?
                            .rows_affected();
                        ensure_one_row(affected, "Claim")?;

                        Some((id, payload))
                    }
                }
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(ex) => {
                use dbq_core::db::sqlite::{map_sqlx_error, unpack_timestamp};

                let row = sqlx::query(&select_sql)
                    .fetch_optional(ex.conn())
                    .await
                    .map_err(map_sqlx_error)?;
                match row {
                    None => None,
                    Some(row) => {
                        let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
                        let payload: String = row.try_get("item").map_err(map_sqlx_error)?;

                        let (now_sec, now_nsec) = unpack_timestamp(now);
                        let affected = sqlx::query(&mark_sql)
                            .bind(now_sec)
                            .bind(now_nsec)
                            .bind(id)
                            .execute(ex.conn())
                            .await
                            .map_err(map_sqlx_error)?
                            .rows_affected();
                        ensure_one_row(affected, "Claim")?;

                        Some((id, payload))
                    }
                }
            }

            #[allow(unreachable_patterns)]
            _ => unreachable!("No SQL database feature enabled"),
        };
        tx.commit().await?;

        Ok(claimed.map(|(id, payload)| RawItem { id, payload, started_at: Some(now) }))
    }

    async fn remove(&self, id: i64) -> DbResult<()> {
        let sql = self.dialect.remove_sql(&self.name);

        let affected = match self.db.ex().await? {
            #[cfg(feature = "postgres")]
            Executor::Postgres(mut ex) => {
                use dbq_core::db::postgres::map_sqlx_error;
                sqlx::query(&sql)
                    .bind(id)
                    .execute(ex.conn())
                    .await
                    .map_err(map_sqlx_error)?
                    .rows_affected()
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(mut ex) => {
                use dbq_core::db::sqlite::map_sqlx_error;
                sqlx::query(&sql)
                    .bind(id)
                    .execute(ex.conn())
                    .await
                    .map_err(map_sqlx_error)?
                    .rows_affected()
            }

            #[allow(unreachable_patterns)]
            _ => unreachable!("No SQL database feature enabled"),
        };
        if affected == 0 {
            // Removing an id that is already gone is explicitly not an error.
            debug!("Queue {}: remove of missing item {}", self.name, id);
        }
        Ok(())
    }

    async fn count(&self) -> DbResult<u64> {
        let sql = self.dialect.count_sql(&self.name);

        let count: i64 = match self.db.ex().await? {
            #[cfg(feature = "postgres")]
            Executor::Postgres(mut ex) => {
                use dbq_core::db::postgres::map_sqlx_error;
                let row = sqlx::query(&sql).fetch_one(ex.conn()).await.map_err(map_sqlx_error)?;
                row.try_get("count").map_err(map_sqlx_error)?
            }

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(mut ex) => {
                use dbq_core::db::sqlite::map_sqlx_error;
                let row = sqlx::query(&sql).fetch_one(ex.conn()).await.map_err(map_sqlx_error)?;
                row.try_get("count").map_err(map_sqlx_error)?
            }

            #[allow(unreachable_patterns)]
            _ => unreachable!("No SQL database feature enabled"),
        };
        u64::try_from(count)
            .map_err(|e| DbError::DataIntegrityError(format!("Invalid count {}: {}", count, e)))
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::model::QueueOptions;
    use dbq_core::clocks::testutils::SettableClock;
    use dbq_core::db::sqlite;
    use dbq_core::db::testutils::generate_tests;
    use time::macros::datetime;

    /// Creates a SQLite-backed backend for a queue named `tasks`.
    async fn setup() -> Arc<dyn StorageBackend> {
        let db: Arc<dyn Db + Send + Sync> = Arc::from(sqlite::testutils::setup().await);
        let clock = Arc::from(SettableClock::new(datetime!(2024-03-10 05:50:00 UTC)));
        let backend =
            SqlBackend::connect(db, clock, &crate::db::default_dialects(), &QueueOptions::new("tasks"))
                .await
                .unwrap();
        Arc::from(backend)
    }

    generate_tests!(
        setup().await,
        crate::db::tests,
        test_count_starts_at_zero,
        test_insert_then_count,
        test_claim_next_empty_returns_none,
        test_claim_next_returns_fifo_order,
        test_claim_next_skips_claimed_items,
        test_claim_next_stamps_started_at,
        test_count_includes_claimed_items,
        test_remove_claimed_item,
        test_remove_missing_id_is_noop,
        test_ensure_schema_is_idempotent,
        test_concurrent_claims_yield_unique_items
    );

    #[tokio::test]
    async fn test_two_backends_same_queue_share_state() {
        let db: Arc<dyn Db + Send + Sync> = Arc::from(sqlite::testutils::setup().await);
        let clock: Arc<SettableClock> =
            Arc::from(SettableClock::new(datetime!(2024-03-10 05:50:00 UTC)));
        let opts = QueueOptions::new("tasks");

        let first = SqlBackend::connect(
            db.clone(),
            clock.clone(),
            &crate::db::default_dialects(),
            &opts,
        )
        .await
        .unwrap();
        first.insert(None, "\"one\"").await.unwrap();

        // Constructing a second backend against the same queue must not error
        // out nor wipe the table, and both must observe the same contents.
        let second = SqlBackend::connect(
            db.clone(),
            clock.clone(),
            &crate::db::default_dialects(),
            &opts,
        )
        .await
        .unwrap();
        assert_eq!(1, first.count().await.unwrap());
        assert_eq!(1, second.count().await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_queue_name() {
        let db: Arc<dyn Db + Send + Sync> = Arc::from(sqlite::testutils::setup().await);
        let clock = Arc::from(SettableClock::new(datetime!(2024-03-10 05:50:00 UTC)));
        let opts = QueueOptions::new("bad name; --");
        match SqlBackend::connect(db, clock, &crate::db::default_dialects(), &opts).await {
            Err(crate::model::QueueError::Config(_)) => (),
            other => panic!("Unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_claim_uses_clock_time() {
        let db: Arc<dyn Db + Send + Sync> = Arc::from(sqlite::testutils::setup().await);
        let now = datetime!(2024-03-10 05:50:00 UTC);
        let clock: Arc<SettableClock> = Arc::from(SettableClock::new(now));
        let backend = SqlBackend::connect(
            db,
            clock.clone(),
            &crate::db::default_dialects(),
            &QueueOptions::new("tasks"),
        )
        .await
        .unwrap();

        backend.insert(None, "\"one\"").await.unwrap();
        let raw = backend.claim_next().await.unwrap().unwrap();
        assert_eq!(Some(now), raw.started_at);
    }

    #[tokio::test]
    async fn test_insert_rejects_oversized_payload() {
        let db: Arc<dyn Db + Send + Sync> = Arc::from(sqlite::testutils::setup().await);
        let clock = Arc::from(SettableClock::new(datetime!(2024-03-10 05:50:00 UTC)));
        let opts = QueueOptions::new("tasks").with_max_payload_bytes(8);
        let backend =
            SqlBackend::connect(db, clock, &crate::db::default_dialects(), &opts).await.unwrap();

        backend.insert(None, "\"short\"").await.unwrap();
        match backend.insert(None, "\"longer than eight\"").await {
            Err(DbError::BackendError(_)) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_eq!(1, backend.count().await.unwrap());
    }
}
