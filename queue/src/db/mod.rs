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

//! Storage backends for queue items.
//!
//! A backend binds one queue name to one concrete store and carries the
//! dialect-specific details of persisting, claiming, and deleting items.
//! Two families are provided: the relational family (`SqlBackend`, with one
//! `SqlDialect` strategy per supported engine) and the document family
//! (`MongoBackend`).  Everything above this module talks to the
//! `StorageBackend` contract and stays engine-agnostic.

#[cfg(any(feature = "postgres", feature = "sqlite", feature = "mongodb"))]
use crate::model::{QueueError, QueueResult};
use async_trait::async_trait;
use dbq_core::db::DbResult;
use time::OffsetDateTime;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
mod dialect;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub use dialect::{default_dialects, resolve_dialect, SqlDialect};
#[cfg(feature = "postgres")]
pub use dialect::PostgresDialect;
#[cfg(feature = "sqlite")]
pub use dialect::SqliteDialect;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
mod sql;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub use sql::SqlBackend;

#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "mongodb")]
pub use mongo::{MongoBackend, MongoOptions};

#[cfg(all(test, any(feature = "postgres", feature = "sqlite", feature = "mongodb")))]
mod tests;

/// A stored queue item in its serialized form, as returned by a claim.
#[derive(Debug, PartialEq)]
pub struct RawItem {
    /// Claim-order identifier of the item: the auto-increment primary key for
    /// relational backends, the assigned sequence number for the document
    /// backend.
    pub id: i64,

    /// Serialized payload of the item.
    pub payload: String,

    /// Time at which the item was claimed.  Always present on items returned
    /// by `claim_next`, which is the only way to obtain a `RawItem`.
    pub started_at: Option<OffsetDateTime>,
}

/// Contract implemented by every storage backend.
///
/// One backend instance serves one queue for its whole lifetime.
/// Constructors ensure the backing schema exists before returning, and
/// `ensure_schema` remains safe to call again at any time.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the name of the queue this backend serves.
    fn queue_name(&self) -> &str;

    /// Creates the backing table/collection if it does not exist yet.  Safe
    /// to call repeatedly; runs inside its own transaction or atomic command.
    async fn ensure_schema(&self) -> DbResult<()>;

    /// Obtains the next sequence number for an insert.
    ///
    /// Backends whose store assigns identifiers natively (the relational
    /// family, via auto-increment keys) return `None`; the document family
    /// atomically increments its per-queue counter and returns the value.
    async fn next_sequence(&self) -> DbResult<Option<i64>>;

    /// Appends one unclaimed item with the given serialized `payload`.
    /// `sequence` must be the value returned by `next_sequence`.
    async fn insert(&self, sequence: Option<i64>, payload: &str) -> DbResult<()>;

    /// Atomically claims the lowest-id unclaimed item, if any: marks it as
    /// started and returns it.  `Ok(None)` means the queue holds no unclaimed
    /// items, which is not an error.
    async fn claim_next(&self) -> DbResult<Option<RawItem>>;

    /// Deletes the item identified by `id`.  Deleting an id that does not
    /// exist is a no-op.
    async fn remove(&self, id: i64) -> DbResult<()>;

    /// Returns the total number of items currently stored, claimed or not.
    async fn count(&self) -> DbResult<u64>;
}

/// Checks that `name` is usable as a table/collection name.
///
/// Queue names become SQL identifiers by interpolation, so anything beyond
/// `[A-Za-z_][A-Za-z0-9_]*` is rejected up front.
#[cfg(any(feature = "postgres", feature = "sqlite", feature = "mongodb"))]
pub(crate) fn validate_queue_name(name: &str) -> QueueResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if !valid {
        return Err(QueueError::Config(format!("Invalid queue name '{}'", name)));
    }
    Ok(())
}
