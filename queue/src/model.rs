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

//! Generic data types for the queue.
//!
//! The queue only cares about the ability to serialize and deserialize item
//! definitions: producers must be able to enqueue items without knowing how
//! they will be processed.  Consequently there is no trait for "processable"
//! items here; processing logic is supplied to the drivers as plain
//! functions.

use dbq_core::db::DbError;

/// Default bound, in bytes, on the serialized representation of an item.
pub(crate) const DEFAULT_MAX_PAYLOAD_BYTES: usize = 128;

/// Errors that the queue surfaces to its callers.
///
/// The variants deliberately distinguish the cases that a caller may want to
/// react to differently: a configuration mistake is permanent and raised at
/// construction time only, a serialization failure is fatal to the single
/// operation that triggered it, and everything the backing store reports
/// arrives as a `Database` error (with `DbError::Unavailable` flagging
/// connectivity loss).  Note that claiming from an empty queue is *not* an
/// error; it is the `None` case of `Queue::claim_next`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Indicates an invalid or unusable configuration, such as a queue name
    /// that cannot be used as a table name or a database that no registered
    /// dialect recognizes.  Never retried.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Indicates that an item could not be encoded for storage or decoded
    /// after a claim.  A decode failure leaves the affected item claimed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An error reported by the backing store.
    #[error(transparent)]
    Database(#[from] DbError),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Configuration for a single queue.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// Name of the queue.  Doubles as the table/collection name in the store,
    /// so it must look like an identifier.
    pub name: String,

    /// Maximum length, in bytes, of a serialized item.  Enforced by the
    /// backing schema where possible and checked explicitly otherwise.
    pub max_payload_bytes: usize,
}

impl QueueOptions {
    /// Creates options for the queue `name` with the default payload bound.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES }
    }

    /// Overrides the maximum serialized item length.
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }
}

/// A claimed queue item: the decoded item plus the identifier needed to
/// remove it once processing succeeds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueItem<T> {
    /// Claim-order identifier assigned by the storage backend.
    id: i64,

    /// The decoded item.
    item: T,
}

impl<T> QueueItem<T> {
    /// Creates a new claimed item as extracted from the store.
    pub(crate) fn new(id: i64, item: T) -> Self {
        Self { id, item }
    }

    /// Returns the storage identifier of this item.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Returns the decoded item.
    pub fn item(&self) -> &T {
        &self.item
    }

    /// Consumes the wrapper and returns the decoded item.
    pub fn into_item(self) -> T {
        self.item
    }
}
