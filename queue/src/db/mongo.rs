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

//! Document storage backend on top of MongoDB.
//!
//! Queue items live in one collection per queue; claim-order sequence numbers
//! come from a shared `counters` collection updated with an atomic
//! increment-and-fetch.  Claiming is a single `findOneAndUpdate`, so this
//! backend needs no multi-statement transactions at all.

use crate::db::{validate_queue_name, RawItem, StorageBackend};
use crate::model::{QueueOptions, QueueResult};
use async_trait::async_trait;
use dbq_core::clocks::Clock;
use dbq_core::db::{DbError, DbResult};
use dbq_core::env::get_required_var;
use log::debug;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

/// Name of the shared collection that holds the per-queue sequence counters.
const COLLECTION_NAME_COUNTERS: &str = "counters";

/// Field holding the claim-order sequence number of an item document.
const FIELD_CREATED_SEQUENCE: &str = "created_sequence";

/// Field holding the serialized payload of an item document.
const FIELD_ITEM: &str = "item";

/// Field holding the claim timestamp of an item document; null when
/// unclaimed.
const FIELD_STARTED_AT: &str = "started_at";

/// Server error code raised when creating a collection that already exists.
const NAMESPACE_EXISTS: i32 = 48;

/// Takes a raw MongoDB driver error `e` and converts it to our generic error
/// type.
fn map_mongo_error(e: mongodb::error::Error) -> DbError {
    match e.kind.as_ref() {
        ErrorKind::Io(_) => DbError::Unavailable,
        ErrorKind::ServerSelection { .. } => DbError::Unavailable,
        _ => DbError::BackendError(e.to_string()),
    }
}

/// Options to establish a connection to a MongoDB database.
#[derive(Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct MongoOptions {
    /// Connection string, e.g. `mongodb://localhost:27017`.
    pub uri: String,

    /// Database name to use.
    pub database: String,
}

impl MongoOptions {
    /// Initializes a set of options from environment variables whose name is
    /// prefixed with the given `prefix`.
    ///
    /// This will use the `<prefix>_URI` and `<prefix>_DATABASE` variables.
    pub fn from_env(prefix: &str) -> Result<MongoOptions, String> {
        Ok(MongoOptions {
            uri: get_required_var::<String>(prefix, "URI")?,
            database: get_required_var::<String>(prefix, "DATABASE")?,
        })
    }
}

/// Establishes a connection to the database described by `opts`.
pub async fn connect(opts: &MongoOptions) -> DbResult<Database> {
    let client = Client::with_uri_str(&opts.uri).await.map_err(map_mongo_error)?;
    Ok(client.database(&opts.database))
}

/// Storage backend for the document family.
pub struct MongoBackend {
    /// Database holding the queue and counter collections.
    db: Database,

    /// Collection holding the queue items.
    items: Collection<Document>,

    /// Shared collection holding the per-queue sequence counters.
    counters: Collection<Document>,

    /// Clock used to stamp claims.
    clock: Arc<dyn Clock + Send + Sync>,

    /// Queue name; doubles as the collection name.
    name: String,

    /// Name of this queue's document in the counters collection.
    counter_name: String,

    /// Bound on the serialized item length, checked on insert because there
    /// is no schema to do it for us.
    max_payload_bytes: usize,
}

impl MongoBackend {
    /// Creates a backend for the queue described by `opts` inside `db`,
    /// ensuring the item collection exists.
    pub async fn connect(
        db: Database,
        clock: Arc<dyn Clock + Send + Sync>,
        opts: &QueueOptions,
    ) -> QueueResult<Self> {
        validate_queue_name(&opts.name)?;

        let backend = Self {
            items: db.collection::<Document>(&opts.name),
            counters: db.collection::<Document>(COLLECTION_NAME_COUNTERS),
            db,
            clock,
            name: opts.name.clone(),
            counter_name: format!("{}_counter", opts.name),
            max_payload_bytes: opts.max_payload_bytes,
        };
        backend.ensure_schema().await?;
        Ok(backend)
    }
}

#[async_trait]
impl StorageBackend for MongoBackend {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn ensure_schema(&self) -> DbResult<()> {
        match self.db.create_collection(&self.name, None).await {
            Ok(()) => Ok(()),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::Command(c) if c.code == NAMESPACE_EXISTS => Ok(()),
                _ => Err(map_mongo_error(e)),
            },
        }
    }

    async fn next_sequence(&self) -> DbResult<Option<i64>> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = self
            .counters
            .find_one_and_update(
                doc! { "name": &self.counter_name },
                doc! { "$inc": { "number": 1i64 } },
                options,
            )
            .await
            .map_err(map_mongo_error)?
            .ok_or_else(|| {
                DbError::BackendError(format!("Upsert of counter {} returned no document", self.counter_name))
            })?;
        let number = counter.get_i64("number").map_err(|e| {
            DbError::DataIntegrityError(format!("Invalid counter {}: {}", self.counter_name, e))
        })?;
        Ok(Some(number))
    }

    async fn insert(&self, sequence: Option<i64>, payload: &str) -> DbResult<()> {
        let sequence = sequence.ok_or_else(|| {
            DbError::DataIntegrityError("Document inserts require a sequence number".to_owned())
        })?;
        if payload.len() > self.max_payload_bytes {
            return Err(DbError::BackendError(format!(
                "Payload of {} bytes exceeds the configured limit of {}",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        let document = doc! {
            FIELD_CREATED_SEQUENCE: sequence,
            FIELD_ITEM: payload,
            FIELD_STARTED_AT: Bson::Null,
        };
        self.items.insert_one(document, None).await.map_err(map_mongo_error)?;
        Ok(())
    }

    async fn claim_next(&self) -> DbResult<Option<RawItem>> {
        let now = self.clock.now_utc();
        let started_at = now.format(&Rfc3339).map_err(|e| {
            DbError::BackendError(format!("Cannot format claim timestamp: {}", e))
        })?;

        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! { FIELD_CREATED_SEQUENCE: 1 })
            .return_document(ReturnDocument::After)
            .build();
        let claimed = self
            .items
            .find_one_and_update(
                doc! { FIELD_STARTED_AT: Bson::Null },
                doc! { "$set": { FIELD_STARTED_AT: &started_at } },
                options,
            )
            .await
            .map_err(map_mongo_error)?;

        match claimed {
            None => Ok(None),
            Some(document) => {
                let id = document.get_i64(FIELD_CREATED_SEQUENCE).map_err(|e| {
                    DbError::DataIntegrityError(format!("Invalid {}: {}", FIELD_CREATED_SEQUENCE, e))
                })?;
                let payload = document
                    .get_str(FIELD_ITEM)
                    .map_err(|e| {
                        DbError::DataIntegrityError(format!("Invalid {}: {}", FIELD_ITEM, e))
                    })?
                    .to_owned();
                Ok(Some(RawItem { id, payload, started_at: Some(now) }))
            }
        }
    }

    async fn remove(&self, id: i64) -> DbResult<()> {
        let result = self
            .items
            .delete_one(doc! { FIELD_CREATED_SEQUENCE: id }, None)
            .await
            .map_err(map_mongo_error)?;
        if result.deleted_count == 0 {
            // Removing an id that is already gone is explicitly not an error.
            debug!("Queue {}: remove of missing item {}", self.name, id);
        }
        Ok(())
    }

    async fn count(&self) -> DbResult<u64> {
        self.items.count_documents(None, None).await.map_err(map_mongo_error)
    }
}
