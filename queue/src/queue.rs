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

//! Backend-agnostic queue facade.

use crate::db::StorageBackend;
use crate::model::{QueueError, QueueItem, QueueResult};
use derivative::Derivative;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A durable queue of items of type `T`.
///
/// All operations are synchronous from the caller's perspective: when they
/// return, the corresponding change is durable in the backing store.  The
/// facade serializes items to JSON and delegates everything else to its
/// storage backend, so cloned handles (and handles in other processes bound
/// to the same store and queue name) all observe the same queue.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Queue<T>
where
    T: Send + Sync,
{
    /// The storage backend holding this queue's items.
    backend: Arc<dyn StorageBackend>,

    /// The type of the items in this queue.
    _data: PhantomData<fn() -> T>,
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a queue facade over `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend, _data: PhantomData }
    }

    /// Returns the name of this queue.
    pub fn name(&self) -> &str {
        self.backend.queue_name()
    }

    /// Appends `item` to the queue.
    ///
    /// A serialization failure aborts the call before anything is written.
    pub async fn enqueue(&self, item: &T) -> QueueResult<()> {
        let payload = serde_json::to_string(item)
            .map_err(|e| QueueError::Serialization(format!("Cannot encode item: {}", e)))?;
        let sequence = self.backend.next_sequence().await?;
        self.backend.insert(sequence, &payload).await?;
        debug!("Queue {}: enqueued one item", self.name());
        Ok(())
    }

    /// Returns the total number of items currently stored, claimed or not.
    pub async fn size(&self) -> QueueResult<u64> {
        Ok(self.backend.count().await?)
    }

    /// Claims the next unclaimed item, if any.
    ///
    /// `Ok(None)` means the queue holds no unclaimed items and is not an
    /// error.  A payload that cannot be decoded yields a `Serialization`
    /// error and leaves the affected item claimed; it will not be returned
    /// again.
    pub async fn claim_next(&self) -> QueueResult<Option<QueueItem<T>>> {
        let raw = match self.backend.claim_next().await? {
            None => return Ok(None),
            Some(raw) => raw,
        };
        let item = serde_json::from_str::<T>(&raw.payload).map_err(|e| {
            QueueError::Serialization(format!("Cannot decode claimed item {}: {}", raw.id, e))
        })?;
        debug!("Queue {}: claimed item {}", self.name(), raw.id);
        Ok(Some(QueueItem::new(raw.id, item)))
    }

    /// Deletes the item identified by `id` from the queue.
    ///
    /// Callers must only do this after successfully finishing the work for
    /// that item.  Removing an id that does not exist is a no-op.
    pub async fn remove(&self, id: i64) -> QueueResult<()> {
        self.backend.remove(id).await?;
        debug!("Queue {}: removed item {}", self.name(), id);
        Ok(())
    }
}
