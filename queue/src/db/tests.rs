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

//! Common tests for any storage backend implementation.
//!
//! Each test takes a ready-to-use backend whose schema has been created and
//! whose queue is empty.  The per-backend modules instantiate this suite via
//! the `generate_tests!` macro with their own setup expressions.

use crate::db::StorageBackend;
use std::collections::HashSet;
use std::sync::Arc;

/// Enqueues `payload` the way the facade does: sequence first, then insert.
async fn enqueue_payload(backend: &Arc<dyn StorageBackend>, payload: &str) {
    let sequence = backend.next_sequence().await.unwrap();
    backend.insert(sequence, payload).await.unwrap();
}

pub(super) async fn test_count_starts_at_zero(backend: Arc<dyn StorageBackend>) {
    assert_eq!(0, backend.count().await.unwrap());
}

pub(super) async fn test_insert_then_count(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    enqueue_payload(&backend, "\"b\"").await;
    enqueue_payload(&backend, "\"c\"").await;
    assert_eq!(3, backend.count().await.unwrap());
}

pub(super) async fn test_claim_next_empty_returns_none(backend: Arc<dyn StorageBackend>) {
    assert_eq!(None, backend.claim_next().await.unwrap());
}

pub(super) async fn test_claim_next_returns_fifo_order(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"first\"").await;
    enqueue_payload(&backend, "\"second\"").await;
    enqueue_payload(&backend, "\"third\"").await;

    let mut last_id = None;
    for expected in ["\"first\"", "\"second\"", "\"third\""] {
        let raw = backend.claim_next().await.unwrap().unwrap();
        assert_eq!(expected, raw.payload);
        if let Some(last_id) = last_id {
            assert!(raw.id > last_id, "Claim order must follow ascending ids");
        }
        last_id = Some(raw.id);
    }
}

pub(super) async fn test_claim_next_skips_claimed_items(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    enqueue_payload(&backend, "\"b\"").await;

    let first = backend.claim_next().await.unwrap().unwrap();
    let second = backend.claim_next().await.unwrap().unwrap();
    assert_ne!(first.id, second.id);

    // Both items remain stored but neither is claimable again.
    assert_eq!(None, backend.claim_next().await.unwrap());
    assert_eq!(2, backend.count().await.unwrap());
}

pub(super) async fn test_claim_next_stamps_started_at(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    let raw = backend.claim_next().await.unwrap().unwrap();
    assert!(raw.started_at.is_some());
}

pub(super) async fn test_count_includes_claimed_items(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    enqueue_payload(&backend, "\"b\"").await;
    let _raw = backend.claim_next().await.unwrap().unwrap();
    assert_eq!(2, backend.count().await.unwrap());
}

pub(super) async fn test_remove_claimed_item(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    let raw = backend.claim_next().await.unwrap().unwrap();
    backend.remove(raw.id).await.unwrap();
    assert_eq!(0, backend.count().await.unwrap());
}

pub(super) async fn test_remove_missing_id_is_noop(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    backend.remove(123456).await.unwrap();
    assert_eq!(1, backend.count().await.unwrap());
}

pub(super) async fn test_ensure_schema_is_idempotent(backend: Arc<dyn StorageBackend>) {
    enqueue_payload(&backend, "\"a\"").await;
    backend.ensure_schema().await.unwrap();
    backend.ensure_schema().await.unwrap();
    assert_eq!(1, backend.count().await.unwrap());
}

pub(super) async fn test_concurrent_claims_yield_unique_items(backend: Arc<dyn StorageBackend>) {
    const ITEMS: usize = 20;
    const CLAIMERS: usize = 4;

    for i in 0..ITEMS {
        enqueue_payload(&backend, &format!("\"item-{}\"", i)).await;
    }

    let mut handles = Vec::with_capacity(CLAIMERS);
    for _ in 0..CLAIMERS {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = vec![];
            while let Some(raw) = backend.claim_next().await.unwrap() {
                ids.push(raw.id);
            }
            ids
        }));
    }

    let mut all_ids = vec![];
    for handle in handles {
        all_ids.extend(handle.await.unwrap());
    }

    // Every item must have been handed to exactly one claimer.
    assert_eq!(ITEMS, all_ids.len());
    let unique = all_ids.iter().collect::<HashSet<_>>();
    assert_eq!(ITEMS, unique.len());
}
