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

//! A durable work queue backed by a database.
//!
//! Producers append typed items to a queue whose contents live in a shared
//! store; consumers claim items one at a time, process them, and delete them
//! on success.  Claiming relies exclusively on the store's native concurrency
//! control (row locking inside a transaction for the SQL backends, an atomic
//! find-and-update for the document backend), so any number of independent
//! processes can share one queue safely.
//!
//! The `Queue` facade exposes the durable operations: `enqueue`, `size`,
//! `claim_next`, and `remove`.  On top of it, `driver::Worker` runs a
//! consumer-supplied drain function whenever it is poked, `driver::WorkerPool`
//! fans that out to a homogeneous group of workers with a wait-until-idle
//! barrier, and `driver::QueueExecutor` couples a dedicated poller with a
//! bounded handler pool, removing each item only once its handler reports
//! completion.
//!
//! A claimed item is never returned to another claimer until it is removed.
//! There is no reclaim-on-timeout mechanism: a consumer that dies mid-item
//! leaves that item claimed forever.  This is a deliberate property of the
//! protocol, not an oversight.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod db;
pub mod driver;
pub mod model;

mod queue;
pub use crate::queue::Queue;
