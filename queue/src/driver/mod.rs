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

//! Consumer-side drivers for the queue.
//!
//! `Worker` and `WorkerPool` run a consumer-supplied drain function whenever
//! they are poked and support barrier-waiting until everything signaled so
//! far has drained.  `QueueExecutor` is the higher-level alternative: it owns
//! its own poller, claims items continuously, and dispatches each one to a
//! bounded handler pool.

mod executor;
pub use executor::{ExecutorOptions, QueueExecutor};

mod worker;
pub use worker::{Worker, WorkerPool};
