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

//! Core abstractions shared by the DBQ crates.
//!
//! This crate provides the environmental pieces that the queue itself treats
//! as external collaborators: database connections and their transaction
//! boundaries (`db`), wall clocks (`clocks`), and typed access to
//! configuration taken from environment variables (`env`).
//!
//! The database module abstracts over different engines behind cargo
//! features.  The PostgreSQL backend is intended for production use and the
//! SQLite backend primarily supports unit tests, although both are fully
//! functional.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod clocks;
pub mod db;
pub mod env;
