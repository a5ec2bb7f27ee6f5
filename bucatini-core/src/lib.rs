// Copyright 2025 Bucatini Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Bucatini Core - Resumable Change Streams
//!
//! This crate implements the client side of a document-database change
//! stream: a durable, resumable subscription to the ordered sequence of
//! change events on a collection, a database, or a whole deployment. Behind
//! one iterator it hides server-side cursor lifetime, tracks a resume token
//! per event, classifies failures, and transparently re-establishes the
//! subscription after transient errors so no event is lost and none is
//! delivered twice.
//!
//! # Key Components
//!
//! - **Facade**: [`client`] — `Client` / `Database` / `Collection` handles,
//!   each with a `watch` entry point
//! - **State machine**: [`stream`] — open, next, resume, destroy
//! - **Classification**: [`error`] — the table-driven resumability classifier
//! - **Collaborator seam**: [`deployment`] — server selection and command
//!   round-trips, implemented by the embedding driver
//! - **Monitoring**: [`observer`] — one callback per command phase
//!
//! The crate does not open sockets; hand [`client::Client::new`] anything
//! that implements [`deployment::Deployment`].

pub mod client;
pub mod command;
pub mod deployment;
pub mod document;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod options;
pub mod stream;

mod cursor;
mod resume;

pub use client::{Client, Collection, Database};
pub use command::WatchTarget;
pub use deployment::{Deployment, ReadPreference, ServerId, ServerInfo, Session};
pub use error::{classify, Error, Resumption};
pub use observer::CommandObserver;
pub use options::{ChangeStreamOptions, FullDocumentType};
pub use stream::ChangeStream;
