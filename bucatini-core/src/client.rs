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

//! Watch entry points.
//!
//! Three handles — [`Client`], [`Database`], [`Collection`] — each expose
//! `watch(pipeline, options)`. They differ only in the scope they subscribe
//! to; everything else (pipeline shapes accepted, options honored, resume
//! behavior) is identical.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bson::doc;
//! use bucatini_core::client::Client;
//! use bucatini_core::deployment::Deployment;
//! use bucatini_core::options::ChangeStreamOptions;
//!
//! # async fn example(deployment: Arc<dyn Deployment>) {
//! let client = Client::new(deployment);
//! let collection = client.database("db").collection("coll");
//!
//! let mut stream = collection
//!     .watch(doc! {}, ChangeStreamOptions::default())
//!     .await;
//! while let Ok(Some(event)) = stream.next().await {
//!     println!("{:?}", event.get_str("operationType"));
//! }
//! # }
//! ```
//!
//! `watch` contacts the server eagerly, but always hands back a stream: an
//! open failure is parked on the stream and surfaces from the first `next`
//! (or from [`ChangeStream::error_document`]), which keeps the error
//! contract identical for open-time and iteration-time failures.

use std::sync::Arc;

use bson::Document;

use crate::command::{normalize_pipeline, WatchTarget};
use crate::deployment::{Deployment, Executor};
use crate::observer::CommandObserver;
use crate::options::ChangeStreamOptions;
use crate::stream::ChangeStream;

/// Handle to a deployment.
#[derive(Clone)]
pub struct Client {
    executor: Arc<Executor>,
}

impl Client {
    #[must_use]
    pub fn new(deployment: Arc<dyn Deployment>) -> Self {
        Client {
            executor: Arc::new(Executor::new(deployment)),
        }
    }

    /// Registers a command observer; every command any stream of this client
    /// issues is reported to it.
    pub fn observe(&self, observer: Arc<dyn CommandObserver>) {
        self.executor.subscribe(observer);
    }

    #[must_use]
    pub fn database(&self, name: impl Into<String>) -> Database {
        Database {
            executor: Arc::clone(&self.executor),
            name: name.into(),
        }
    }

    /// Watches every database in the deployment.
    pub async fn watch(&self, pipeline: Document, options: ChangeStreamOptions) -> ChangeStream {
        watch(&self.executor, WatchTarget::Deployment, pipeline, options).await
    }
}

/// Handle to one database.
#[derive(Clone)]
pub struct Database {
    executor: Arc<Executor>,
    name: String,
}

impl Database {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection {
            executor: Arc::clone(&self.executor),
            database: self.name.clone(),
            name: name.into(),
        }
    }

    /// Watches every collection in this database.
    pub async fn watch(&self, pipeline: Document, options: ChangeStreamOptions) -> ChangeStream {
        watch(
            &self.executor,
            WatchTarget::Database {
                database: self.name.clone(),
            },
            pipeline,
            options,
        )
        .await
    }
}

/// Handle to one collection.
#[derive(Clone)]
pub struct Collection {
    executor: Arc<Executor>,
    database: String,
    name: String,
}

impl Collection {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watches this collection.
    pub async fn watch(&self, pipeline: Document, options: ChangeStreamOptions) -> ChangeStream {
        watch(
            &self.executor,
            WatchTarget::Collection {
                database: self.database.clone(),
                collection: self.name.clone(),
            },
            pipeline,
            options,
        )
        .await
    }
}

async fn watch(
    executor: &Arc<Executor>,
    target: WatchTarget,
    pipeline: Document,
    options: ChangeStreamOptions,
) -> ChangeStream {
    let stages = normalize_pipeline(&pipeline);
    ChangeStream::open(Arc::clone(executor), target, stages, options).await
}
