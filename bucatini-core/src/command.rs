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

//! Wire-command assembly.
//!
//! A change stream is three server commands: the `aggregate` that opens a
//! cursor with a prepended `$changeStream` stage, the `getMore` that drains
//! it, and the `killCursors` that releases it. This module builds all three
//! from a [`WatchTarget`], the normalized user pipeline, the caller's
//! options, and the current resume position.

use bson::{doc, Bson, Document};

use crate::deployment::Session;
use crate::options::ChangeStreamOptions;

/// Pipeline stage names that turn an aggregate into a write.
const WRITE_STAGE_KEYS: [&str; 2] = ["$out", "$merge"];

/// The scope a change stream subscribes to.
///
/// The target decides the value of the command's `aggregate` field and the
/// database the command is issued against:
///
/// - a collection target names the collection;
/// - a database target uses the sentinel `1` against that database;
/// - a deployment target uses the sentinel `1` against `admin` and asks for
///   every change in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// All databases in the deployment.
    Deployment,
    /// All collections in one database.
    Database { database: String },
    /// A single collection.
    Collection {
        database: String,
        collection: String,
    },
}

impl WatchTarget {
    /// The database the `aggregate` is issued against.
    #[must_use]
    pub fn database(&self) -> &str {
        match self {
            WatchTarget::Deployment => "admin",
            WatchTarget::Database { database }
            | WatchTarget::Collection { database, .. } => database,
        }
    }

    /// The value of the command's `aggregate` field.
    #[must_use]
    pub fn aggregate_target(&self) -> Bson {
        match self {
            WatchTarget::Collection { collection, .. } => Bson::String(collection.clone()),
            _ => Bson::Int32(1),
        }
    }

    #[must_use]
    pub fn is_deployment(&self) -> bool {
        matches!(self, WatchTarget::Deployment)
    }

    /// Human-readable scope, for logs.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            WatchTarget::Deployment => "deployment".to_string(),
            WatchTarget::Database { database } => format!("database {database}"),
            WatchTarget::Collection {
                database,
                collection,
            } => format!("collection {database}.{collection}"),
        }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// Normalizes the two accepted pipeline shapes into a stage list.
///
/// Callers may pass either a document whose `pipeline` field is an array, or
/// an array-shaped document whose keys are the decimal indices `"0"`, `"1"`,
/// …. Elements are not validated here; a malformed stage is the server's to
/// reject, and its error is surfaced unchanged.
pub(crate) fn normalize_pipeline(pipeline: &Document) -> Vec<Bson> {
    if let Some(Bson::Array(stages)) = pipeline.get("pipeline") {
        stages.clone()
    } else {
        pipeline.values().cloned().collect()
    }
}

/// Whether any stage writes (`$out` / `$merge`).
pub(crate) fn pipeline_has_write_key(stages: &[Bson]) -> bool {
    stages.iter().any(|stage| match stage {
        Bson::Document(stage) => WRITE_STAGE_KEYS
            .iter()
            .any(|key| stage.contains_key(key)),
        _ => false,
    })
}

/// Builds the `aggregate` command for an open or a resume.
///
/// `position` carries the resume-selector fields for the `$changeStream`
/// stage: everything the user supplied on the initial open, exactly one
/// selector on a resume.
pub(crate) fn build_aggregate(
    target: &WatchTarget,
    stages: &[Bson],
    options: &ChangeStreamOptions,
    position: &Document,
) -> Document {
    let mut stage = doc! { "fullDocument": options.full_document.as_str() };
    if target.is_deployment() {
        stage.insert("allChangesForCluster", true);
    }
    for (key, value) in position {
        stage.insert(key.clone(), value.clone());
    }

    let mut pipeline = vec![Bson::Document(doc! { "$changeStream": stage })];
    pipeline.extend(stages.iter().cloned());

    let mut command = doc! {
        "aggregate": target.aggregate_target(),
        "pipeline": pipeline,
    };

    let has_write_key = pipeline_has_write_key(stages);
    let mut cursor = Document::new();
    if let Some(size) = options.batch_size {
        // A zero batch size is meaningless for write-stage aggregates.
        if !(has_write_key && size == 0) {
            cursor.insert("batchSize", size as i32);
        }
    }
    command.insert("cursor", cursor);

    if let Some(collation) = &options.collation {
        command.insert("collation", collation.clone());
    }
    if let Some(read_concern) = &options.read_concern {
        command.insert("readConcern", read_concern.clone());
    }
    if has_write_key {
        if let Some(write_concern) = &options.write_concern {
            command.insert("writeConcern", write_concern.clone());
        }
    }
    if let Some(session) = &options.session {
        command.insert("lsid", session.id().clone());
    }
    command
}

/// Builds the `getMore` that drains an open cursor.
pub(crate) fn build_get_more(
    cursor_id: i64,
    collection: &str,
    options: &ChangeStreamOptions,
) -> Document {
    let mut command = doc! {
        "getMore": cursor_id,
        "collection": collection,
    };
    if let Some(size) = options.batch_size {
        command.insert("batchSize", size as i32);
    }
    if let Some(ms) = options.max_await_time_ms {
        command.insert("maxTimeMS", ms as i64);
    }
    if let Some(session) = &options.session {
        command.insert("lsid", session.id().clone());
    }
    command
}

/// Builds the best-effort `killCursors` issued on reset and close.
pub(crate) fn build_kill_cursors(
    cursor_id: i64,
    collection: &str,
    session: Option<&Session>,
) -> Document {
    let mut command = doc! {
        "killCursors": collection,
        "cursors": [cursor_id],
    };
    if let Some(session) = session {
        command.insert("lsid", session.id().clone());
    }
    command
}
