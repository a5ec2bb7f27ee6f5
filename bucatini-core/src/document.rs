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

//! Named accessors over raw server reply documents.
//!
//! The change stream core inspects only a handful of well-known paths in the
//! documents it exchanges with the deployment (`cursor.id`,
//! `cursor.postBatchResumeToken`, `operationTime`, an event's `_id`, …).
//! Rather than expose a generic dynamic walker, this module names each of
//! those paths once, so the rest of the crate reads like the wire contract it
//! implements.
//!
//! All accessors are lenient about integer widths: servers reply with a mix
//! of `int32`, `int64`, and `double` depending on version.

use bson::{Bson, Document, Timestamp};

/// Walks a dotted path through nested documents.
fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = match value {
            Bson::Document(inner) => inner,
            _ => return None,
        };
    }
    None
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        _ => None,
    }
}

/// The cursor id from an `aggregate` or `getMore` reply (`cursor.id`).
pub fn cursor_id(reply: &Document) -> Option<i64> {
    lookup(reply, "cursor.id").and_then(as_i64)
}

/// The cursor namespace from an `aggregate` reply (`cursor.ns`).
pub fn cursor_namespace(reply: &Document) -> Option<&str> {
    match lookup(reply, "cursor.ns") {
        Some(Bson::String(ns)) => Some(ns),
        _ => None,
    }
}

/// The initial batch of an `aggregate` reply (`cursor.firstBatch`).
pub fn first_batch(reply: &Document) -> Option<&Vec<Bson>> {
    match lookup(reply, "cursor.firstBatch") {
        Some(Bson::Array(batch)) => Some(batch),
        _ => None,
    }
}

/// The continuation batch of a `getMore` reply (`cursor.nextBatch`).
pub fn next_batch(reply: &Document) -> Option<&Vec<Bson>> {
    match lookup(reply, "cursor.nextBatch") {
        Some(Bson::Array(batch)) => Some(batch),
        _ => None,
    }
}

/// The batch-boundary resume token (`cursor.postBatchResumeToken`).
///
/// Only servers new enough to compute it include the field; absence is not an
/// error.
pub fn post_batch_resume_token(reply: &Document) -> Option<&Document> {
    match lookup(reply, "cursor.postBatchResumeToken") {
        Some(Bson::Document(token)) => Some(token),
        _ => None,
    }
}

/// The top-level `operationTime` of a command reply.
pub fn operation_time(reply: &Document) -> Option<Timestamp> {
    match lookup(reply, "operationTime") {
        Some(Bson::Timestamp(ts)) => Some(*ts),
        _ => None,
    }
}

/// Whether a command reply reports success (`ok` ≠ 0, in any numeric shape).
pub fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Int32(n)) => *n != 0,
        Some(Bson::Int64(n)) => *n != 0,
        Some(Bson::Double(n)) => *n != 0.0,
        Some(Bson::Boolean(b)) => *b,
        _ => false,
    }
}

/// The numeric error code of a failed reply, if the server sent one.
pub fn error_code(reply: &Document) -> Option<i32> {
    reply.get("code").and_then(as_i64).map(|code| code as i32)
}

/// The error message of a failed reply (`errmsg`).
pub fn error_message(reply: &Document) -> Option<&str> {
    match reply.get("errmsg") {
        Some(Bson::String(msg)) => Some(msg),
        _ => None,
    }
}

/// The error labels of a failed reply (`errorLabels`), empty when absent.
pub fn error_labels(reply: &Document) -> Vec<String> {
    match reply.get("errorLabels") {
        Some(Bson::Array(labels)) => labels
            .iter()
            .filter_map(|label| match label {
                Bson::String(label) => Some(label.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// The resume token of a delivered event: its `_id` field.
///
/// Returns `None` when `_id` is absent or not document-typed; either way no
/// future resume could be correct, so the caller must treat this as fatal.
pub fn resume_token(event: &Document) -> Option<&Document> {
    match event.get("_id") {
        Some(Bson::Document(token)) => Some(token),
        _ => None,
    }
}
