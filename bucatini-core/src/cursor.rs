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

//! The cursor adapter.
//!
//! Wraps one server-side cursor with change-stream semantics: buffers the
//! current batch, refreshes the post-batch resume token from each reply, and
//! issues at most one `getMore` per `next` call. It reports errors upward
//! unclassified and never decides to resume; that judgment belongs to the
//! stream that owns it.

use std::collections::VecDeque;
use std::sync::Arc;

use bson::{Bson, Document};
use tracing::{debug, warn};

use crate::command::{build_get_more, build_kill_cursors};
use crate::deployment::{Executor, ServerInfo};
use crate::document;
use crate::error::Error;
use crate::options::ChangeStreamOptions;

/// One open server-side cursor, exclusively owned by a change stream.
pub(crate) struct ChangeStreamCursor {
    executor: Arc<Executor>,
    server: ServerInfo,
    /// Database of the cursor namespace the server reported.
    database: String,
    /// Collection part of the namespace; the `getMore` / `killCursors`
    /// `collection` field (`$cmd.aggregate` for non-collection targets).
    collection: String,
    /// Zero once the server reports exhaustion or the cursor was killed.
    cursor_id: i64,
    batch: VecDeque<Document>,
    post_batch_token: Option<Document>,
    options: ChangeStreamOptions,
}

impl ChangeStreamCursor {
    /// Builds an adapter from a successful `aggregate` reply.
    pub(crate) fn from_reply(
        executor: Arc<Executor>,
        server: ServerInfo,
        reply: &Document,
        options: ChangeStreamOptions,
    ) -> Result<Self, Error> {
        let cursor_id = document::cursor_id(reply)
            .ok_or_else(|| Error::Bson("aggregate reply is missing cursor.id".to_string()))?;
        let namespace = document::cursor_namespace(reply)
            .ok_or_else(|| Error::Bson("aggregate reply is missing cursor.ns".to_string()))?;
        let (database, collection) = namespace.split_once('.').ok_or_else(|| {
            Error::Bson(format!("cursor namespace {namespace:?} has no collection"))
        })?;

        let batch = document::first_batch(reply)
            .map(|batch| batch_documents(batch))
            .unwrap_or_default();
        debug!(
            cursor_id,
            namespace, batch = batch.len(), "change stream cursor opened"
        );

        Ok(ChangeStreamCursor {
            executor,
            server,
            database: database.to_string(),
            collection: collection.to_string(),
            cursor_id,
            batch,
            post_batch_token: document::post_batch_resume_token(reply).cloned(),
            options,
        })
    }

    /// One step of iteration: a buffered document, one `getMore` if the
    /// buffer is dry and the cursor lives, or "nothing right now".
    pub(crate) async fn next(&mut self) -> Result<Option<Document>, Error> {
        if let Some(doc) = self.batch.pop_front() {
            return Ok(Some(doc));
        }
        if self.cursor_id == 0 {
            return Ok(None);
        }

        let command = build_get_more(self.cursor_id, &self.collection, &self.options);
        let reply = self
            .executor
            .run(self.server, &self.database, command)
            .await?;

        if let Some(id) = document::cursor_id(&reply) {
            self.cursor_id = id;
        }
        if let Some(batch) = document::next_batch(&reply) {
            self.batch = batch_documents(batch);
        }
        if let Some(token) = document::post_batch_resume_token(&reply) {
            self.post_batch_token = Some(token.clone());
        }
        Ok(self.batch.pop_front())
    }

    /// Best-effort `killCursors`; the result and any error are discarded.
    pub(crate) async fn kill(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        let command = build_kill_cursors(
            self.cursor_id,
            &self.collection,
            self.options.session.as_ref(),
        );
        if let Err(error) = self
            .executor
            .run(self.server, &self.database, command)
            .await
        {
            warn!(cursor_id = self.cursor_id, %error, "killCursors failed; ignoring");
        }
        self.cursor_id = 0;
    }

    /// The latest batch-boundary token the server supplied.
    pub(crate) fn post_batch_token(&self) -> Option<&Document> {
        self.post_batch_token.as_ref()
    }

    /// True when the current batch is fully drained.
    pub(crate) fn at_batch_boundary(&self) -> bool {
        self.batch.is_empty()
    }

    pub(crate) fn server(&self) -> ServerInfo {
        self.server
    }

    pub(crate) fn id(&self) -> i64 {
        self.cursor_id
    }
}

/// Keeps the document-typed elements of a reply batch.
fn batch_documents(batch: &[Bson]) -> VecDeque<Document> {
    batch
        .iter()
        .filter_map(|entry| match entry {
            Bson::Document(doc) => Some(doc.clone()),
            _ => None,
        })
        .collect()
}
