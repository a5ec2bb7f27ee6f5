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

//! Per-stream resume bookkeeping.
//!
//! [`ResumeState`] remembers every position hint the stream has seen — the
//! caller's options, the token of the last delivered event, the latest
//! batch-boundary token, the operation time of the initial reply — and
//! collapses them into a single selector when a resume rebuilds the
//! `aggregate`.
//!
//! Selector precedence on resume, highest first:
//!
//! 1. the post-batch token, when the current batch is exhausted;
//! 2. the token of the last delivered event;
//! 3. the caller's `start_after`, while nothing was ever delivered
//!    (rewritten to `resumeAfter` — `startAfter` is an open-time-only field);
//! 4. the caller's `resume_after`, while nothing was ever delivered;
//! 5. the operation time captured from the initial `aggregate` reply;
//! 6. the caller's `start_at_operation_time`;
//! 7. nothing.
//!
//! Exactly one of `resumeAfter` / `startAfter` / `startAtOperationTime` is
//! emitted on a resume. The initial open instead forwards every selector the
//! caller supplied, verbatim; the server arbitrates conflicts.

use bson::{doc, Document, Timestamp};

use crate::options::ChangeStreamOptions;

/// Position hints accumulated over the life of one stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResumeState {
    /// Caller's `resumeAfter` option.
    resume_after: Option<Document>,
    /// Caller's `startAfter` option.
    start_after: Option<Document>,
    /// Caller's `startAtOperationTime` option.
    start_at_operation_time: Option<Timestamp>,
    /// `operationTime` of the initial `aggregate` reply.
    operation_time: Option<Timestamp>,
    /// Latest `postBatchResumeToken` received from the server.
    post_batch_token: Option<Document>,
    /// `_id` of the most recently delivered event. Never cleared: once an
    /// event was delivered, option-sourced selectors are stale forever.
    last_doc_token: Option<Document>,
}

impl ResumeState {
    pub(crate) fn from_options(options: &ChangeStreamOptions) -> Self {
        ResumeState {
            resume_after: options.resume_after.clone(),
            start_after: options.start_after.clone(),
            start_at_operation_time: options.start_at_operation_time,
            ..ResumeState::default()
        }
    }

    /// Selector fields for the initial `aggregate`: the caller's options,
    /// all of them, unmodified.
    pub(crate) fn initial_position(&self) -> Document {
        let mut position = Document::new();
        if let Some(token) = &self.resume_after {
            position.insert("resumeAfter", token.clone());
        }
        if let Some(token) = &self.start_after {
            position.insert("startAfter", token.clone());
        }
        if let Some(ts) = self.start_at_operation_time {
            position.insert("startAtOperationTime", ts);
        }
        position
    }

    /// Selector fields for a resumed `aggregate`: the single highest-priority
    /// position known.
    pub(crate) fn resume_position(&self, at_batch_boundary: bool) -> Document {
        if let Some(token) = self.token(at_batch_boundary) {
            return doc! { "resumeAfter": token.clone() };
        }
        if let Some(ts) = self.operation_time.or(self.start_at_operation_time) {
            return doc! { "startAtOperationTime": ts };
        }
        Document::new()
    }

    /// The best resume token currently known, by the same precedence the
    /// resume selector uses. Timestamp positions are not tokens and are not
    /// reported here.
    pub(crate) fn token(&self, at_batch_boundary: bool) -> Option<&Document> {
        if at_batch_boundary {
            if let Some(token) = &self.post_batch_token {
                return Some(token);
            }
        }
        self.last_doc_token
            .as_ref()
            .or(self.start_after.as_ref())
            .or(self.resume_after.as_ref())
    }

    /// Records the `operationTime` of the initial reply.
    pub(crate) fn record_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = Some(ts);
    }

    /// Records a batch-boundary token from an `aggregate` or `getMore` reply.
    pub(crate) fn record_post_batch_token(&mut self, token: &Document) {
        self.post_batch_token = Some(token.clone());
    }

    /// Records the token of a delivered event.
    pub(crate) fn record_document_token(&mut self, token: Document) {
        self.last_doc_token = Some(token);
    }
}
