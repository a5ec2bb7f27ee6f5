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

//! The change stream state machine.
//!
//! A [`ChangeStream`] hides the lifetime of server-side cursors behind a
//! single iterator. Each call to [`next`](ChangeStream::next) either delivers
//! one event document, reports that nothing is available yet, or — after a
//! resumable failure — silently reopens the subscription at the last known
//! position and retries once.
//!
//! # Lifecycle
//!
//! ```text
//!           open()
//!  Initial ───────► Open ──next──► Open            (document delivered)
//!                    │  ──next/err──► classify
//!                    │                   │
//!                    │                   ├─ fatal ──► Errored (terminal)
//!                    │                   └─ resumable ──► resume
//!                    │                                      │
//!                    │                                      ├─ aggregate ok ──► Open
//!                    │                                      └─ aggregate err ──► Errored
//!                    └─ destroy ──► Closed (terminal)
//! ```
//!
//! An error during the very first open is terminal — there is no position to
//! resume from that the server has not already rejected. Once the stream is
//! `Errored`, every later `next` returns the same error.
//!
//! # Resume budget
//!
//! One resume is attempted per `next` call. If the retried fetch fails again
//! — even with an error that would itself be resumable — that second error is
//! surfaced verbatim and becomes terminal. The budget re-arms whenever the
//! server answers a `getMore` successfully, with or without documents.
//!
//! # Ownership
//!
//! A stream is owned by one caller; `&mut self` on every operation makes
//! concurrent iteration unrepresentable. The stream exclusively owns its
//! cursor and drops the old one before opening a replacement.

use std::sync::Arc;

use bson::{Bson, Document};
use tracing::{debug, error, info, warn};

use crate::command::{build_aggregate, pipeline_has_write_key, WatchTarget};
use crate::cursor::ChangeStreamCursor;
use crate::deployment::{Executor, ReadPreference};
use crate::document;
use crate::error::{classify, Error, Resumption};
use crate::metrics;
use crate::options::ChangeStreamOptions;
use crate::resume::ResumeState;

/// A resumable subscription to the ordered change events of a watch target.
///
/// Created by the `watch` methods on
/// [`Client`](crate::client::Client) /
/// [`Database`](crate::client::Database) /
/// [`Collection`](crate::client::Collection).
pub struct ChangeStream {
    executor: Arc<Executor>,
    target: WatchTarget,
    stages: Vec<Bson>,
    options: ChangeStreamOptions,
    resume: ResumeState,
    cursor: Option<ChangeStreamCursor>,
    /// Terminal error; once set, every `next` returns it.
    error: Option<Error>,
    /// True between a resume and the next successful server round-trip.
    resumed_once_this_batch: bool,
}

impl ChangeStream {
    /// Opens the stream eagerly: the initial `aggregate` is issued here.
    ///
    /// A failed open is not returned as an error — the stream is created with
    /// the failure parked as its terminal error, so the caller inspects it
    /// through [`next`](Self::next) or [`error_document`](Self::error_document).
    pub(crate) async fn open(
        executor: Arc<Executor>,
        target: WatchTarget,
        stages: Vec<Bson>,
        options: ChangeStreamOptions,
    ) -> Self {
        let resume = ResumeState::from_options(&options);
        let mut stream = ChangeStream {
            executor,
            target,
            stages,
            options,
            resume,
            cursor: None,
            error: None,
            resumed_once_this_batch: false,
        };
        if let Err(err) = stream.initial_open().await {
            warn!(scope = %stream.target, error = %err, "change stream open failed");
            stream.park(err);
        }
        stream
    }

    async fn initial_open(&mut self) -> Result<(), Error> {
        let server = self
            .executor
            .select_server(self.selection_read_preference())
            .await?;
        let position = self.resume.initial_position();
        let command = build_aggregate(&self.target, &self.stages, &self.options, &position);
        let reply = self
            .executor
            .run(server, self.target.database(), command)
            .await?;

        if let Some(ts) = document::operation_time(&reply) {
            self.resume.record_operation_time(ts);
        }
        self.install_cursor(ChangeStreamCursor::from_reply(
            Arc::clone(&self.executor),
            server,
            &reply,
            self.options.clone(),
        )?);
        info!(scope = %self.target, "change stream opened");
        Ok(())
    }

    /// Pulls the next event document.
    ///
    /// Returns `Ok(Some(doc))` for a delivered event, `Ok(None)` when no
    /// event is available right now (the subscription stays live and the
    /// resume position is preserved), or the stream's terminal error.
    ///
    /// A resumable failure triggers one transparent resume and one retry; a
    /// second failure within the same call is surfaced verbatim.
    pub async fn next(&mut self) -> Result<Option<Document>, Error> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let err = match self.fetch().await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        let classified = classify(&err, self.wire_version());
        match classified {
            Resumption::Resume { kill_cursor } if !self.resumed_once_this_batch => {
                debug!(error = %err, kill_cursor, "resumable error; reopening cursor");
                if let Err(resume_err) = self.resume(kill_cursor).await {
                    return Err(self.park(resume_err));
                }
                self.resumed_once_this_batch = true;
                match self.fetch().await {
                    Ok(outcome) => Ok(outcome),
                    // Surfaced verbatim: the resume budget for this call is spent.
                    Err(second) => Err(self.park(second)),
                }
            }
            _ => {
                if let Resumption::Fatal { kill_cursor: true } = classified {
                    if let Some(cursor) = self.cursor.as_mut() {
                        cursor.kill().await;
                    }
                }
                Err(self.park(err))
            }
        }
    }

    /// One pull through the cursor adapter, with resume-state bookkeeping.
    async fn fetch(&mut self) -> Result<Option<Document>, Error> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        match cursor.next().await {
            Ok(Some(doc)) => {
                if let Some(token) = cursor.post_batch_token() {
                    self.resume.record_post_batch_token(token);
                }
                let Some(token) = document::resume_token(&doc).cloned() else {
                    return Err(Error::MissingResumeToken);
                };
                self.resume.record_document_token(token);
                self.resumed_once_this_batch = false;
                metrics::increment_events_delivered(self.target.database());
                Ok(Some(doc))
            }
            Ok(None) => {
                if let Some(token) = cursor.post_batch_token() {
                    self.resume.record_post_batch_token(token);
                }
                self.resumed_once_this_batch = false;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Drops the current cursor and reopens the subscription at the best
    /// known position, selecting a server with the original read preference.
    async fn resume(&mut self, kill_cursor: bool) -> Result<(), Error> {
        metrics::increment_resumes(self.target.database());
        let at_boundary = self.at_batch_boundary();
        if let Some(mut cursor) = self.cursor.take() {
            if kill_cursor {
                cursor.kill().await;
            }
            // Old cursor is gone before its replacement exists.
        }

        let server = self
            .executor
            .select_server(self.selection_read_preference())
            .await?;
        let position = self.resume.resume_position(at_boundary);
        let command = build_aggregate(&self.target, &self.stages, &self.options, &position);
        let reply = self
            .executor
            .run(server, self.target.database(), command)
            .await?;
        self.install_cursor(ChangeStreamCursor::from_reply(
            Arc::clone(&self.executor),
            server,
            &reply,
            self.options.clone(),
        )?);
        info!(scope = %self.target, "change stream resumed");
        Ok(())
    }

    fn install_cursor(&mut self, cursor: ChangeStreamCursor) {
        if let Some(token) = cursor.post_batch_token() {
            self.resume.record_post_batch_token(token);
        }
        self.cursor = Some(cursor);
    }

    /// Parks a terminal error on the stream and returns it for surfacing.
    fn park(&mut self, err: Error) -> Error {
        error!(scope = %self.target, error = %err, "change stream entered terminal error state");
        metrics::increment_stream_errors(self.target.database(), err.category());
        self.error = Some(err.clone());
        err
    }

    /// The most recent terminal error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The most recent terminal error together with the raw server reply that
    /// produced it, when one exists.
    ///
    /// Returns `None` when the stream is healthy, so callers can
    /// unconditionally overwrite whatever reply reference they held from a
    /// previous call.
    #[must_use]
    pub fn error_document(&self) -> Option<(&Error, Option<&Document>)> {
        self.error.as_ref().map(|err| (err, err.server_reply()))
    }

    /// The best resume token currently known, by the resume precedence:
    /// the post-batch token at a batch boundary, otherwise the token of the
    /// last delivered event, otherwise the caller-supplied token.
    ///
    /// Unchanged across `next` calls that deliver nothing.
    #[must_use]
    pub fn resume_token(&self) -> Option<&Document> {
        self.resume.token(self.at_batch_boundary())
    }

    /// Releases the server-side cursor (best effort) and consumes the stream.
    pub async fn destroy(mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.kill().await;
        }
    }

    /// The read preference the aggregate is selected with: the caller's,
    /// unless the pipeline writes. A `$out`/`$merge` stage must never run
    /// against a secondary, so those pipelines are forced onto a primary.
    fn selection_read_preference(&self) -> ReadPreference {
        if self.options.read_preference != ReadPreference::Primary
            && pipeline_has_write_key(&self.stages)
        {
            warn!(
                scope = %self.target,
                "$out or $merge stage specified; overriding read preference to primary"
            );
            return ReadPreference::Primary;
        }
        self.options.read_preference
    }

    fn at_batch_boundary(&self) -> bool {
        self.cursor
            .as_ref()
            .map_or(true, ChangeStreamCursor::at_batch_boundary)
    }

    fn wire_version(&self) -> i32 {
        self.cursor
            .as_ref()
            .map_or(0, |cursor| cursor.server().max_wire_version)
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("target", &self.target)
            .field("cursor_id", &self.cursor.as_ref().map(ChangeStreamCursor::id))
            .field("errored", &self.error.is_some())
            .field("resumed_once_this_batch", &self.resumed_once_this_batch)
            .finish()
    }
}
