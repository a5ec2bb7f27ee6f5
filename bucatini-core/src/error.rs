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

//! Error types and the resumability classifier.
//!
//! A change stream survives most failures by reissuing its `aggregate` with a
//! resume selector, but a handful of conditions make that recovery incorrect
//! (the server interrupted the operation, the capped collection position is
//! gone, the cursor was deliberately killed). [`classify`] maps every error
//! the stream can observe onto a [`Resumption`] decision.
//!
//! The classifier is pure and table-driven: the non-resumable code denylist
//! and its kill-cursor flags live in [`NON_RESUMABLE_CODES`] so the decision
//! procedure and its tests enumerate the same data.

use bson::Document;
use thiserror::Error as ThisError;

use crate::document;

/// Errors surfaced by change stream operations.
///
/// The type is `Clone` because a stream that fails terminally stores the
/// error and returns it from every subsequent call.
#[derive(Debug, Clone, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// The server replied `ok: 0`.
    ///
    /// `code` is `0` when the reply carried no numeric code; `reply` is the
    /// raw document for callers that need to inspect it.
    #[error("server error (code {code}): {message}")]
    Server {
        code: i32,
        message: String,
        labels: Vec<String>,
        reply: Document,
    },

    /// The connection dropped or timed out mid-command.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No server satisfying the read preference could be selected.
    #[error("server selection failed: {0}")]
    ServerSelection(String),

    /// A delivered event had no document-typed `_id` field.
    #[error("Cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    /// A caller-supplied option was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reply was structurally unusable (e.g. `aggregate` without a cursor).
    #[error("invalid reply: {0}")]
    Bson(String),
}

impl Error {
    /// Builds a [`Error::Server`] from a failed reply document.
    pub(crate) fn from_reply(reply: Document) -> Self {
        Error::Server {
            code: document::error_code(&reply).unwrap_or(0),
            message: document::error_message(&reply).unwrap_or_default().to_string(),
            labels: document::error_labels(&reply),
            reply,
        }
    }

    /// The server error code, if this is a server error that carried one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Server { code, .. } if *code != 0 => Some(*code),
            _ => None,
        }
    }

    /// The raw server reply, when one exists.
    #[must_use]
    pub fn server_reply(&self) -> Option<&Document> {
        match self {
            Error::Server { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Error::Server { .. } => "server",
            Error::Transport(_) => "transport",
            Error::ServerSelection(_) => "server_selection",
            Error::MissingResumeToken => "missing_resume_token",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Bson(_) => "bson",
        }
    }
}

/// What the stream should do about an observed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// Reissue the `aggregate` with a resume selector.
    ///
    /// `kill_cursor` is set when the server-side cursor is presumed alive and
    /// a best-effort `killCursors` should precede the new `aggregate`.
    Resume { kill_cursor: bool },

    /// Recovery cannot be correct; the error is terminal for the stream.
    ///
    /// `kill_cursor` marks the rare fatal condition after which the server
    /// still holds a live cursor worth releasing.
    Fatal { kill_cursor: bool },
}

impl Resumption {
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(self, Resumption::Resume { .. })
    }

    #[must_use]
    pub fn kills_cursor(&self) -> bool {
        match self {
            Resumption::Resume { kill_cursor } | Resumption::Fatal { kill_cursor } => *kill_cursor,
        }
    }
}

struct DenyListed {
    code: i32,
    kill_cursor: bool,
}

/// Server error codes after which a resume would silently lose or replay
/// events. `kill_cursor` records whether the server-side cursor outlives the
/// error and deserves a best-effort `killCursors`.
const NON_RESUMABLE_CODES: &[DenyListed] = &[
    // Interrupted: the operation was killed server-side.
    DenyListed { code: 11601, kill_cursor: false },
    // CappedPositionLost: the oplog position fell off the capped collection.
    DenyListed { code: 136, kill_cursor: true },
    // CursorKilled: someone already released the cursor.
    DenyListed { code: 237, kill_cursor: false },
];

/// Error label that marks a server error as non-resumable regardless of code.
pub const NON_RESUMABLE_LABEL: &str = "NonResumableChangeStreamError";

/// Minimum wire version whose replies carry `errorLabels`.
pub const WIRE_VERSION_ERROR_LABELS: i32 = 8;

/// Classifies an error observed while iterating a change stream.
///
/// Rules, evaluated in order:
///
/// 1. server selection failed → fatal;
/// 2. the transport dropped (hang-up, deadline) → resumable, no `killCursors`
///    (the socket the cursor lived on is gone);
/// 3. a codeless reply whose message contains `"not master"` or
///    `"node is recovering"` → resumable, no `killCursors`;
/// 4. a code on the non-resumable denylist, or a reply labeled
///    [`NON_RESUMABLE_LABEL`] by a server that exposes labels → fatal;
/// 5. any other non-zero code → resumable, with `killCursors` first;
/// 6. everything else (codeless replies with unrecognized messages,
///    client-local decoding failures) → fatal.
#[must_use]
pub fn classify(error: &Error, max_wire_version: i32) -> Resumption {
    match error {
        Error::ServerSelection(_) => Resumption::Fatal { kill_cursor: false },
        Error::Transport(_) => Resumption::Resume { kill_cursor: false },
        Error::Server {
            code,
            message,
            labels,
            ..
        } => {
            if *code == 0 {
                if message.contains("not master") || message.contains("node is recovering") {
                    Resumption::Resume { kill_cursor: false }
                } else {
                    Resumption::Fatal { kill_cursor: false }
                }
            } else if let Some(denied) = NON_RESUMABLE_CODES.iter().find(|d| d.code == *code) {
                Resumption::Fatal {
                    kill_cursor: denied.kill_cursor,
                }
            } else if max_wire_version >= WIRE_VERSION_ERROR_LABELS
                && labels.iter().any(|label| label == NON_RESUMABLE_LABEL)
            {
                Resumption::Fatal { kill_cursor: false }
            } else {
                Resumption::Resume { kill_cursor: true }
            }
        }
        _ => Resumption::Fatal { kill_cursor: false },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn server_error(reply: Document) -> Error {
        Error::from_reply(reply)
    }

    #[test]
    fn test_coded_errors_resume_and_kill() {
        for code in [1, 6, 10107, 12345] {
            let err = server_error(doc! { "ok": 0, "code": code, "errmsg": "boom" });
            assert_eq!(
                classify(&err, 8),
                Resumption::Resume { kill_cursor: true },
                "code {code}"
            );
        }
    }

    #[test]
    fn test_denylisted_codes_are_fatal() {
        let interrupted = server_error(doc! { "ok": 0, "code": 11601, "errmsg": "interrupted" });
        assert_eq!(
            classify(&interrupted, 8),
            Resumption::Fatal { kill_cursor: false }
        );

        let capped =
            server_error(doc! { "ok": 0, "code": 136, "errmsg": "capped position lost" });
        assert_eq!(
            classify(&capped, 8),
            Resumption::Fatal { kill_cursor: true }
        );

        let killed = server_error(doc! { "ok": 0, "code": 237, "errmsg": "cursor killed" });
        assert_eq!(
            classify(&killed, 8),
            Resumption::Fatal { kill_cursor: false }
        );
    }

    #[test]
    fn test_codeless_stepdown_messages_resume_without_kill() {
        let not_master = server_error(doc! { "ok": 0, "errmsg": "not master" });
        assert_eq!(
            classify(&not_master, 8),
            Resumption::Resume { kill_cursor: false }
        );

        let recovering = server_error(doc! { "ok": 0, "errmsg": "node is recovering" });
        assert_eq!(
            classify(&recovering, 8),
            Resumption::Resume { kill_cursor: false }
        );

        let unknown = server_error(doc! { "ok": 0, "errmsg": "random error" });
        assert_eq!(
            classify(&unknown, 8),
            Resumption::Fatal { kill_cursor: false }
        );
    }

    #[test]
    fn test_non_resumable_label_gated_on_wire_version() {
        let labeled = server_error(doc! {
            "ok": 0,
            "code": 280,
            "errmsg": "resume point no longer in oplog",
            "errorLabels": [NON_RESUMABLE_LABEL],
        });
        assert_eq!(
            classify(&labeled, WIRE_VERSION_ERROR_LABELS),
            Resumption::Fatal { kill_cursor: false }
        );
        // Older protocols do not expose labels; the code alone decides.
        assert_eq!(
            classify(&labeled, WIRE_VERSION_ERROR_LABELS - 1),
            Resumption::Resume { kill_cursor: true }
        );
    }

    #[test]
    fn test_transport_and_selection() {
        let hangup = Error::Transport("connection reset".into());
        assert_eq!(
            classify(&hangup, 8),
            Resumption::Resume { kill_cursor: false }
        );

        let selection = Error::ServerSelection("no suitable servers".into());
        assert_eq!(
            classify(&selection, 8),
            Resumption::Fatal { kill_cursor: false }
        );
    }

    #[test]
    fn test_client_local_errors_are_fatal() {
        assert_eq!(
            classify(&Error::MissingResumeToken, 8),
            Resumption::Fatal { kill_cursor: false }
        );
        assert_eq!(
            classify(&Error::Bson("truncated".into()), 8),
            Resumption::Fatal { kill_cursor: false }
        );
    }

    #[test]
    fn test_from_reply_extracts_fields() {
        let err = Error::from_reply(doc! {
            "ok": 0,
            "code": 10107,
            "errmsg": "not master",
            "errorLabels": ["RetryableWriteError"],
        });
        match &err {
            Error::Server {
                code,
                message,
                labels,
                reply,
            } => {
                assert_eq!(*code, 10107);
                assert_eq!(message, "not master");
                assert_eq!(labels, &vec!["RetryableWriteError".to_string()]);
                assert!(reply.get("code").is_some());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(err.code(), Some(10107));
        assert!(err.server_reply().is_some());
    }
}
