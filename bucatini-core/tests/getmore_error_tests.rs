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

//! How the stream reacts to failing `getMore`s: which errors trigger a
//! resume, which release the cursor first, which are terminal, and how the
//! one-resume-per-call budget behaves.

use std::sync::Arc;

use bson::{doc, Document};
use bucatini_core::client::Client;
use bucatini_core::deployment::ReadPreference;
use bucatini_core::error::Error;
use bucatini_core::options::ChangeStreamOptions;
use bucatini_core::stream::ChangeStream;
use bucatini_testkit::{init_test_logging, MockDeployment};

fn empty_cursor_reply(id: i64) -> Document {
    doc! { "cursor": { "id": id, "ns": "db.coll", "firstBatch": [] }, "ok": 1 }
}

async fn open_stream(deployment: &Arc<MockDeployment>) -> ChangeStream {
    open_stream_with(deployment, ChangeStreamOptions::default()).await
}

async fn open_stream_with(
    deployment: &Arc<MockDeployment>,
    options: ChangeStreamOptions,
) -> ChangeStream {
    init_test_logging();
    let client = Client::new(Arc::clone(deployment) as Arc<dyn bucatini_core::Deployment>);
    let stream = client
        .database("db")
        .collection("coll")
        .watch(doc! {}, options)
        .await;
    assert!(
        stream.error_document().is_none(),
        "open failed: {:?}",
        stream.error()
    );
    stream
}

/// The mock conversation of one failing `getMore`, in the shape of the
/// classifier contract: `should_resume` says whether an `aggregate` retry
/// follows, `kills_cursor` whether a `killCursors` precedes it.
async fn check_get_more_error(
    deployment: Arc<MockDeployment>,
    server_reply: Document,
    should_resume: bool,
    kills_cursor: bool,
) {
    deployment.expect("aggregate", empty_cursor_reply(123));
    deployment.expect("getMore", server_reply.clone());
    if should_resume {
        if kills_cursor {
            deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
        }
        deployment.expect(
            "aggregate",
            doc! {
                "cursor": {
                    "id": 124_i64,
                    "ns": "db.coll",
                    "firstBatch": [{ "_id": { "resume": "doc" }, "operationType": "insert" }],
                },
                "ok": 1,
            },
        );
    } else if kills_cursor {
        deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
    }

    let mut stream = open_stream(&deployment).await;
    if should_resume {
        let event = stream.next().await.unwrap().expect("resumed delivery");
        assert_eq!(event.get_document("_id").unwrap(), &doc! { "resume": "doc" });
        assert!(stream.error_document().is_none());
    } else {
        let err = stream.next().await.unwrap_err();
        let (reported, reply) = stream.error_document().expect("terminal error");
        assert_eq!(reported.to_string(), err.to_string());
        assert_eq!(reply, Some(&server_reply));
    }
    deployment.assert_script_exhausted();
}

#[tokio::test]
async fn test_coded_errors_resume_after_killing_cursor() {
    for code in [1, 6, 10107, 12345] {
        check_get_more_error(
            MockDeployment::new(),
            doc! { "ok": 0, "code": code, "errmsg": "some failure" },
            true,
            true,
        )
        .await;
    }
}

#[tokio::test]
async fn test_interrupted_is_terminal() {
    check_get_more_error(
        MockDeployment::new(),
        doc! { "ok": 0, "code": 11601, "errmsg": "interrupted" },
        false,
        false,
    )
    .await;
}

#[tokio::test]
async fn test_capped_position_lost_is_terminal_but_releases_cursor() {
    check_get_more_error(
        MockDeployment::new(),
        doc! { "ok": 0, "code": 136, "errmsg": "capped position lost" },
        false,
        true,
    )
    .await;
}

#[tokio::test]
async fn test_cursor_killed_is_terminal() {
    check_get_more_error(
        MockDeployment::new(),
        doc! { "ok": 0, "code": 237, "errmsg": "cursor killed" },
        false,
        false,
    )
    .await;
}

#[tokio::test]
async fn test_codeless_stepdown_messages_resume_without_kill() {
    for errmsg in ["not master", "node is recovering"] {
        check_get_more_error(
            MockDeployment::new(),
            doc! { "ok": 0, "errmsg": errmsg },
            true,
            false,
        )
        .await;
    }
}

#[tokio::test]
async fn test_codeless_unknown_message_is_terminal() {
    check_get_more_error(
        MockDeployment::new(),
        doc! { "ok": 0, "errmsg": "random error" },
        false,
        false,
    )
    .await;
}

#[tokio::test]
async fn test_non_resumable_label_is_terminal_when_labels_supported() {
    check_get_more_error(
        MockDeployment::new(),
        doc! {
            "ok": 0,
            "code": 280,
            "errmsg": "resume point no longer in oplog",
            "errorLabels": ["NonResumableChangeStreamError"],
        },
        false,
        false,
    )
    .await;
}

#[tokio::test]
async fn test_non_resumable_label_ignored_on_old_wire_versions() {
    check_get_more_error(
        MockDeployment::with_wire_version(7),
        doc! {
            "ok": 0,
            "code": 280,
            "errmsg": "resume point no longer in oplog",
            "errorLabels": ["NonResumableChangeStreamError"],
        },
        true,
        true,
    )
    .await;
}

/// Transport hang-up mid-`getMore`: resume without `killCursors`, reusing the
/// operation time captured from the initial reply.
#[tokio::test]
async fn test_hang_up_resumes_with_initial_operation_time() {
    let deployment = MockDeployment::new();
    let operation_time = bson::Timestamp { time: 4, increment: 5 };
    deployment.expect(
        "aggregate",
        doc! {
            "cursor": { "id": 123_i64, "ns": "db.coll", "firstBatch": [] },
            "operationTime": operation_time,
            "ok": 1,
        },
    );
    deployment.expect_hang_up("getMore");
    deployment.expect("aggregate", empty_cursor_reply(124));
    deployment.expect("getMore", doc! { "cursor": { "nextBatch": [] }, "ok": 1 });

    let mut stream = open_stream(&deployment).await;
    assert_eq!(stream.next().await.unwrap(), None);
    assert!(stream.error_document().is_none());

    let aggregates = deployment.commands_named("aggregate");
    assert_eq!(aggregates.len(), 2);
    let stage = aggregates[1].get_array("pipeline").unwrap()[0]
        .as_document()
        .unwrap()
        .get_document("$changeStream")
        .unwrap();
    assert_eq!(
        stage,
        &doc! { "fullDocument": "default", "startAtOperationTime": operation_time }
    );
    // No killCursors: the connection the cursor lived on is gone.
    assert!(deployment.commands_named("killCursors").is_empty());
    deployment.assert_script_exhausted();
}

/// One resume per `next`: a second error within the same call is surfaced
/// verbatim, even though code 11601 arrives on a brand-new cursor.
#[tokio::test]
async fn test_second_error_in_same_call_surfaces_verbatim() {
    let deployment = MockDeployment::new();
    deployment.expect("aggregate", empty_cursor_reply(123));
    deployment.expect("getMore", doc! { "ok": 0, "code": 10107, "errmsg": "not master" });
    deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
    deployment.expect("aggregate", empty_cursor_reply(125));
    deployment.expect("getMore", doc! { "ok": 0, "code": 11601, "errmsg": "interrupted" });

    let mut stream = open_stream(&deployment).await;
    let err = stream.next().await.unwrap_err();
    assert_eq!(err.code(), Some(11601));
    assert!(err.to_string().contains("interrupted"));

    let (_, reply) = stream.error_document().expect("terminal error");
    assert_eq!(
        reply,
        Some(&doc! { "ok": 0, "code": 11601, "errmsg": "interrupted" })
    );
    deployment.assert_script_exhausted();
}

/// Even a second *resumable* error is surfaced once the budget is spent.
#[tokio::test]
async fn test_single_resume_budget_per_call() {
    let deployment = MockDeployment::new();
    deployment.expect("aggregate", empty_cursor_reply(123));
    deployment.expect("getMore", doc! { "ok": 0, "code": 10107, "errmsg": "not master" });
    deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
    deployment.expect("aggregate", empty_cursor_reply(125));
    deployment.expect("getMore", doc! { "ok": 0, "code": 10107, "errmsg": "not master" });

    let mut stream = open_stream(&deployment).await;
    let err = stream.next().await.unwrap_err();
    assert_eq!(err.code(), Some(10107));

    // Terminal: the error repeats without further wire traffic.
    let commands_before = deployment.commands().len();
    let again = stream.next().await.unwrap_err();
    assert_eq!(again.code(), Some(10107));
    assert_eq!(deployment.commands().len(), commands_before);
    deployment.assert_script_exhausted();
}

/// A successful (even empty) `getMore` re-arms the resume budget, so each
/// poll may recover from one failure.
#[tokio::test]
async fn test_successful_get_more_rearms_resume_budget() {
    let deployment = MockDeployment::new();
    deployment.expect("aggregate", empty_cursor_reply(123));
    // First poll: failure, resume, empty success.
    deployment.expect("getMore", doc! { "ok": 0, "code": 6, "errmsg": "host unreachable" });
    deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
    deployment.expect("aggregate", empty_cursor_reply(124));
    deployment.expect("getMore", doc! { "cursor": { "nextBatch": [] }, "ok": 1 });
    // Second poll: another failure is again recoverable.
    deployment.expect("getMore", doc! { "ok": 0, "code": 6, "errmsg": "host unreachable" });
    deployment.expect("killCursors", doc! { "cursorsKilled": [124_i64], "ok": 1 });
    deployment.expect("aggregate", empty_cursor_reply(125));
    deployment.expect("getMore", doc! { "cursor": { "nextBatch": [] }, "ok": 1 });

    let mut stream = open_stream(&deployment).await;
    assert_eq!(stream.next().await.unwrap(), None);
    assert_eq!(stream.next().await.unwrap(), None);
    assert!(stream.error_document().is_none());
    assert_eq!(deployment.commands_named("aggregate").len(), 3);
    deployment.assert_script_exhausted();
}

/// A failure of the resume's own `aggregate` is terminal.
#[tokio::test]
async fn test_failed_resume_aggregate_is_terminal() {
    let deployment = MockDeployment::new();
    deployment.expect("aggregate", empty_cursor_reply(123));
    deployment.expect("getMore", doc! { "ok": 0, "code": 10107, "errmsg": "not master" });
    deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
    deployment.expect("aggregate", doc! { "ok": 0, "code": 123, "errmsg": "bad cmd" });

    let mut stream = open_stream(&deployment).await;
    let err = stream.next().await.unwrap_err();
    assert_eq!(err.code(), Some(123));
    assert!(err.to_string().contains("bad cmd"));
    assert!(stream.error_document().is_some());
    deployment.assert_script_exhausted();
}

/// The post-batch token outranks caller options and the operation time when
/// the cursor dies before anything was delivered.
#[tokio::test]
async fn test_post_batch_token_wins_on_resume() {
    let deployment = MockDeployment::new();
    deployment.expect(
        "aggregate",
        doc! {
            "cursor": {
                "id": 123_i64,
                "ns": "db.coll",
                "firstBatch": [],
                "postBatchResumeToken": { "resume": "pbr" },
            },
            "operationTime": bson::Timestamp { time: 1, increment: 2 },
            "ok": 1,
        },
    );
    deployment.expect("getMore", doc! { "ok": 0, "code": 43, "errmsg": "cursor not found" });
    deployment.expect("killCursors", doc! { "cursorsKilled": [123_i64], "ok": 1 });
    deployment.expect("aggregate", empty_cursor_reply(124));
    deployment.expect("getMore", doc! { "cursor": { "nextBatch": [] }, "ok": 1 });

    let options = ChangeStreamOptions::builder()
        .resume_after(doc! { "resume": "opt" })
        .build()
        .unwrap();
    let mut stream = open_stream_with(&deployment, options).await;
    assert_eq!(stream.next().await.unwrap(), None);

    let aggregates = deployment.commands_named("aggregate");
    let stage = aggregates[1].get_array("pipeline").unwrap()[0]
        .as_document()
        .unwrap()
        .get_document("$changeStream")
        .unwrap();
    assert_eq!(
        stage,
        &doc! { "fullDocument": "default", "resumeAfter": { "resume": "pbr" } }
    );
    deployment.assert_script_exhausted();
}

/// An event with its `_id` projected away is terminal; no resume could ever
/// be correct.
#[tokio::test]
async fn test_missing_resume_token_is_terminal() {
    let deployment = MockDeployment::new();
    deployment.expect(
        "aggregate",
        doc! {
            "cursor": {
                "id": 123_i64,
                "ns": "db.coll",
                "firstBatch": [{ "operationType": "insert" }],
            },
            "ok": 1,
        },
    );

    let mut stream = open_stream(&deployment).await;
    let err = stream.next().await.unwrap_err();
    assert!(matches!(err, Error::MissingResumeToken));
    assert!(err
        .to_string()
        .contains("Cannot provide resume functionality"));

    // No resume was attempted, no cursor was killed.
    assert_eq!(deployment.commands().len(), 1);
    assert!(stream.error_document().is_some());
}

/// Errors during the initial open are sticky; no resume is ever attempted
/// for them.
#[tokio::test]
async fn test_open_failure_is_sticky() {
    let deployment = MockDeployment::new();
    deployment.expect(
        "aggregate",
        doc! { "ok": 0, "code": 40573, "errmsg": "The $changeStream stage is only supported on replica sets" },
    );

    init_test_logging();
    let client = Client::new(Arc::clone(&deployment) as Arc<dyn bucatini_core::Deployment>);
    let mut stream = client
        .database("db")
        .collection("coll")
        .watch(doc! {}, ChangeStreamOptions::default())
        .await;

    let (err, reply) = stream.error_document().expect("open error is parked");
    assert_eq!(err.code(), Some(40573));
    assert!(reply.is_some());

    let err = stream.next().await.unwrap_err();
    assert_eq!(err.code(), Some(40573));
    // Still exactly one command: no resume, no getMore.
    assert_eq!(deployment.commands().len(), 1);
}

#[tokio::test]
async fn test_server_selection_failure_is_fatal() {
    let deployment = MockDeployment::new();
    deployment.fail_server_selection();

    init_test_logging();
    let client = Client::new(Arc::clone(&deployment) as Arc<dyn bucatini_core::Deployment>);
    let mut stream = client
        .database("db")
        .collection("coll")
        .watch(doc! {}, ChangeStreamOptions::default())
        .await;

    let err = stream.next().await.unwrap_err();
    assert!(matches!(err, Error::ServerSelection(_)));
    assert!(deployment.commands().is_empty());
}

/// Resume re-selects with the stream's original read preference.
#[tokio::test]
async fn test_resume_reuses_original_read_preference() {
    let deployment = MockDeployment::new();
    deployment.expect("aggregate", empty_cursor_reply(123));
    deployment.expect_hang_up("getMore");
    deployment.expect("aggregate", empty_cursor_reply(124));
    deployment.expect("getMore", doc! { "cursor": { "nextBatch": [] }, "ok": 1 });

    let options = ChangeStreamOptions::builder()
        .read_preference(ReadPreference::SecondaryPreferred)
        .build()
        .unwrap();
    let mut stream = open_stream_with(&deployment, options).await;
    assert_eq!(stream.next().await.unwrap(), None);

    assert_eq!(
        deployment.selections(),
        vec![
            ReadPreference::SecondaryPreferred,
            ReadPreference::SecondaryPreferred,
        ]
    );
    deployment.assert_script_exhausted();
}

/// `killCursors` failures during destroy are swallowed.
#[tokio::test]
async fn test_destroy_swallows_kill_cursors_failure() {
    let deployment = MockDeployment::new();
    deployment.expect("aggregate", empty_cursor_reply(123));
    deployment.expect("killCursors", doc! { "ok": 0, "errmsg": "already gone" });

    let stream = open_stream(&deployment).await;
    stream.destroy().await;
    deployment.assert_script_exhausted();
}
