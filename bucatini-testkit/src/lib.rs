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

//! Scripted in-process deployment for change stream tests.
//!
//! [`MockDeployment`] implements
//! [`Deployment`](bucatini_core::deployment::Deployment) against a FIFO
//! script of expected commands and canned reactions. Tests enqueue the
//! conversation they expect, run the stream, then assert on the recorded
//! command log:
//!
//! ```rust
//! use bson::doc;
//! use bucatini_testkit::MockDeployment;
//!
//! let deployment = MockDeployment::new();
//! deployment.expect(
//!     "aggregate",
//!     doc! { "cursor": { "id": 123_i64, "ns": "db.coll", "firstBatch": [] }, "ok": 1 },
//! );
//! deployment.expect_hang_up("getMore");
//! ```
//!
//! A command that arrives with nothing scripted for it, or with a different
//! name than the script expects, panics the test with both sides of the
//! mismatch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::Document;
use bucatini_core::deployment::{Deployment, ReadPreference, ServerInfo};
use bucatini_core::error::Error;

/// Default wire version the mock advertises; new enough for post-batch
/// resume tokens and error labels.
pub const DEFAULT_WIRE_VERSION: i32 = 9;

/// One command the mock has been observed to receive.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
    pub database: String,
    pub command: Document,
}

impl RecordedCommand {
    /// The command's name: its first key.
    #[must_use]
    pub fn name(&self) -> &str {
        self.command
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

enum Reaction {
    Reply(Document),
    HangUp,
}

struct Exchange {
    expect: String,
    reaction: Reaction,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Exchange>,
    log: Vec<RecordedCommand>,
    selections: Vec<ReadPreference>,
    fail_selection: bool,
}

/// A deployment that follows a caller-provided script.
pub struct MockDeployment {
    server: ServerInfo,
    state: Mutex<MockState>,
}

impl MockDeployment {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_wire_version(DEFAULT_WIRE_VERSION)
    }

    #[must_use]
    pub fn with_wire_version(max_wire_version: i32) -> Arc<Self> {
        Arc::new(MockDeployment {
            server: ServerInfo {
                id: 1,
                max_wire_version,
            },
            state: Mutex::new(MockState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scripts a reply for the next command, which must be named `expect`.
    pub fn expect(&self, expect: &str, reply: Document) {
        self.state().script.push_back(Exchange {
            expect: expect.to_string(),
            reaction: Reaction::Reply(reply),
        });
    }

    /// Scripts a transport hang-up for the next command.
    pub fn expect_hang_up(&self, expect: &str) {
        self.state().script.push_back(Exchange {
            expect: expect.to_string(),
            reaction: Reaction::HangUp,
        });
    }

    /// Makes every subsequent server selection fail.
    pub fn fail_server_selection(&self) {
        self.state().fail_selection = true;
    }

    /// Every command received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state().log.clone()
    }

    /// The received commands with the given name, in order.
    #[must_use]
    pub fn commands_named(&self, name: &str) -> Vec<Document> {
        self.state()
            .log
            .iter()
            .filter(|recorded| recorded.name() == name)
            .map(|recorded| recorded.command.clone())
            .collect()
    }

    /// The read preference of every server selection performed so far.
    #[must_use]
    pub fn selections(&self) -> Vec<ReadPreference> {
        self.state().selections.clone()
    }

    /// Panics unless the whole script was consumed.
    pub fn assert_script_exhausted(&self) {
        let state = self.state();
        assert!(
            state.script.is_empty(),
            "mock script has {} unconsumed exchange(s); next expects {:?}",
            state.script.len(),
            state.script.front().map(|exchange| &exchange.expect),
        );
    }
}

#[async_trait]
impl Deployment for MockDeployment {
    async fn select_server(&self, read_preference: ReadPreference) -> Result<ServerInfo, Error> {
        let mut state = self.state();
        state.selections.push(read_preference);
        if state.fail_selection {
            return Err(Error::ServerSelection(
                "no suitable servers found".to_string(),
            ));
        }
        Ok(self.server)
    }

    async fn run_command(
        &self,
        _server: ServerInfo,
        database: &str,
        command: Document,
    ) -> Result<Document, Error> {
        let mut state = self.state();
        let recorded = RecordedCommand {
            database: database.to_string(),
            command,
        };
        let name = recorded.name().to_string();
        state.log.push(recorded);

        let Some(exchange) = state.script.pop_front() else {
            panic!("received {name:?} but the mock script is empty");
        };
        assert_eq!(
            exchange.expect, name,
            "mock script expected {:?} but received {:?}",
            exchange.expect, name
        );
        match exchange.reaction {
            Reaction::Reply(reply) => Ok(reply),
            Reaction::HangUp => Err(Error::Transport("connection closed".to_string())),
        }
    }
}

/// Installs a test-friendly tracing subscriber; repeated calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
