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

//! Command monitoring.
//!
//! Zero or more [`CommandObserver`]s can be hung off a
//! [`Client`](crate::client::Client); each sees every command the client's
//! streams issue, one callback per phase. All methods default to no-ops so an
//! observer implements only the phases it cares about.

use bson::Document;

use crate::deployment::ServerInfo;
use crate::error::Error;

/// A command is about to be sent.
#[derive(Debug)]
pub struct CommandStartedEvent<'a> {
    pub command_name: &'a str,
    pub database: &'a str,
    pub command: &'a Document,
    pub server: ServerInfo,
}

/// The server replied with success.
#[derive(Debug)]
pub struct CommandSucceededEvent<'a> {
    pub command_name: &'a str,
    pub reply: &'a Document,
    pub server: ServerInfo,
}

/// The command failed — an `ok: 0` reply or a transport-level error.
#[derive(Debug)]
pub struct CommandFailedEvent<'a> {
    pub command_name: &'a str,
    pub error: &'a Error,
    pub server: ServerInfo,
}

/// Receives one callback per command phase.
pub trait CommandObserver: Send + Sync {
    fn command_started(&self, _event: &CommandStartedEvent<'_>) {}
    fn command_succeeded(&self, _event: &CommandSucceededEvent<'_>) {}
    fn command_failed(&self, _event: &CommandFailedEvent<'_>) {}
}
