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

//! The seam between the change stream core and the rest of a driver.
//!
//! The core does not speak to sockets. It selects a server against a
//! [`ReadPreference`] and round-trips document-shaped commands through the
//! [`Deployment`] trait; everything below that line (wire codec, topology
//! monitoring, connection pooling) belongs to the embedding driver. The
//! `bucatini-testkit` crate provides a scripted implementation for tests.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bson::Document;
use serde::{Deserialize, Serialize};

use crate::document;
use crate::error::Error;
use crate::observer::{
    CommandFailedEvent, CommandObserver, CommandStartedEvent, CommandSucceededEvent,
};

/// Identifier of one server within a deployment.
pub type ServerId = u32;

/// A selected server and the protocol capabilities it advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: ServerId,
    /// Highest wire version the server supports; gates which
    /// error-classification paths can trigger.
    pub max_wire_version: i32,
}

/// Which servers a command may be routed to.
///
/// A change stream remembers the preference it was opened with and reuses it
/// for every resume, so a secondary-preferred stream resumes on a secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreference {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred => "primaryPreferred",
            ReadPreference::Secondary => "secondary",
            ReadPreference::SecondaryPreferred => "secondaryPreferred",
            ReadPreference::Nearest => "nearest",
        }
    }
}

/// An opaque session handle, threaded into commands as `lsid`.
///
/// The stream references the session but does not own its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: Document,
}

impl Session {
    #[must_use]
    pub fn new(id: Document) -> Self {
        Session { id }
    }

    #[must_use]
    pub fn id(&self) -> &Document {
        &self.id
    }
}

/// Server selection plus document-shaped command round-trips.
///
/// `run_command` resolves to `Ok(reply)` for every reply the server produced,
/// including `ok: 0` failures; it returns `Err` only for client-local
/// conditions (connection drop, deadline expiry). Turning `ok: 0` replies
/// into [`Error::Server`] is the executor's job, so implementations stay a
/// thin transport.
#[async_trait]
pub trait Deployment: Send + Sync {
    /// Picks a server satisfying the read preference.
    async fn select_server(&self, read_preference: ReadPreference) -> Result<ServerInfo, Error>;

    /// Round-trips one command against a previously selected server.
    async fn run_command(
        &self,
        server: ServerInfo,
        database: &str,
        command: Document,
    ) -> Result<Document, Error>;
}

/// Runs commands through a [`Deployment`], notifying observers and lifting
/// `ok: 0` replies into [`Error::Server`].
pub(crate) struct Executor {
    deployment: Arc<dyn Deployment>,
    observers: RwLock<Vec<Arc<dyn CommandObserver>>>,
}

impl Executor {
    pub(crate) fn new(deployment: Arc<dyn Deployment>) -> Self {
        Executor {
            deployment,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, observer: Arc<dyn CommandObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    pub(crate) async fn select_server(
        &self,
        read_preference: ReadPreference,
    ) -> Result<ServerInfo, Error> {
        self.deployment.select_server(read_preference).await
    }

    pub(crate) async fn run(
        &self,
        server: ServerInfo,
        database: &str,
        command: Document,
    ) -> Result<Document, Error> {
        let command_name = command
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
            .to_string();
        self.notify(|observer| {
            observer.command_started(&CommandStartedEvent {
                command_name: &command_name,
                database,
                command: &command,
                server,
            });
        });

        let result = self
            .deployment
            .run_command(server, database, command)
            .await
            .and_then(|reply| {
                if document::reply_ok(&reply) {
                    Ok(reply)
                } else {
                    Err(Error::from_reply(reply))
                }
            });

        match &result {
            Ok(reply) => self.notify(|observer| {
                observer.command_succeeded(&CommandSucceededEvent {
                    command_name: &command_name,
                    reply,
                    server,
                });
            }),
            Err(error) => self.notify(|observer| {
                observer.command_failed(&CommandFailedEvent {
                    command_name: &command_name,
                    error,
                    server,
                });
            }),
        }
        result
    }

    fn notify(&self, mut f: impl FnMut(&Arc<dyn CommandObserver>)) {
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                f(observer);
            }
        }
    }
}
