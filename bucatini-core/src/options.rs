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

//! Change stream configuration.
//!
//! Options are assembled with a builder and handed to one of the `watch`
//! entry points:
//!
//! ```rust
//! use bson::doc;
//! use bucatini_core::options::ChangeStreamOptions;
//!
//! let options = ChangeStreamOptions::builder()
//!     .full_document_update_lookup()
//!     .batch_size(100)
//!     .max_await_time_ms(5_000)
//!     .collation(doc! { "locale": "en" })
//!     .build()
//!     .unwrap();
//! assert_eq!(options.batch_size, Some(100));
//! ```
//!
//! Where an option maps onto a wire field, the field is noted on the struct
//! member. Resume selectors (`resume_after`, `start_after`,
//! `start_at_operation_time`) are forwarded verbatim on the initial
//! `aggregate` — all of them, if the caller supplied several; the server
//! arbitrates conflicts.

use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

use crate::deployment::{ReadPreference, Session};
use crate::error::Error;

/// What the server should place in an update event's `fullDocument` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocumentType {
    /// Only the changed fields, as the server saw them.
    #[default]
    Default,
    /// The server looks up and attaches the current full document.
    UpdateLookup,
}

impl FullDocumentType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FullDocumentType::Default => "default",
            FullDocumentType::UpdateLookup => "updateLookup",
        }
    }
}

/// Options accepted by every `watch` entry point.
#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    /// `$changeStream.fullDocument`.
    pub full_document: FullDocumentType,

    /// `$changeStream.resumeAfter`: resume exclusive-after this token.
    pub resume_after: Option<Document>,

    /// `$changeStream.startAfter`: like `resume_after`, but also valid after
    /// an invalidate event.
    pub start_after: Option<Document>,

    /// `$changeStream.startAtOperationTime`: start from a cluster timestamp.
    pub start_at_operation_time: Option<Timestamp>,

    /// Forwarded to each `getMore` as `maxTimeMS` (never to `aggregate`).
    pub max_await_time_ms: Option<u64>,

    /// `cursor.batchSize` on `aggregate` and `batchSize` on `getMore`.
    pub batch_size: Option<u32>,

    /// Top-level `collation` on `aggregate`.
    pub collation: Option<Document>,

    /// Top-level `readConcern` on `aggregate`.
    pub read_concern: Option<Document>,

    /// Top-level `writeConcern` on `aggregate` — only attached when the user
    /// pipeline ends in a write stage, per the aggregate contract.
    pub write_concern: Option<Document>,

    /// Governs server selection for the open and for every resume.
    pub read_preference: ReadPreference,

    /// Session to thread through as `lsid`.
    pub session: Option<Session>,
}

impl ChangeStreamOptions {
    #[must_use]
    pub fn builder() -> ChangeStreamOptionsBuilder {
        ChangeStreamOptionsBuilder::default()
    }
}

/// Builder for [`ChangeStreamOptions`].
#[derive(Debug, Default)]
pub struct ChangeStreamOptionsBuilder {
    options: ChangeStreamOptions,
}

impl ChangeStreamOptionsBuilder {
    /// Requests `fullDocument: "updateLookup"` on update events.
    #[must_use]
    pub fn full_document_update_lookup(mut self) -> Self {
        self.options.full_document = FullDocumentType::UpdateLookup;
        self
    }

    #[must_use]
    pub fn resume_after(mut self, token: Document) -> Self {
        self.options.resume_after = Some(token);
        self
    }

    #[must_use]
    pub fn start_after(mut self, token: Document) -> Self {
        self.options.start_after = Some(token);
        self
    }

    #[must_use]
    pub fn start_at_operation_time(mut self, timestamp: Timestamp) -> Self {
        self.options.start_at_operation_time = Some(timestamp);
        self
    }

    /// How long each `getMore` may await new events, in milliseconds.
    #[must_use]
    pub fn max_await_time_ms(mut self, ms: u64) -> Self {
        self.options.max_await_time_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.options.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn collation(mut self, collation: Document) -> Self {
        self.options.collation = Some(collation);
        self
    }

    #[must_use]
    pub fn read_concern(mut self, read_concern: Document) -> Self {
        self.options.read_concern = Some(read_concern);
        self
    }

    #[must_use]
    pub fn write_concern(mut self, write_concern: Document) -> Self {
        self.options.write_concern = Some(write_concern);
        self
    }

    #[must_use]
    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.options.read_preference = read_preference;
        self
    }

    #[must_use]
    pub fn session(mut self, session: Session) -> Self {
        self.options.session = Some(session);
        self
    }

    /// Builds the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when a numeric option does not fit
    /// its wire field (`batchSize` and `maxTimeMS` are 32-bit on the wire).
    pub fn build(self) -> Result<ChangeStreamOptions, Error> {
        if let Some(size) = self.options.batch_size {
            if size > i32::MAX as u32 {
                return Err(Error::InvalidArgument(format!(
                    "batch_size ({size}) exceeds the wire maximum of {}",
                    i32::MAX
                )));
            }
        }
        if let Some(ms) = self.options.max_await_time_ms {
            if ms > i32::MAX as u64 {
                return Err(Error::InvalidArgument(format!(
                    "max_await_time_ms ({ms}) exceeds the wire maximum of {}",
                    i32::MAX
                )));
            }
        }
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_default_options() {
        let options = ChangeStreamOptions::default();
        assert_eq!(options.full_document, FullDocumentType::Default);
        assert!(options.resume_after.is_none());
        assert!(options.start_after.is_none());
        assert!(options.start_at_operation_time.is_none());
        assert!(options.batch_size.is_none());
        assert_eq!(options.read_preference, ReadPreference::Primary);
    }

    #[test]
    fn test_builder_round_trip() {
        let options = ChangeStreamOptions::builder()
            .full_document_update_lookup()
            .resume_after(doc! { "resume": "after" })
            .start_after(doc! { "start": "after" })
            .start_at_operation_time(Timestamp { time: 1, increment: 1 })
            .max_await_time_ms(5_000)
            .batch_size(5)
            .collation(doc! { "locale": "en" })
            .read_preference(ReadPreference::SecondaryPreferred)
            .build()
            .unwrap();

        assert_eq!(options.full_document, FullDocumentType::UpdateLookup);
        assert_eq!(options.resume_after, Some(doc! { "resume": "after" }));
        assert_eq!(options.start_after, Some(doc! { "start": "after" }));
        assert_eq!(options.max_await_time_ms, Some(5_000));
        assert_eq!(options.batch_size, Some(5));
        assert_eq!(options.read_preference, ReadPreference::SecondaryPreferred);
    }

    #[test]
    fn test_builder_rejects_oversized_wire_fields() {
        let err = ChangeStreamOptions::builder()
            .max_await_time_ms(u64::from(u32::MAX))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_full_document_wire_names() {
        assert_eq!(FullDocumentType::Default.as_str(), "default");
        assert_eq!(FullDocumentType::UpdateLookup.as_str(), "updateLookup");
    }
}
