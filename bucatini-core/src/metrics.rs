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

//! Change stream metrics, recorded through the `metrics` facade.
//!
//! The crate records; the embedding application chooses the exporter. Call
//! [`init_metrics`] once at startup to register descriptions with whatever
//! recorder is installed.

use metrics::{counter, describe_counter};

/// Total events delivered to callers.
///
/// Type: Counter
/// Labels: scope
const EVENTS_DELIVERED_TOTAL: &str = "bucatini_events_delivered_total";

/// Total resume attempts, successful or not.
///
/// Type: Counter
/// Labels: scope
const RESUMES_TOTAL: &str = "bucatini_resumes_total";

/// Total streams that reached a terminal error.
///
/// Type: Counter
/// Labels: scope, category
const STREAM_ERRORS_TOTAL: &str = "bucatini_stream_errors_total";

/// Registers metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_DELIVERED_TOTAL,
        "Total change events delivered to callers"
    );
    describe_counter!(
        RESUMES_TOTAL,
        "Total change stream resume attempts, successful or not"
    );
    describe_counter!(
        STREAM_ERRORS_TOTAL,
        "Total change streams that reached a terminal error"
    );
}

pub(crate) fn increment_events_delivered(scope: &str) {
    counter!(EVENTS_DELIVERED_TOTAL, "scope" => scope.to_string()).increment(1);
}

pub(crate) fn increment_resumes(scope: &str) {
    counter!(RESUMES_TOTAL, "scope" => scope.to_string()).increment(1);
}

pub(crate) fn increment_stream_errors(scope: &str, category: &'static str) {
    counter!(STREAM_ERRORS_TOTAL, "scope" => scope.to_string(), "category" => category)
        .increment(1);
}
