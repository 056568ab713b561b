// Copyright 2024, The Hermes Authors
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

//! Shared data model of the hermes connectivity runtime: connections,
//! signals, external messages, headers and the metrics DTOs exchanged
//! between the connectivity clients and the rest of the system.

#![deny(clippy::all, clippy::unwrap_used, clippy::pedantic)]

use std::sync::atomic::{AtomicUsize, Ordering};

/// Connection configuration
pub mod connection;
/// Protocol-agnostic representation of wire messages
pub mod external;
/// The internal header bag attached to every signal
pub mod headers;
/// Metrics DTOs for connection-metrics queries
pub mod metrics;
/// Signals, acknowledgements and message commands/responses
pub mod signal;

/// Default channel capacity
static QSIZE: AtomicUsize = AtomicUsize::new(128);

/// Default channel capacity used for mailboxes and internal queues
#[must_use]
pub fn qsize() -> usize {
    QSIZE.load(Ordering::Relaxed)
}
