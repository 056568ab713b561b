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

use std::borrow::Cow;
use std::collections::BTreeMap;

/// Payload of an external message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No payload
    Empty,
    /// A textual payload
    Text(String),
    /// A binary payload
    Bytes(Vec<u8>),
}

/// Protocol-agnostic representation of wire bytes with headers.
///
/// This is what transports hand to the mapper on the way in and what the
/// mapper hands to publishers on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMessage {
    headers: BTreeMap<String, String>,
    payload: Payload,
}

impl ExternalMessage {
    /// A message with a textual payload
    #[must_use]
    pub fn text(headers: BTreeMap<String, String>, body: impl Into<String>) -> Self {
        Self {
            headers,
            payload: Payload::Text(body.into()),
        }
    }

    /// A message with a binary payload
    #[must_use]
    pub fn bytes(headers: BTreeMap<String, String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            payload: Payload::Bytes(body.into()),
        }
    }

    /// A message without a payload
    #[must_use]
    pub fn empty(headers: BTreeMap<String, String>) -> Self {
        Self {
            headers,
            payload: Payload::Empty,
        }
    }

    /// The external headers
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Looks a header up by name, ignoring ASCII case
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True if the payload is textual
    #[must_use]
    pub fn is_text_message(&self) -> bool {
        matches!(self.payload, Payload::Text(_))
    }

    /// The textual payload, if any
    #[must_use]
    pub fn text_payload(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The binary payload, if any
    #[must_use]
    pub fn byte_payload(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The payload as bytes, whatever its flavor
    #[must_use]
    pub fn payload_bytes(&self) -> Cow<'_, [u8]> {
        match &self.payload {
            Payload::Empty => Cow::Borrowed(&[]),
            Payload::Text(text) => Cow::Borrowed(text.as_bytes()),
            Payload::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
        }
    }
}
