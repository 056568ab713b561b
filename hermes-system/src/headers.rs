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

use serde::{Deserialize, Serialize};
use std::collections::btree_map::{BTreeMap, Iter};

/// Header key for the correlation id of a signal
pub const CORRELATION_ID: &str = "correlation-id";
/// Header key for the content type of a payload
pub const CONTENT_TYPE: &str = "content-type";
/// Header key for the address replies should be routed to
pub const REPLY_TO: &str = "reply-to";
/// Header key identifying the service instance that produced a reply
pub const SOURCE: &str = "source";

/// The internal header bag carried by every signal.
///
/// Keys are case-sensitive and expected to be lower-case; values are plain
/// strings. The bag is cheap to clone and extended with builder-style
/// setters, so enriched copies can be derived without touching the original.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// An empty header bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with the given header set
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets a header in place, returning the previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    /// Looks a header up by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// The correlation id, if one is set
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID)
    }

    /// The content type, if one is set
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    /// The reply-to address, if one is set
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.get(REPLY_TO)
    }

    /// Number of headers in the bag
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no headers are set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all `(name, value)` pairs in key order
    pub fn iter(&self) -> Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<'h> IntoIterator for &'h Headers {
    type Item = (&'h String, &'h String);
    type IntoIter = Iter<'h, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_setters_do_not_touch_the_original() {
        let base = Headers::new().with(CORRELATION_ID, "c-1");
        let derived = base.clone().with(CONTENT_TYPE, "application/json");
        assert_eq!(base.content_type(), None);
        assert_eq!(derived.correlation_id(), Some("c-1"));
        assert_eq!(derived.content_type(), Some("application/json"));
    }

    #[test]
    fn insert_replaces() {
        let mut headers = Headers::new().with(REPLY_TO, "a");
        assert_eq!(headers.insert(REPLY_TO, "b"), Some("a".to_string()));
        assert_eq!(headers.reply_to(), Some("b"));
    }
}
