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

use crate::signal::AckLabel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Unique identifier of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a connection id from anything stringy
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The endpoint a connection binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionUri {
    /// URI scheme, `http` or `https` for HTTP-push connections
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl Display for ConnectionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The status an operator wants a connection to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    /// The connection should be established
    Open,
    /// The connection should stay closed
    Closed,
}

/// The status a connection is observed to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Connected to the external endpoint
    Open,
    /// Disconnected on purpose
    Closed,
    /// Disconnected because of a failure
    Failed,
    /// Not yet determined
    Unknown,
}

/// User-configured payload mapping definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingContext {
    /// Name of the mapping engine
    pub engine: String,
    /// Engine specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// An inbound address declaration within a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Source {
    /// Address messages are consumed from
    pub address: String,
    /// Authorization subjects inbound signals are attributed to
    #[serde(default)]
    pub authorization_context: Vec<String>,
    /// Number of consumers to attach to the address
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,
    /// Optional consumption filters
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_consumer_count() -> usize {
    1
}

/// An outbound address declaration within a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    /// Address messages are published to
    pub address: String,
    /// Signal topics this target subscribes to; empty subscribes to all
    #[serde(default)]
    pub topics: Vec<String>,
    /// Authorization subjects required for outbound signals
    #[serde(default)]
    pub authorization_context: Vec<String>,
    /// Acknowledgement label issued for publishes to this target
    #[serde(default)]
    pub ack_label: Option<AckLabel>,
}

impl Target {
    /// True if this target subscribes to the given topic
    #[must_use]
    pub fn subscribes_to(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| t == topic)
    }
}

/// Immutable configuration of a connection.
///
/// A connection is replaced wholesale on modification; nothing in here is
/// ever mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    /// Unique connection id
    pub id: ConnectionId,
    /// The external endpoint
    pub uri: ConnectionUri,
    /// Whether the connection should be open or closed
    pub desired_status: DesiredStatus,
    /// Inbound address declarations, in declaration order
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Outbound address declarations, in declaration order
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Optional payload mapping definition
    #[serde(default)]
    pub mapping_context: Option<MappingContext>,
    /// Size of the mapping processor pool
    #[serde(default = "default_processor_pool_size")]
    pub processor_pool_size: usize,
}

fn default_processor_pool_size() -> usize {
    1
}

impl Connection {
    /// The remote host
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.uri.host
    }

    /// The remote port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.uri.port
    }

    /// True if the connection declares any sources
    #[must_use]
    pub fn is_consuming(&self) -> bool {
        !self.sources.is_empty()
    }

    /// True if the connection declares any targets
    #[must_use]
    pub fn is_publishing(&self) -> bool {
        !self.targets.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserialize_with_defaults() -> Result<(), serde_json::Error> {
        let connection: Connection = serde_json::from_value(serde_json::json!({
            "id": "conn-1",
            "uri": {"host": "svc", "port": 80},
            "desired_status": "open",
            "targets": [{"address": "POST:/ingest"}]
        }))?;
        assert_eq!(connection.id.as_str(), "conn-1");
        assert_eq!(connection.uri.scheme, "http");
        assert_eq!(connection.uri.to_string(), "svc:80");
        assert_eq!(connection.processor_pool_size, 1);
        assert!(!connection.is_consuming());
        assert!(connection.is_publishing());
        Ok(())
    }

    #[test]
    fn target_topic_subscription() {
        let all = Target {
            address: "POST:/a".to_string(),
            topics: vec![],
            authorization_context: vec![],
            ack_label: None,
        };
        assert!(all.subscribes_to("twin/events"));
        let some = Target {
            topics: vec!["twin/events".to_string()],
            ..all
        };
        assert!(some.subscribes_to("twin/events"));
        assert!(!some.subscribes_to("live/messages"));
    }
}
