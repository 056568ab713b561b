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

use crate::connection::ConnectionStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::time::{Duration, SystemTime};

/// Artificial internal address under which response traffic is counted.
/// Reserved; user-configured source and target addresses never collide with
/// it because it is no valid external address.
pub const RESPONSES_ADDRESS: &str = "_responses";

/// The kinds of events counted per address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Messages consumed from or replies received for an address
    Consumed,
    /// Payload mappings
    Mapped,
    /// Messages that passed a configured filter
    Filtered,
    /// Messages dropped on purpose
    Dropped,
    /// Messages published to external systems
    Published,
}

impl Metric {
    /// The label used in JSON representations
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Consumed => "consumed",
            Self::Mapped => "mapped",
            Self::Filtered => "filtered",
            Self::Dropped => "dropped",
            Self::Published => "published",
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether inbound or outbound traffic is counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// From external systems into the service
    Inbound,
    /// From the service to external systems
    Outbound,
}

impl Direction {
    /// The label used in JSON representations
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One rolling count over one measurement window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// The metric this measurement counts
    pub metric: Metric,
    /// Length of the measurement window
    pub window: Duration,
    /// Number of counted events within the window
    pub count: u64,
    /// Start of the window the count covers
    pub since: SystemTime,
}

/// Status and measurements of a single source or target address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressMetric {
    /// Observed status of the address
    pub status: ConnectionStatus,
    /// Free-text detail on the status
    pub status_details: Option<String>,
    /// Since when the address has been in this status
    pub in_status_since: SystemTime,
    /// Success measurements, one per metric and window
    pub success: Vec<Measurement>,
    /// Failure measurements, one per metric and window
    pub failure: Vec<Measurement>,
}

/// The status stamped onto aggregated address metrics
#[derive(Debug, Clone, PartialEq)]
pub struct AddressStatus {
    /// Observed status
    pub status: ConnectionStatus,
    /// Free-text detail
    pub details: Option<String>,
    /// Since when
    pub since: SystemTime,
}

/// Per-address metrics of all sources of a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceMetrics {
    /// Source address to its metric
    pub addresses: BTreeMap<String, AddressMetric>,
}

/// Per-address metrics of all targets of a connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetMetrics {
    /// Target address to its metric
    pub addresses: BTreeMap<String, AddressMetric>,
}

/// Everything a connection-metrics query reports for one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Observed status of the connection
    pub connection_status: ConnectionStatus,
    /// Free-text detail on the status
    pub status_details: Option<String>,
    /// Since when the connection has been in this status
    pub in_status_since: SystemTime,
    /// Name of the state the client is currently in
    pub client_state: String,
    /// Metrics of the configured sources
    pub sources: SourceMetrics,
    /// Metrics of the configured targets
    pub targets: TargetMetrics,
}
