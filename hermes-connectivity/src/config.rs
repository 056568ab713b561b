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

use serde::Deserialize;
use std::time::Duration;

/// Tunables of a connectivity client. All durations deserialize from
/// `{ "secs": .., "nanos": .. }` objects; the defaults are the values the
/// service has always shipped with.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// How long a fresh client waits for its first command before acting on
    /// the desired status by itself
    #[serde(default = "default_init_timeout")]
    pub init_timeout: Duration,
    /// Outer timeout of the CONNECTING, DISCONNECTING and TESTING states
    #[serde(default = "default_connecting_timeout")]
    pub connecting_timeout: Duration,
    /// Budget for the raw TCP reachability pre-check
    #[serde(default = "default_socket_check_timeout")]
    pub socket_check_timeout: Duration,
    /// Timeout for metrics retrieval round-trips
    #[serde(default = "default_retrieve_metrics_timeout")]
    pub retrieve_metrics_timeout: Duration,
    /// Byte cap for response bodies forwarded to message-command originators
    #[serde(default = "default_max_total_message_size")]
    pub max_total_message_size: usize,
    /// Byte cap for response bodies carried on plain acknowledgements
    #[serde(default = "default_ack_size_quota")]
    pub ack_size_quota: usize,
}

fn default_init_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connecting_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_socket_check_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_retrieve_metrics_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_total_message_size() -> usize {
    250 * 1024
}

fn default_ack_size_quota() -> usize {
    100 * 1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            init_timeout: default_init_timeout(),
            connecting_timeout: default_connecting_timeout(),
            socket_check_timeout: default_socket_check_timeout(),
            retrieve_metrics_timeout: default_retrieve_metrics_timeout(),
            max_total_message_size: default_max_total_message_size(),
            ack_size_quota: default_ack_size_quota(),
        }
    }
}

/// Tunables of the HTTP-push publisher.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpPushConfig {
    /// In-flight budget of the publisher; publishes beyond it are rejected
    /// immediately
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// How many requests may be on the wire concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Timeout for reading a response body
    #[serde(default = "default_read_body_timeout")]
    pub read_body_timeout: Duration,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_parallelism() -> usize {
    4
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_read_body_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for HttpPushConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            parallelism: default_parallelism(),
            request_timeout: default_request_timeout(),
            read_body_timeout: default_read_body_timeout(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connecting_timeout, Duration::from_secs(10));
        assert_eq!(config.socket_check_timeout, Duration::from_secs(2));

        let http = HttpPushConfig::default();
        assert_eq!(http.read_body_timeout, Duration::from_secs(10));
        assert!(http.max_queue_size > 0);
    }

    #[test]
    fn deserialize_partial_override() -> Result<(), serde_json::Error> {
        let config: HttpPushConfig = serde_json::from_value(serde_json::json!({
            "max_queue_size": 2
        }))?;
        assert_eq!(config.max_queue_size, 2);
        assert_eq!(config.parallelism, default_parallelism());
        Ok(())
    }
}
