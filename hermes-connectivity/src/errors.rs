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

use hermes_system::connection::{Connection, ConnectionId};
use std::time::Duration;

/// The typed errors a connectivity client reports to command origins and
/// publish callers. Every failure crossing a task boundary is one of these;
/// foreign errors are folded into the matching kind at the seam where they
/// occur.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A lifecycle command arrived while the client was in a state that
    /// cannot serve it
    #[error("cannot execute '{operation}' for connection '{connection}', please retry after {}s", timeout.as_secs())]
    SignalIllegal {
        /// The connection the command addressed
        connection: ConnectionId,
        /// The operation the client was busy with, lower-cased state name
        operation: String,
        /// How long the client may stay busy
        timeout: Duration,
    },
    /// Establishing or maintaining the transport failed
    #[error("could not establish a connection on '{address}': {description}")]
    ConnectionFailed {
        /// The connection that failed
        connection: ConnectionId,
        /// The `host:port` the transport tried to reach
        address: String,
        /// What went wrong
        description: String,
    },
    /// A connection test timed out or the endpoint is unreachable
    #[error("connection '{connection}' is unavailable")]
    ConnectionUnavailable {
        /// The tested connection
        connection: ConnectionId,
    },
    /// Publishing a single message failed
    #[error("message sending failed: {reason}")]
    MessageSendingFailed {
        /// What went wrong
        reason: String,
    },
    /// The message mapper could not be initialized
    #[error("failed to initialize the message mapper: {reason}")]
    MapperConfiguration {
        /// What went wrong
        reason: String,
    },
    /// Two subscribers declared the same acknowledgement label
    #[error("acknowledgement label '{label}' is already declared")]
    AckLabelNotUnique {
        /// The conflicting label
        label: String,
    },
}

impl Error {
    /// Transport-level failure for the endpoint of the given connection,
    /// with the standard hint that points at the usual suspects.
    #[must_use]
    pub fn connection_failed(connection: &Connection) -> Self {
        Self::ConnectionFailed {
            connection: connection.id.clone(),
            address: connection.uri.to_string(),
            description: "Make sure the endpoint is reachable and that no firewall prevents the connection.".to_string(),
        }
    }

    /// Transport-level failure with a specific description
    #[must_use]
    pub fn connection_failed_with(connection: &Connection, description: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            connection: connection.id.clone(),
            address: connection.uri.to_string(),
            description: description.into(),
        }
    }

    /// A volatile state did not see its terminal event in time
    #[must_use]
    pub fn connection_timed_out(connection: &Connection, operation: &str) -> Self {
        Self::ConnectionFailed {
            connection: connection.id.clone(),
            address: connection.uri.to_string(),
            description: format!("connection timed out while {operation}"),
        }
    }

    /// Publish rejected because the in-flight budget is exhausted
    #[must_use]
    pub fn too_many_in_flight() -> Self {
        Self::MessageSendingFailed {
            reason: "too many in-flight requests".to_string(),
        }
    }

    /// Publish failed because the pipeline was torn down underneath it
    #[must_use]
    pub fn stream_terminated() -> Self {
        Self::MessageSendingFailed {
            reason: "stream terminated".to_string(),
        }
    }

    /// The remote endpoint answered with a status code this service does
    /// not recognize
    #[must_use]
    pub fn unknown_status(code: u16) -> Self {
        Self::MessageSendingFailed {
            reason: format!("unknown HTTP status {code}"),
        }
    }

    /// True for errors a publish caller may retry after backing off
    #[must_use]
    pub fn is_sending_failure(&self) -> bool {
        matches!(self, Self::MessageSendingFailed { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hermes_system::connection::{ConnectionUri, DesiredStatus};

    fn connection() -> Connection {
        Connection {
            id: ConnectionId::new("conn-1"),
            uri: ConnectionUri {
                scheme: "http".to_string(),
                host: "svc".to_string(),
                port: 80,
            },
            desired_status: DesiredStatus::Open,
            sources: vec![],
            targets: vec![],
            mapping_context: None,
            processor_pool_size: 1,
        }
    }

    #[test]
    fn connection_failed_carries_the_address() {
        let error = Error::connection_failed(&connection());
        assert!(error.to_string().contains("svc:80"));
        assert!(error.to_string().contains("firewall"));
    }

    #[test]
    fn unknown_status_message() {
        assert_eq!(
            Error::unknown_status(799).to_string(),
            "message sending failed: unknown HTTP status 799"
        );
    }
}
