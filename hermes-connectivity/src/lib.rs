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

//! Per-connection client lifecycle and message pipeline.
//!
//! For every configured connection one client task drives the transport
//! through its lifecycle, owns the mapping runtime and the publisher
//! pipeline, and records per-address traffic counters. Transports plug in
//! through the [`Transport`] trait; the HTTP-push transport under
//! [`impls::http`] is the built-in specialization.

#![recursion_limit = "256"]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

/// The client state machine
pub mod client;
/// Client and publisher tunables
pub mod config;
/// The typed error taxonomy
pub mod errors;
/// Test harness for driving a single client without a full runtime
pub mod harness;
/// Transport implementations
pub mod impls;
/// Payload mapping between external messages and signals
pub mod mapper;
/// The publisher pipeline
pub mod publisher;
/// Per-connection client supervision
pub mod supervisor;
/// Counters, registry and socket probing
pub mod utils;

use crate::client::{ConnectionFailure, Msg};
use crate::config::ClientConfig;
use crate::errors::Error;
use crate::utils::metrics::CounterRegistry;
use hermes_system::connection::{Connection, ConnectionId};
use hermes_system::metrics::{AddressStatus, SourceMetrics, TargetMetrics};
use hermes_system::signal::BusMessage;
use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio::task::{self, JoinHandle};

/// Logs but swallows an error
#[macro_export]
#[doc(hidden)]
macro_rules! log_error {
    ($maybe_error:expr, $($args:tt)+) => (
        if let Err(e) = $maybe_error {
            error!($($args)+, e = e);
            true
        } else {
            false
        }
    )
}

/// Escalates failures from a child task back into the owning client's
/// mailbox. Children hold a clone of the mailbox sender, never a reference
/// to the client itself.
#[derive(Debug, Clone)]
pub struct FailureNotifier {
    connection: ConnectionId,
    tx: Sender<Msg>,
}

/// The client this notifier belongs to is gone
#[derive(Debug, thiserror::Error)]
#[error("client of connection '{0}' is gone")]
pub struct NotifyError(ConnectionId);

impl FailureNotifier {
    pub(crate) fn new(connection: ConnectionId, tx: Sender<Msg>) -> Self {
        Self { connection, tx }
    }

    /// A notifier whose client never existed, for tests and tools
    #[must_use]
    pub fn dummy(connection: ConnectionId) -> Self {
        Self {
            connection,
            tx: tokio::sync::mpsc::channel(1).0,
        }
    }

    /// Reports a connection-level failure to the owning client
    ///
    /// # Errors
    /// If the client is gone
    pub async fn failure(&self, error: Error, description: impl Into<String>) -> Result<(), NotifyError> {
        self.tx
            .send(Msg::Failure(ConnectionFailure::new(None, error, description)))
            .await
            .map_err(|_| NotifyError(self.connection.clone()))
    }
}

/// Context shared by a component of one connection: identifies the
/// connection, reaches the failure notifier and the counter registry, and
/// carries the log prefix.
pub trait Context: Display + Clone {
    /// The connection this context belongs to
    fn connection(&self) -> &ConnectionId;

    /// The failure notifier of the owning client
    fn notifier(&self) -> &FailureNotifier;

    /// The process-wide counter registry
    fn registry(&self) -> &CounterRegistry;

    /// Only log an error and swallow the result
    #[inline]
    fn swallow_err<T, E, M>(&self, expr: Result<T, E>, msg: &M)
    where
        E: Display,
        M: Display + ?Sized,
    {
        if let Err(e) = expr {
            error!("{self} {msg}: {e}");
        }
    }

    /// Log an error and return the result
    #[inline]
    fn bail_err<T, E, M>(&self, expr: Result<T, E>, msg: &M) -> Result<T, E>
    where
        E: Display,
        M: Display + ?Sized,
    {
        if let Err(e) = &expr {
            error!("{self} {msg}: {e}");
        }
        expr
    }
}

/// Context of a connectivity client
#[derive(Clone)]
pub struct ClientContext {
    connection: ConnectionId,
    notifier: FailureNotifier,
    registry: CounterRegistry,
}

impl ClientContext {
    pub(crate) fn new(
        connection: ConnectionId,
        notifier: FailureNotifier,
        registry: CounterRegistry,
    ) -> Self {
        Self {
            connection,
            notifier,
            registry,
        }
    }
}

impl Display for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Client::{}]", &self.connection)
    }
}

impl Context for ClientContext {
    fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    fn notifier(&self) -> &FailureNotifier {
        &self.notifier
    }

    fn registry(&self) -> &CounterRegistry {
        &self.registry
    }
}

/// The capability interface a transport implements to drive one kind of
/// external endpoint.
///
/// `connect`, `disconnect` and `test` run on worker tasks; their outcome is
/// delivered back to the client as an event, so they may take their time
/// within the client's state timeout. Metrics hooks default to the shared
/// registry.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the protocol-level connection
    ///
    /// # Errors
    /// If the endpoint cannot be reached or refuses the protocol handshake
    async fn connect(&self, ctx: &ClientContext, connection: &Connection) -> anyhow::Result<()>;

    /// Tears the protocol-level connection down
    ///
    /// # Errors
    /// If teardown fails; the client treats this as a connection failure
    async fn disconnect(&self, _ctx: &ClientContext, _connection: &Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Checks transport connectivity without keeping the connection
    ///
    /// # Errors
    /// If the endpoint is unreachable or misconfigured
    async fn test(&self, ctx: &ClientContext, connection: &Connection) -> anyhow::Result<()>;

    /// Starts the publisher for this transport, if it publishes at all
    ///
    /// # Errors
    /// If the publisher cannot be created
    async fn create_publisher(
        &self,
        _ctx: &ClientContext,
        _connection: &Connection,
    ) -> anyhow::Result<Option<publisher::Addr>> {
        Ok(None)
    }

    /// Per-address metrics of the connection's sources
    fn source_metrics(&self, ctx: &ClientContext, status: &AddressStatus) -> SourceMetrics {
        ctx.registry().aggregate_sources(ctx.connection(), status)
    }

    /// Per-address metrics of the connection's targets
    fn target_metrics(&self, ctx: &ClientContext, status: &AddressStatus) -> TargetMetrics {
        ctx.registry().aggregate_targets(ctx.connection(), status)
    }
}

/// Something that can create a transport instance for a connection
#[async_trait::async_trait]
pub trait TransportBuilder: Send + Sync + std::fmt::Debug {
    /// The URI scheme this builder serves, e.g. `http`
    fn scheme(&self) -> &'static str;

    /// Builds a transport for the given connection
    ///
    /// # Errors
    /// If the connection configuration is invalid for this transport
    async fn build(&self, connection: &Connection) -> anyhow::Result<Arc<dyn Transport>>;
}

/// Spawns the client task for one connection and returns its address.
///
/// The client starts in the UNKNOWN state and waits for commands; if none
/// arrive within the init timeout it acts on the connection's desired
/// status by itself.
pub fn spawn(
    connection: Connection,
    transport: Arc<dyn Transport>,
    registry: CounterRegistry,
    bus_tx: Sender<BusMessage>,
    config: ClientConfig,
) -> client::Addr {
    client::spawn(connection, transport, registry, bus_tx, config)
}

/// Runs a long-lived child task and makes sure an error outcome is
/// escalated to the owning client as a connection failure; a child dying
/// silently would otherwise leave the client connected to nothing.
pub(crate) fn spawn_task<F, C>(ctx: C, fut: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    C: Context + Send + Sync + 'static,
{
    task::spawn(async move {
        if let Err(e) = fut.await {
            error!("{ctx} Task loop failed: {e}");
            let n = ctx.notifier();
            log_error!(
                n.failure(Error::stream_terminated(), format!("task loop failed: {e}")).await,
                "{ctx} Failed to escalate the task failure: {e}"
            );
        } else {
            debug!("{ctx} Task loop finished.");
        }
    })
}
