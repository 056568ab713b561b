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

//! The per-connection client: one long-lived task consuming a single
//! mailbox, driving the transport through
//! UNKNOWN → CONNECTING → CONNECTED → DISCONNECTING → DISCONNECTED (plus
//! TESTING). Every input is processed serially; long-running transport work
//! happens on worker tasks whose outcome comes back as an event.

use crate::config::ClientConfig;
use crate::errors::Error;
use crate::mapper::{self, MapperEnv, MapperRuntime};
use crate::publisher;
use crate::utils::metrics::CounterRegistry;
use crate::utils::socket;
use crate::{ClientContext, Context, FailureNotifier, Transport};
use hermes_system::connection::{Connection, ConnectionId, ConnectionStatus, DesiredStatus};
use hermes_system::external::ExternalMessage;
use hermes_system::headers::{Headers, SOURCE};
use hermes_system::metrics::{AddressStatus, ConnectionMetrics};
use hermes_system::qsize;
use hermes_system::signal::{BusMessage, Signal};
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task;
use tokio::time::{timeout_at, Instant};

/// The lifecycle states of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Fresh or recovering, nothing established
    Unknown,
    /// Transport connect in progress
    Connecting,
    /// Connected, pipeline running
    Connected,
    /// Transport disconnect in progress
    Disconnecting,
    /// Disconnected on purpose
    Disconnected,
    /// Running a connection test; terminal
    Testing,
}

impl ClientState {
    fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Testing => "TESTING",
        }
    }

    /// The operation name used in illegal-signal replies
    #[must_use]
    pub fn operation(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Testing => "testing",
        }
    }
}

impl Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply to a lifecycle command
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// The command succeeded; carries the state reached
    Success(ClientState),
    /// The command failed
    Failure(Error),
}

/// Where lifecycle replies go. Unbounded on purpose: commands arrive over
/// a bounded mailbox, so replies are naturally bounded too and must never
/// block the client loop.
pub type StatusSender = UnboundedSender<Status>;
/// Receiving half for lifecycle replies
pub type StatusReceiver = UnboundedReceiver<Status>;

/// The transport established its connection
#[derive(Debug)]
pub struct ClientConnected;

/// The transport tore its connection down
#[derive(Debug)]
pub struct ClientDisconnected;

/// A transport-level failure, reported by a worker task or a child
#[derive(Debug)]
pub struct ConnectionFailure {
    /// Who to address the failure reply to; the stored origin if absent
    pub origin: Option<StatusSender>,
    /// The failure itself
    pub error: Error,
    /// Human-readable description, kept as status detail
    pub description: String,
}

impl ConnectionFailure {
    /// A new connection failure
    pub fn new(origin: Option<StatusSender>, error: Error, description: impl Into<String>) -> Self {
        Self {
            origin,
            error,
            description: description.into(),
        }
    }
}

/// Reply to a metrics query
#[derive(Debug)]
pub struct MetricsResponse {
    /// The queried connection
    pub connection: ConnectionId,
    /// The synthesized metrics
    pub metrics: ConnectionMetrics,
    /// The query headers, enriched with the answering instance
    pub headers: Headers,
}

/// Everything a client can receive: lifecycle commands tagged with their
/// reply channel, traffic, and internal events from worker tasks.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Msg {
    /// Store a connection configuration, connect if it wants to be open
    Create {
        /// The configuration to store
        connection: Connection,
        /// Command headers
        headers: Headers,
        /// Reply channel
        reply_tx: StatusSender,
    },
    /// Replace the connection configuration, semantically delete + create
    Modify {
        /// The replacement configuration
        connection: Connection,
        /// Command headers
        headers: Headers,
        /// Reply channel
        reply_tx: StatusSender,
    },
    /// Establish the connection
    Open {
        /// Command headers
        headers: Headers,
        /// Reply channel
        reply_tx: StatusSender,
    },
    /// Close the connection
    Close {
        /// Command headers
        headers: Headers,
        /// Reply channel
        reply_tx: StatusSender,
    },
    /// Close the connection for good
    Delete {
        /// Command headers
        headers: Headers,
        /// Reply channel
        reply_tx: StatusSender,
    },
    /// Test transport connectivity and mapper initialization
    Test {
        /// The configuration to test
        connection: Connection,
        /// Command headers
        headers: Headers,
        /// Reply channel
        reply_tx: StatusSender,
    },
    /// Synthesize connection metrics from the registry
    RetrieveMetrics {
        /// Query headers
        headers: Headers,
        /// Reply channel
        reply_tx: UnboundedSender<MetricsResponse>,
    },
    /// An outbound signal heading for the connection's targets
    Outbound(Signal),
    /// An inbound external message consumed from a source
    Inbound {
        /// The consumed message
        message: ExternalMessage,
        /// The source address it came from
        source_address: String,
    },
    /// Internal: the transport connected
    Connected(ClientConnected),
    /// Internal: the transport disconnected
    Disconnected(ClientDisconnected),
    /// Internal: something failed
    Failure(ConnectionFailure),
    /// Internal: outcome of the combined connection test
    TestResult(Result<(), Error>),
    /// Stop the client task; issued by the supervisor
    Stop,
}

/// The client mailbox is gone
#[derive(Debug, thiserror::Error)]
#[error("the client is gone")]
pub struct AddrError;

/// Address of a running client
#[derive(Debug, Clone)]
pub struct Addr {
    tx: Sender<Msg>,
}

impl Addr {
    pub(crate) fn new(tx: Sender<Msg>) -> Self {
        Self { tx }
    }

    /// Sends a raw message to the client
    ///
    /// # Errors
    /// If the client is gone
    pub async fn send(&self, msg: Msg) -> Result<(), AddrError> {
        self.tx.send(msg).await.map_err(|_| AddrError)
    }

    async fn command<F>(&self, make: F) -> Result<StatusReceiver, AddrError>
    where
        F: FnOnce(StatusSender) -> Msg,
    {
        let (reply_tx, reply_rx) = unbounded_channel();
        self.send(make(reply_tx)).await?;
        Ok(reply_rx)
    }

    /// Issues a create command
    ///
    /// # Errors
    /// If the client is gone
    pub async fn create(&self, connection: Connection, headers: Headers) -> Result<StatusReceiver, AddrError> {
        self.command(|reply_tx| Msg::Create {
            connection,
            headers,
            reply_tx,
        })
        .await
    }

    /// Issues a modify command
    ///
    /// # Errors
    /// If the client is gone
    pub async fn modify(&self, connection: Connection, headers: Headers) -> Result<StatusReceiver, AddrError> {
        self.command(|reply_tx| Msg::Modify {
            connection,
            headers,
            reply_tx,
        })
        .await
    }

    /// Issues an open command
    ///
    /// # Errors
    /// If the client is gone
    pub async fn open(&self, headers: Headers) -> Result<StatusReceiver, AddrError> {
        self.command(|reply_tx| Msg::Open { headers, reply_tx }).await
    }

    /// Issues a close command
    ///
    /// # Errors
    /// If the client is gone
    pub async fn close(&self, headers: Headers) -> Result<StatusReceiver, AddrError> {
        self.command(|reply_tx| Msg::Close { headers, reply_tx }).await
    }

    /// Issues a delete command
    ///
    /// # Errors
    /// If the client is gone
    pub async fn delete(&self, headers: Headers) -> Result<StatusReceiver, AddrError> {
        self.command(|reply_tx| Msg::Delete { headers, reply_tx }).await
    }

    /// Issues a test command
    ///
    /// # Errors
    /// If the client is gone
    pub async fn test(&self, connection: Connection, headers: Headers) -> Result<StatusReceiver, AddrError> {
        self.command(|reply_tx| Msg::Test {
            connection,
            headers,
            reply_tx,
        })
        .await
    }

    /// Queries connection metrics
    ///
    /// # Errors
    /// If the client is gone
    pub async fn retrieve_metrics(&self, headers: Headers) -> Result<UnboundedReceiver<MetricsResponse>, AddrError> {
        let (reply_tx, reply_rx) = unbounded_channel();
        self.send(Msg::RetrieveMetrics { headers, reply_tx }).await?;
        Ok(reply_rx)
    }

    /// Hands an outbound signal to the client
    ///
    /// # Errors
    /// If the client is gone
    pub async fn outbound(&self, signal: Signal) -> Result<(), AddrError> {
        self.send(Msg::Outbound(signal)).await
    }

    /// Hands an inbound external message to the client
    ///
    /// # Errors
    /// If the client is gone
    pub async fn inbound(&self, message: ExternalMessage, source_address: impl Into<String>) -> Result<(), AddrError> {
        self.send(Msg::Inbound {
            message,
            source_address: source_address.into(),
        })
        .await
    }

    /// Stops the client task. Idempotent; a client that is already gone is
    /// fine.
    pub async fn stop(&self) {
        let _ = self.tx.send(Msg::Stop).await;
    }
}

/// Immutable snapshot of a client's observable state. Replaced as a whole
/// on every transition, never mutated in place.
#[derive(Debug, Clone)]
pub struct ClientData {
    connection: Connection,
    observed_status: ConnectionStatus,
    desired_status: DesiredStatus,
    status_details: Option<String>,
    in_status_since: SystemTime,
    origin: Option<StatusSender>,
    last_headers: Headers,
}

impl ClientData {
    fn new(connection: Connection) -> Self {
        let desired_status = connection.desired_status;
        Self {
            connection,
            observed_status: ConnectionStatus::Unknown,
            desired_status,
            status_details: Some("initialized".to_string()),
            in_status_since: SystemTime::now(),
            origin: None,
            last_headers: Headers::new(),
        }
    }

    /// The current connection configuration
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The observed connection status
    #[must_use]
    pub fn observed_status(&self) -> ConnectionStatus {
        self.observed_status
    }

    /// The desired connection status
    #[must_use]
    pub fn desired_status(&self) -> DesiredStatus {
        self.desired_status
    }

    /// Detail text on the observed status
    #[must_use]
    pub fn status_details(&self) -> Option<&str> {
        self.status_details.as_deref()
    }

    /// Since when the client has observed the current status
    #[must_use]
    pub fn in_status_since(&self) -> SystemTime {
        self.in_status_since
    }

    /// Headers of the last state-changing command
    #[must_use]
    pub fn last_headers(&self) -> &Headers {
        &self.last_headers
    }

    pub(crate) fn origin(&self) -> Option<&StatusSender> {
        self.origin.as_ref()
    }

    fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = connection;
        self
    }

    fn with_observed_status(mut self, status: ConnectionStatus) -> Self {
        if status != self.observed_status {
            self.in_status_since = SystemTime::now();
        }
        self.observed_status = status;
        self
    }

    fn with_desired_status(mut self, status: DesiredStatus) -> Self {
        self.desired_status = status;
        self
    }

    fn with_status_details(mut self, details: impl Into<String>) -> Self {
        self.status_details = Some(details.into());
        self
    }

    fn with_origin(mut self, origin: Option<StatusSender>) -> Self {
        self.origin = origin;
        self
    }

    fn with_last_headers(mut self, headers: Headers) -> Self {
        self.last_headers = headers;
        self
    }

    fn address_status(&self) -> AddressStatus {
        AddressStatus {
            status: self.observed_status,
            details: self.status_details.clone(),
            since: self.in_status_since,
        }
    }
}

pub(crate) fn spawn(
    connection: Connection,
    transport: Arc<dyn Transport>,
    registry: CounterRegistry,
    bus_tx: Sender<BusMessage>,
    config: ClientConfig,
) -> Addr {
    let (tx, rx) = channel(qsize());
    let notifier = FailureNotifier::new(connection.id.clone(), tx.clone());
    let ctx = ClientContext::new(connection.id.clone(), notifier, registry);
    let client = Client {
        ctx,
        config,
        transport,
        bus_tx,
        rx,
        self_tx: tx.clone(),
        state: ClientState::Unknown,
        data: ClientData::new(connection),
        mapper: None,
        publisher: None,
        deadline: None,
    };
    task::spawn(client.run());
    Addr::new(tx)
}

struct Client {
    ctx: ClientContext,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    bus_tx: Sender<BusMessage>,
    rx: Receiver<Msg>,
    self_tx: Sender<Msg>,
    state: ClientState,
    data: ClientData,
    mapper: Option<MapperRuntime>,
    publisher: Option<publisher::Addr>,
    deadline: Option<Instant>,
}

impl Client {
    async fn run(mut self) {
        info!("{} Client started.", self.ctx);
        self.deadline = Some(Instant::now() + self.config.init_timeout);
        loop {
            let msg = if let Some(deadline) = self.deadline {
                match timeout_at(deadline, self.rx.recv()).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => {
                        if self.on_state_timeout().await {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                }
            };
            if self.handle(msg).await {
                break;
            }
        }
        self.teardown();
        info!("{} Client stopped.", self.ctx);
    }

    /// Handles one event; returns true when the client should stop
    async fn handle(&mut self, msg: Msg) -> bool {
        use ClientState::{Connected, Connecting, Disconnected, Disconnecting, Testing, Unknown};
        match (self.state, msg) {
            // served in every state
            (_, Msg::RetrieveMetrics { headers, reply_tx }) => {
                self.retrieve_metrics(&headers, &reply_tx);
            }
            (_, Msg::Modify {
                connection,
                headers,
                reply_tx,
            }) => {
                // modify replaces the configuration wholesale
                self.send_to_self(Msg::Create {
                    connection,
                    headers,
                    reply_tx,
                })
                .await;
            }
            (_, Msg::Outbound(signal)) => self.dispatch_outbound(signal).await,
            (_, Msg::Inbound {
                message,
                source_address,
            }) => self.dispatch_inbound(message, source_address).await,

            // stable states accepting lifecycle commands
            (Unknown | Disconnected, Msg::Create {
                connection,
                headers,
                reply_tx,
            }) => self.create_connection(connection, headers, reply_tx).await,
            (Unknown | Disconnected, Msg::Open { headers, reply_tx }) => {
                self.open_connection(headers, reply_tx).await;
            }
            (Unknown | Disconnected, Msg::Test {
                connection,
                headers,
                reply_tx,
            }) => self.test_connection(connection, headers, reply_tx).await,
            (Unknown | Connected, Msg::Close { headers, reply_tx } | Msg::Delete { headers, reply_tx }) => {
                self.close_connection(headers, reply_tx);
            }
            (Disconnected, Msg::Delete { reply_tx, .. }) => {
                // nothing left to tear down
                self.reply(&reply_tx, Status::Success(self.state));
            }

            // volatile states waiting for their terminal event
            (Connecting, Msg::Connected(_)) => self.handle_client_connected().await,
            (Disconnecting, Msg::Disconnected(_)) => self.handle_client_disconnected(),
            (Connecting | Connected | Disconnecting, Msg::Failure(failure)) => {
                self.handle_connection_failure(failure);
            }
            (Testing, Msg::TestResult(result)) => {
                self.handle_test_result(result);
                return true;
            }
            (_, Msg::Stop) => {
                info!("{} Stopping.", self.ctx);
                return true;
            }

            (state, msg) => self.unhandled(state, &msg),
        }
        false
    }

    async fn on_state_timeout(&mut self) -> bool {
        match self.state {
            ClientState::Unknown => {
                self.deadline = None;
                if self.data.desired_status() == DesiredStatus::Open {
                    info!(
                        "{} Did not receive a connect command within the init timeout, connecting.",
                        self.ctx
                    );
                    let reply_tx = self
                        .data
                        .origin()
                        .cloned()
                        .unwrap_or_else(|| unbounded_channel().0);
                    let headers = self.data.last_headers().clone();
                    self.send_to_self(Msg::Open { headers, reply_tx }).await;
                } else {
                    info!(
                        "{} Did not receive a connect command within the init timeout, staying put.",
                        self.ctx
                    );
                }
                false
            }
            state @ (ClientState::Connecting | ClientState::Disconnecting) => {
                let error = Error::connection_timed_out(self.data.connection(), state.operation());
                self.reply_origin(Status::Failure(error));
                self.data = self
                    .data
                    .clone()
                    .with_observed_status(ConnectionStatus::Failed)
                    .with_status_details(format!("connection timed out while {}", state.operation()));
                self.transition(ClientState::Unknown);
                false
            }
            ClientState::Testing => {
                error!("{} Connection test timed out.", self.ctx);
                self.reply_origin(Status::Failure(Error::ConnectionUnavailable {
                    connection: self.ctx.connection().clone(),
                }));
                true
            }
            _ => {
                self.deadline = None;
                false
            }
        }
    }

    async fn create_connection(&mut self, connection: Connection, headers: Headers, reply_tx: StatusSender) {
        let desired = connection.desired_status;
        self.data = self
            .data
            .clone()
            .with_connection(connection)
            .with_desired_status(desired)
            .with_status_details("creating connection")
            .with_origin(Some(reply_tx.clone()))
            .with_last_headers(headers.clone());
        if desired == DesiredStatus::Open {
            self.send_to_self(Msg::Open { headers, reply_tx }).await;
        } else {
            info!("{} Connection created with desired status closed.", self.ctx);
        }
    }

    async fn open_connection(&mut self, headers: Headers, reply_tx: StatusSender) {
        self.data = self
            .data
            .clone()
            .with_origin(Some(reply_tx.clone()))
            .with_last_headers(headers);
        let connection = self.data.connection().clone();
        match socket::probe(
            connection.hostname(),
            connection.port(),
            self.config.socket_check_timeout,
        )
        .await
        {
            Ok(()) => {
                self.do_connect(connection);
                self.transition(ClientState::Connecting);
            }
            Err(probe_error) => {
                warn!(
                    "{} Socket could not be opened for <{}>: {probe_error}",
                    self.ctx, connection.uri
                );
                self.reply(&reply_tx, Status::Failure(Error::connection_failed(&connection)));
                self.transition(ClientState::Unknown);
            }
        }
    }

    fn close_connection(&mut self, headers: Headers, reply_tx: StatusSender) {
        self.data = self
            .data
            .clone()
            .with_origin(Some(reply_tx))
            .with_desired_status(DesiredStatus::Closed)
            .with_status_details("closing or deleting connection")
            .with_last_headers(headers);
        self.do_disconnect(self.data.connection().clone());
        self.transition(ClientState::Disconnecting);
    }

    async fn test_connection(&mut self, connection: Connection, headers: Headers, reply_tx: StatusSender) {
        self.data = self
            .data
            .clone()
            .with_connection(connection.clone())
            .with_origin(Some(reply_tx))
            .with_status_details("testing connection")
            .with_last_headers(headers);

        if let Err(probe_error) = socket::probe(
            connection.hostname(),
            connection.port(),
            self.config.socket_check_timeout,
        )
        .await
        {
            warn!(
                "{} Socket could not be opened for <{}>: {probe_error}",
                self.ctx, connection.uri
            );
            self.send_to_self(Msg::TestResult(Err(Error::connection_failed(&connection))))
                .await;
        } else {
            let transport = self.transport.clone();
            let ctx = self.ctx.clone();
            let tx = self.self_tx.clone();
            task::spawn(async move {
                // transport connectivity and mapper initialization are
                // independent checks; both must pass
                let (transport_result, mapper_result) = tokio::join!(
                    transport.test(&ctx, &connection),
                    async { mapper::mapper_of(&connection.id, connection.mapping_context.as_ref()).map(|_| ()) }
                );
                let result = match (transport_result, mapper_result) {
                    (Ok(()), Ok(())) => Ok(()),
                    (Err(e), _) => Err(Error::connection_failed_with(&connection, e.to_string())),
                    (_, Err(e)) => Err(e),
                };
                let _ = tx.send(Msg::TestResult(result)).await;
            });
        }
        self.transition(ClientState::Testing);
    }

    fn do_connect(&self, connection: Connection) {
        let transport = self.transport.clone();
        let ctx = self.ctx.clone();
        let tx = self.self_tx.clone();
        task::spawn(async move {
            let msg = match transport.connect(&ctx, &connection).await {
                Ok(()) => Msg::Connected(ClientConnected),
                Err(e) => Msg::Failure(ConnectionFailure::new(
                    None,
                    Error::connection_failed_with(&connection, e.to_string()),
                    format!("failed to connect: {e}"),
                )),
            };
            if tx.send(msg).await.is_err() {
                debug!("{ctx} Gone before the connect attempt finished.");
            }
        });
    }

    fn do_disconnect(&self, connection: Connection) {
        let transport = self.transport.clone();
        let ctx = self.ctx.clone();
        let tx = self.self_tx.clone();
        task::spawn(async move {
            let msg = match transport.disconnect(&ctx, &connection).await {
                Ok(()) => Msg::Disconnected(ClientDisconnected),
                Err(e) => Msg::Failure(ConnectionFailure::new(
                    None,
                    Error::connection_failed_with(&connection, e.to_string()),
                    format!("failed to disconnect: {e}"),
                )),
            };
            if tx.send(msg).await.is_err() {
                debug!("{ctx} Gone before the disconnect attempt finished.");
            }
        });
    }

    async fn handle_client_connected(&mut self) {
        let connection = self.data.connection().clone();
        match self.transport.create_publisher(&self.ctx, &connection).await {
            Ok(publisher) => self.publisher = publisher,
            Err(e) => {
                self.handle_connection_failure(ConnectionFailure::new(
                    None,
                    Error::connection_failed_with(&connection, e.to_string()),
                    format!("failed to start the publisher: {e}"),
                ));
                return;
            }
        }
        self.start_mapper(&connection);
        self.data = self
            .data
            .clone()
            .with_observed_status(ConnectionStatus::Open)
            .with_status_details("connected");
        self.reply_origin(Status::Success(ClientState::Connected));
        self.transition(ClientState::Connected);
    }

    fn handle_client_disconnected(&mut self) {
        if self.data.connection().is_consuming() {
            self.stop_mapper();
        }
        self.stop_publisher();
        self.data = self
            .data
            .clone()
            .with_observed_status(ConnectionStatus::Closed)
            .with_status_details("disconnected");
        self.reply_origin(Status::Success(ClientState::Disconnected));
        self.transition(ClientState::Disconnected);
    }

    fn handle_connection_failure(&mut self, failure: ConnectionFailure) {
        warn!("{} Connection failure: {}", self.ctx, failure.description);
        if let Some(origin) = failure.origin.as_ref() {
            self.reply(origin, Status::Failure(failure.error));
        } else {
            self.reply_origin(Status::Failure(failure.error));
        }
        self.stop_publisher();
        self.data = self
            .data
            .clone()
            .with_observed_status(ConnectionStatus::Failed)
            .with_status_details(failure.description);
        self.transition(ClientState::Unknown);
    }

    fn handle_test_result(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => {
                info!("{} Connection test succeeded.", self.ctx);
                self.reply_origin(Status::Success(ClientState::Testing));
            }
            Err(e) => {
                error!("{} Connection test failed: {e}", self.ctx);
                self.reply_origin(Status::Failure(e));
            }
        }
    }

    fn start_mapper(&mut self, connection: &Connection) {
        // the runtime hands publishes to the publisher started for this
        // connect attempt, so a leftover runtime is always replaced
        if self.mapper.take().is_some() {
            debug!("{} Replacing the running mapper runtime.", self.ctx);
        }
        match mapper::mapper_of(&connection.id, connection.mapping_context.as_ref()) {
            Ok(instance) => {
                let env = MapperEnv {
                    ctx: self.ctx.clone(),
                    bus_tx: self.bus_tx.clone(),
                    publisher: self.publisher.clone(),
                    targets: connection.targets.clone(),
                    max_total_message_size: self.config.max_total_message_size,
                    ack_size_quota: self.config.ack_size_quota,
                };
                self.mapper = Some(MapperRuntime::spawn(instance, env, connection.processor_pool_size));
                debug!(
                    "{} Started the mapper runtime with a pool size of {}.",
                    self.ctx, connection.processor_pool_size
                );
            }
            Err(e) => {
                // transient: report to the origin, run without a mapper
                info!("{} Mapper initialization failed: {e}", self.ctx);
                self.reply_origin(Status::Failure(e));
            }
        }
    }

    fn stop_mapper(&mut self) {
        if self.mapper.take().is_some() {
            debug!("{} Stopping the mapper runtime.", self.ctx);
        }
    }

    fn stop_publisher(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            debug!("{} Stopping the publisher.", self.ctx);
            publisher.stop();
        }
    }

    fn retrieve_metrics(&self, headers: &Headers, reply_tx: &UnboundedSender<MetricsResponse>) {
        let registry = self.ctx.registry();
        let connection = self.data.connection();
        // make sure every configured address appears, with zero counts if
        // nothing has been recorded yet
        for source in &connection.sources {
            let _ = registry.inbound_consumed(&connection.id, &source.address);
        }
        for target in &connection.targets {
            let _ = registry.outbound_published(&connection.id, &target.address);
        }
        let status = self.data.address_status();
        let metrics = ConnectionMetrics {
            connection_status: self.data.observed_status(),
            status_details: self.data.status_details().map(ToString::to_string),
            in_status_since: self.data.in_status_since(),
            client_state: self.state.name().to_string(),
            sources: self.transport.source_metrics(&self.ctx, &status),
            targets: self.transport.target_metrics(&self.ctx, &status),
        };
        let response = MetricsResponse {
            connection: connection.id.clone(),
            metrics,
            headers: headers.clone().with(SOURCE, instance_suffix()),
        };
        self.ctx
            .swallow_err(reply_tx.send(response), "Error sending a metrics response");
    }

    async fn dispatch_outbound(&mut self, signal: Signal) {
        if let Some(mapper) = &self.mapper {
            mapper.dispatch_outbound(signal).await;
        } else {
            let registry = self.ctx.registry();
            for target in &self.data.connection().targets {
                if target.subscribes_to(&signal.topic) {
                    registry
                        .outbound_dropped(self.ctx.connection(), &target.address)
                        .record(true);
                }
            }
            info!(
                "{} Cannot handle signal '{}', no mapper available.",
                self.ctx, signal.name
            );
        }
    }

    async fn dispatch_inbound(&mut self, message: ExternalMessage, source_address: String) {
        if let Some(mapper) = &self.mapper {
            mapper.dispatch_inbound(message, source_address).await;
        } else {
            self.ctx
                .registry()
                .inbound_dropped(self.ctx.connection(), &source_address)
                .record(true);
            debug!(
                "{} Dropping a message from '{source_address}', no mapper available.",
                self.ctx
            );
        }
    }

    fn unhandled(&self, state: ClientState, msg: &Msg) {
        warn!(
            "{} Received an unsupported message in state {state} - status: {:?}: {}",
            self.ctx,
            self.data.observed_status(),
            self.data.status_details().unwrap_or("")
        );
        let reply_tx = match msg {
            Msg::Create { reply_tx, .. }
            | Msg::Modify { reply_tx, .. }
            | Msg::Open { reply_tx, .. }
            | Msg::Close { reply_tx, .. }
            | Msg::Delete { reply_tx, .. }
            | Msg::Test { reply_tx, .. } => Some(reply_tx),
            _ => None,
        };
        // only live addressable parties get a reply; internal events do not
        if let Some(reply_tx) = reply_tx {
            self.reply(
                reply_tx,
                Status::Failure(Error::SignalIllegal {
                    connection: self.ctx.connection().clone(),
                    operation: state.operation().to_string(),
                    timeout: self.config.connecting_timeout,
                }),
            );
        }
    }

    fn transition(&mut self, next: ClientState) {
        if next != self.state {
            if let Some(correlation) = self.data.last_headers().correlation_id() {
                info!(
                    "{} Transition: {} -> {next} (correlation-id: {correlation})",
                    self.ctx, self.state
                );
            } else {
                info!("{} Transition: {} -> {next}", self.ctx, self.state);
            }
        }
        self.state = next;
        self.deadline = match next {
            ClientState::Connecting | ClientState::Disconnecting | ClientState::Testing => {
                Some(Instant::now() + self.config.connecting_timeout)
            }
            _ => None,
        };
    }

    fn reply(&self, reply_tx: &StatusSender, status: Status) {
        self.ctx
            .swallow_err(reply_tx.send(status), "Error sending a reply");
    }

    fn reply_origin(&self, status: Status) {
        if let Some(origin) = self.data.origin() {
            self.reply(origin, status);
        }
    }

    async fn send_to_self(&self, msg: Msg) {
        self.ctx
            .swallow_err(self.self_tx.send(msg).await, "Error sending to self");
    }

    fn teardown(&mut self) {
        self.stop_publisher();
        self.stop_mapper();
    }
}

fn instance_suffix() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("hermes-{}", std::process::id()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(ClientState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ClientState::Connecting.operation(), "connecting");
        assert_eq!(ClientState::Testing.operation(), "testing");
    }

    #[test]
    fn client_data_tracks_status_changes() {
        let connection: Connection = serde_json::from_value(serde_json::json!({
            "id": "conn-data",
            "uri": {"host": "svc", "port": 80},
            "desired_status": "open"
        }))
        .expect("valid connection");
        let data = ClientData::new(connection);
        assert_eq!(data.observed_status(), ConnectionStatus::Unknown);
        let before = data.in_status_since();
        let updated = data.clone().with_observed_status(ConnectionStatus::Open);
        assert!(updated.in_status_since() >= before);
        // same status keeps the timestamp
        let same = updated.clone().with_observed_status(ConnectionStatus::Open);
        assert_eq!(same.in_status_since(), updated.in_status_since());
    }
}
