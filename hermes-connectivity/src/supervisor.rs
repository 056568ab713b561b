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

//! Supervision of the per-connection clients: one client per connection,
//! spawned from a registered transport builder, stopped and stripped from
//! the registry on delete. Retry is a supervisor concern; a failed client
//! is restarted wholesale, never patched.

use crate::client::{Addr, MetricsResponse, Status, StatusReceiver};
use crate::config::ClientConfig;
use crate::utils::metrics::CounterRegistry;
use crate::TransportBuilder;
use hermes_system::connection::{Connection, ConnectionId};
use hermes_system::headers::Headers;
use hermes_system::signal::BusMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::timeout;

/// Supervision errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No transport builder serves the connection's URI scheme
    #[error("no transport registered for scheme '{0}'")]
    UnknownScheme(String),
    /// No client is running for the connection
    #[error("no client for connection '{0}'")]
    UnknownConnection(ConnectionId),
    /// The transport builder refused the connection
    #[error("building the transport failed: {0}")]
    Transport(String),
    /// The client is gone
    #[error("the client of connection '{0}' is gone")]
    ClientGone(ConnectionId),
}

struct ClientEntry {
    connection: Connection,
    addr: Addr,
}

/// Owns the counter registry and one client per configured connection.
pub struct Supervisor {
    config: ClientConfig,
    registry: CounterRegistry,
    bus_tx: Sender<BusMessage>,
    transports: HashMap<&'static str, Box<dyn TransportBuilder>>,
    clients: HashMap<ConnectionId, ClientEntry>,
}

impl Supervisor {
    /// A supervisor publishing mapped traffic onto the given bus
    #[must_use]
    pub fn new(config: ClientConfig, registry: CounterRegistry, bus_tx: Sender<BusMessage>) -> Self {
        Self {
            config,
            registry,
            bus_tx,
            transports: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Registers a transport builder under its scheme
    pub fn register(&mut self, builder: Box<dyn TransportBuilder>) {
        self.transports.insert(builder.scheme(), builder);
    }

    /// The shared counter registry
    #[must_use]
    pub fn registry(&self) -> &CounterRegistry {
        &self.registry
    }

    /// The address of a running client
    #[must_use]
    pub fn client(&self, connection: &ConnectionId) -> Option<&Addr> {
        self.clients.get(connection).map(|entry| &entry.addr)
    }

    /// Number of supervised clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True if no client is supervised
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    async fn spawn_client(&self, connection: &Connection) -> Result<Addr, Error> {
        let builder = self
            .transports
            .get(connection.uri.scheme.as_str())
            .ok_or_else(|| Error::UnknownScheme(connection.uri.scheme.clone()))?;
        let transport = builder
            .build(connection)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(crate::spawn(
            connection.clone(),
            transport,
            self.registry.clone(),
            self.bus_tx.clone(),
            self.config.clone(),
        ))
    }

    /// Creates (or replaces) the client for a connection and issues the
    /// create command.
    ///
    /// # Errors
    /// If no transport serves the scheme or the transport refuses the
    /// connection
    pub async fn create(&mut self, connection: Connection, headers: Headers) -> Result<StatusReceiver, Error> {
        if let Some(entry) = self.clients.remove(&connection.id) {
            info!("Replacing the client of connection '{}'.", connection.id);
            entry.addr.stop().await;
        }
        let addr = self.spawn_client(&connection).await?;
        let reply_rx = addr
            .create(connection.clone(), headers)
            .await
            .map_err(|_| Error::ClientGone(connection.id.clone()))?;
        self.clients.insert(
            connection.id.clone(),
            ClientEntry {
                connection,
                addr,
            },
        );
        Ok(reply_rx)
    }

    /// Replaces the configuration of a running connection; the running
    /// pipeline is kept, in-flight publishes complete against the old
    /// configuration.
    ///
    /// # Errors
    /// If no client runs for the connection
    pub async fn modify(&mut self, connection: Connection, headers: Headers) -> Result<StatusReceiver, Error> {
        if !self.clients.contains_key(&connection.id) {
            return self.create(connection, headers).await;
        }
        let entry = self
            .clients
            .get_mut(&connection.id)
            .ok_or_else(|| Error::UnknownConnection(connection.id.clone()))?;
        entry.connection = connection.clone();
        entry
            .addr
            .modify(connection.clone(), headers)
            .await
            .map_err(|_| Error::ClientGone(connection.id))
    }

    /// Issues an open command
    ///
    /// # Errors
    /// If no client runs for the connection
    pub async fn open(&self, connection: &ConnectionId, headers: Headers) -> Result<StatusReceiver, Error> {
        let addr = self
            .client(connection)
            .ok_or_else(|| Error::UnknownConnection(connection.clone()))?;
        addr.open(headers)
            .await
            .map_err(|_| Error::ClientGone(connection.clone()))
    }

    /// Issues a close command
    ///
    /// # Errors
    /// If no client runs for the connection
    pub async fn close(&self, connection: &ConnectionId, headers: Headers) -> Result<StatusReceiver, Error> {
        let addr = self
            .client(connection)
            .ok_or_else(|| Error::UnknownConnection(connection.clone()))?;
        addr.close(headers)
            .await
            .map_err(|_| Error::ClientGone(connection.clone()))
    }

    /// Queries connection metrics
    ///
    /// # Errors
    /// If no client runs for the connection or it does not answer in time
    pub async fn retrieve_metrics(&self, connection: &ConnectionId, headers: Headers) -> Result<MetricsResponse, Error> {
        let addr = self
            .client(connection)
            .ok_or_else(|| Error::UnknownConnection(connection.clone()))?;
        let mut reply_rx = addr
            .retrieve_metrics(headers)
            .await
            .map_err(|_| Error::ClientGone(connection.clone()))?;
        timeout(self.config.retrieve_metrics_timeout, reply_rx.recv())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| Error::ClientGone(connection.clone()))
    }

    /// Deletes a connection: disconnects, stops the client and strips its
    /// counters. Returns the disconnect reply, if one arrived in time.
    ///
    /// # Errors
    /// If no client runs for the connection
    pub async fn delete(&mut self, connection: &ConnectionId, headers: Headers) -> Result<Option<Status>, Error> {
        let entry = self
            .clients
            .remove(connection)
            .ok_or_else(|| Error::UnknownConnection(connection.clone()))?;
        let status = match entry.addr.delete(headers).await {
            Ok(mut reply_rx) => {
                let grace = self.config.connecting_timeout + Duration::from_secs(1);
                timeout(grace, reply_rx.recv()).await.ok().flatten()
            }
            Err(_) => None,
        };
        entry.addr.stop().await;
        self.registry.strip(connection);
        Ok(status)
    }

    /// Stops and respawns the client of a connection, re-issuing create
    ///
    /// # Errors
    /// If no client runs for the connection
    pub async fn restart(&mut self, connection: &ConnectionId, headers: Headers) -> Result<StatusReceiver, Error> {
        let entry = self
            .clients
            .remove(connection)
            .ok_or_else(|| Error::UnknownConnection(connection.clone()))?;
        entry.addr.stop().await;
        self.create(entry.connection, headers).await
    }

    /// Stops every supervised client
    pub async fn shutdown(&mut self) {
        for (_, entry) in self.clients.drain() {
            entry.addr.stop().await;
        }
    }
}
