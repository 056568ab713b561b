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

//! A harness to drive a single connectivity client without a full runtime:
//! a scriptable mock transport, awaited status helpers and local listeners
//! for reachability scenarios.

use crate::client::{Addr, MetricsResponse, Status, StatusReceiver};
use crate::config::ClientConfig;
use crate::utils::metrics::CounterRegistry;
use crate::{ClientContext, Transport};
use anyhow::{anyhow, bail};
use hermes_system::connection::Connection;
use hermes_system::headers::Headers;
use hermes_system::qsize;
use hermes_system::signal::BusMessage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{channel, Receiver};
use tokio::task::{self, JoinHandle};
use tokio::time::timeout;

/// Scripted behavior of one mock transport hook
#[derive(Debug, Clone)]
pub enum Behavior {
    /// The hook succeeds immediately
    Succeed,
    /// The hook fails with the given message
    Fail(String),
    /// The hook never completes
    Hang,
}

impl Behavior {
    async fn apply(&self) -> anyhow::Result<()> {
        match self {
            Self::Succeed => Ok(()),
            Self::Fail(reason) => bail!(reason.clone()),
            Self::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// A transport whose hooks are scripted per harness
#[derive(Debug)]
pub struct MockTransport {
    connect: Behavior,
    disconnect: Behavior,
    test: Behavior,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    test_calls: AtomicUsize,
}

impl MockTransport {
    /// A transport with the given hook behaviors
    #[must_use]
    pub fn new(connect: Behavior, disconnect: Behavior, test: Behavior) -> Arc<Self> {
        Arc::new(Self {
            connect,
            disconnect,
            test,
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            test_calls: AtomicUsize::new(0),
        })
    }

    /// A transport whose hooks all succeed
    #[must_use]
    pub fn reliable() -> Arc<Self> {
        Self::new(Behavior::Succeed, Behavior::Succeed, Behavior::Succeed)
    }

    /// How often `connect` ran
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::Acquire)
    }

    /// How often `disconnect` ran
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::Acquire)
    }

    /// How often `test` ran
    #[must_use]
    pub fn test_calls(&self) -> usize {
        self.test_calls.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _ctx: &ClientContext, _connection: &Connection) -> anyhow::Result<()> {
        self.connect_calls.fetch_add(1, Ordering::AcqRel);
        self.connect.apply().await
    }

    async fn disconnect(&self, _ctx: &ClientContext, _connection: &Connection) -> anyhow::Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::AcqRel);
        self.disconnect.apply().await
    }

    async fn test(&self, _ctx: &ClientContext, _connection: &Connection) -> anyhow::Result<()> {
        self.test_calls.fetch_add(1, Ordering::AcqRel);
        self.test.apply().await
    }
}

/// One client under test
pub struct Harness {
    /// Address of the client
    pub addr: Addr,
    /// The registry the client records into
    pub registry: CounterRegistry,
    /// Receiving end of the signal bus
    pub bus_rx: Receiver<BusMessage>,
    /// The client configuration in force
    pub config: ClientConfig,
}

impl Harness {
    /// Spawns a client around the given transport with default tunables
    #[must_use]
    pub fn new(connection: Connection, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(connection, transport, ClientConfig::default())
    }

    /// Spawns a client around the given transport
    #[must_use]
    pub fn with_config(connection: Connection, transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let registry = CounterRegistry::new();
        let (bus_tx, bus_rx) = channel(qsize());
        let addr = crate::spawn(connection, transport, registry.clone(), bus_tx, config.clone());
        Self {
            addr,
            registry,
            bus_rx,
            config,
        }
    }

    /// Awaits the next status reply on the given channel
    ///
    /// # Errors
    /// If no reply arrives within the budget
    pub async fn expect_status(reply_rx: &mut StatusReceiver, within: Duration) -> anyhow::Result<Status> {
        timeout(within, reply_rx.recv())
            .await
            .map_err(|_| anyhow!("no status reply within {within:?}"))?
            .ok_or_else(|| anyhow!("the reply channel closed without a status"))
    }

    /// Asserts that no further status arrives on the channel
    ///
    /// # Errors
    /// If a status does arrive
    pub async fn expect_no_status(reply_rx: &mut StatusReceiver, within: Duration) -> anyhow::Result<()> {
        match timeout(within, reply_rx.recv()).await {
            Err(_) => Ok(()),
            Ok(None) => Ok(()),
            Ok(Some(status)) => bail!("unexpected status reply: {status:?}"),
        }
    }

    /// Queries and awaits the client's connection metrics
    ///
    /// # Errors
    /// If the client does not answer within the metrics timeout
    pub async fn retrieve_metrics(&self) -> anyhow::Result<MetricsResponse> {
        let mut reply_rx = self.addr.retrieve_metrics(Headers::new()).await?;
        timeout(self.config.retrieve_metrics_timeout, reply_rx.recv())
            .await
            .map_err(|_| anyhow!("no metrics reply in time"))?
            .ok_or_else(|| anyhow!("the metrics channel closed without a reply"))
    }
}

/// Binds a local listener and keeps accepting (and holding) connections,
/// so reachability probes and connects against it succeed.
///
/// # Errors
/// If no local port can be bound
pub async fn open_endpoint() -> anyhow::Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let handle = task::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    Ok((port, handle))
}

/// Reserves a local port that refuses connections by binding and
/// immediately dropping a listener.
///
/// # Errors
/// If no local port can be bound
pub async fn refused_endpoint() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// A connection pointed at a local endpoint
#[must_use]
pub fn local_connection(id: &str, port: u16) -> Connection {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "uri": {"host": "127.0.0.1", "port": port},
        "desired_status": "open",
        "targets": [{"address": "POST:/ingest"}]
    }))
    .unwrap_or_else(|e| panic!("the local connection template must deserialize: {e}"))
}
