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

//! Lifecycle scenarios driven through the harness: happy path, unreachable
//! endpoints, test command, timeouts, illegal signals and modify.

use hermes_connectivity::client::{ClientState, Status};
use hermes_connectivity::config::ClientConfig;
use hermes_connectivity::errors::Error;
use hermes_connectivity::harness::{
    local_connection, open_endpoint, refused_endpoint, Behavior, Harness, MockTransport,
};
use hermes_connectivity::supervisor::Supervisor;
use hermes_connectivity::TransportBuilder;
use hermes_system::connection::{Connection, ConnectionStatus, DesiredStatus, MappingContext};
use hermes_system::headers::Headers;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const REPLY_BUDGET: Duration = Duration::from_secs(8);

#[tokio::test(flavor = "multi_thread")]
async fn create_and_open_reaches_connected() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::reliable();
    let harness = Harness::new(local_connection("conn-1", port), transport.clone());

    let mut reply_rx = harness
        .addr
        .create(local_connection("conn-1", port), Headers::new())
        .await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    assert_eq!(status, Status::Success(ClientState::Connected));
    assert_eq!(transport.connect_calls(), 1);

    let response = harness.retrieve_metrics().await?;
    assert_eq!(response.metrics.client_state, "CONNECTED");
    assert_eq!(response.metrics.connection_status, ConnectionStatus::Open);
    // no sources configured, one target with nothing counted yet
    assert!(response.metrics.sources.addresses.is_empty());
    let target = response
        .metrics
        .targets
        .addresses
        .get("POST:/ingest")
        .expect("the configured target must appear");
    assert!(target.success.iter().all(|m| m.count == 0));
    assert!(target.failure.iter().all(|m| m.count == 0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_endpoint_fails_fast() -> anyhow::Result<()> {
    let port = refused_endpoint().await?;
    let transport = MockTransport::reliable();
    let harness = Harness::new(local_connection("conn-2", port), transport.clone());

    let mut reply_rx = harness
        .addr
        .create(local_connection("conn-2", port), Headers::new())
        .await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    match status {
        Status::Failure(Error::ConnectionFailed { address, .. }) => {
            assert_eq!(address, format!("127.0.0.1:{port}"));
        }
        other => panic!("expected a connection failure, got {other:?}"),
    }
    // the pre-check short-circuits: no protocol connect, no mapper
    assert_eq!(transport.connect_calls(), 0);
    let response = harness.retrieve_metrics().await?;
    assert_eq!(response.metrics.client_state, "UNKNOWN");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_reports_a_misconfigured_mapper() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::reliable();
    let mut connection = local_connection("conn-3", port);
    connection.desired_status = DesiredStatus::Closed;
    connection.mapping_context = Some(MappingContext {
        engine: "not-a-mapper".to_string(),
        options: BTreeMap::new(),
    });
    let harness = Harness::new(connection.clone(), transport.clone());

    let mut reply_rx = harness.addr.test(connection, Headers::new()).await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    match status {
        Status::Failure(Error::MapperConfiguration { reason }) => {
            assert!(reason.contains("not-a-mapper"));
        }
        other => panic!("expected a mapper configuration failure, got {other:?}"),
    }
    // transport connectivity was still checked
    assert_eq!(transport.test_calls(), 1);

    // a finished test stops the client
    sleep(Duration::from_millis(200)).await;
    assert!(harness.addr.open(Headers::new()).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_test_stops_the_client() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::reliable();
    let mut connection = local_connection("conn-4", port);
    connection.desired_status = DesiredStatus::Closed;
    let harness = Harness::new(connection.clone(), transport);

    let mut reply_rx = harness.addr.test(connection, Headers::new()).await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    assert_eq!(status, Status::Success(ClientState::Testing));
    sleep(Duration::from_millis(200)).await;
    assert!(harness.addr.open(Headers::new()).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connecting_times_out_into_unknown() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::new(Behavior::Hang, Behavior::Succeed, Behavior::Succeed);
    let config = ClientConfig {
        connecting_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let harness = Harness::with_config(local_connection("conn-5", port), transport, config);

    let mut reply_rx = harness
        .addr
        .create(local_connection("conn-5", port), Headers::new())
        .await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    match status {
        Status::Failure(Error::ConnectionFailed { description, .. }) => {
            assert!(description.contains("timed out"));
        }
        other => panic!("expected a timeout failure, got {other:?}"),
    }
    let response = harness.retrieve_metrics().await?;
    assert_eq!(response.metrics.client_state, "UNKNOWN");
    assert_eq!(response.metrics.connection_status, ConnectionStatus::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_in_a_busy_state_get_an_illegal_signal_reply() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::new(Behavior::Hang, Behavior::Succeed, Behavior::Succeed);
    let harness = Harness::new(local_connection("conn-6", port), transport);

    let mut create_rx = harness
        .addr
        .create(local_connection("conn-6", port), Headers::new())
        .await?;
    // give the client time to run the pre-check and enter CONNECTING
    sleep(Duration::from_millis(500)).await;

    let mut open_rx = harness.addr.open(Headers::new()).await?;
    let status = Harness::expect_status(&mut open_rx, REPLY_BUDGET).await?;
    match status {
        Status::Failure(Error::SignalIllegal { operation, timeout, .. }) => {
            assert_eq!(operation, "connecting");
            assert_eq!(timeout, harness.config.connecting_timeout);
        }
        other => panic!("expected an illegal signal reply, got {other:?}"),
    }
    // the connect attempt itself is still pending
    Harness::expect_no_status(&mut create_rx, Duration::from_millis(100)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn close_from_connected_reaches_disconnected() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::reliable();
    let harness = Harness::new(local_connection("conn-7", port), transport.clone());

    let mut create_rx = harness
        .addr
        .create(local_connection("conn-7", port), Headers::new())
        .await?;
    let status = Harness::expect_status(&mut create_rx, REPLY_BUDGET).await?;
    assert_eq!(status, Status::Success(ClientState::Connected));

    let mut close_rx = harness.addr.close(Headers::new()).await?;
    let status = Harness::expect_status(&mut close_rx, REPLY_BUDGET).await?;
    assert_eq!(status, Status::Success(ClientState::Disconnected));
    assert_eq!(transport.disconnect_calls(), 1);

    let response = harness.retrieve_metrics().await?;
    assert_eq!(response.metrics.client_state, "DISCONNECTED");
    assert_eq!(response.metrics.connection_status, ConnectionStatus::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn modify_twice_equals_create_once() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let transport = MockTransport::reliable();
    let mut connection = local_connection("conn-8", port);
    connection.desired_status = DesiredStatus::Closed;
    let harness = Harness::new(connection.clone(), transport);

    // two modifies in a row leave the same stored configuration behind as
    // a single create would
    let mut first_rx = harness.addr.modify(connection.clone(), Headers::new()).await?;
    let mut second_rx = harness.addr.modify(connection.clone(), Headers::new()).await?;
    Harness::expect_no_status(&mut first_rx, Duration::from_millis(200)).await?;
    Harness::expect_no_status(&mut second_rx, Duration::from_millis(200)).await?;

    // the stored configuration is live: opening it connects
    let mut open_rx = harness.addr.open(Headers::new()).await?;
    let status = Harness::expect_status(&mut open_rx, REPLY_BUDGET).await?;
    assert_eq!(status, Status::Success(ClientState::Connected));
    Ok(())
}

#[derive(Debug)]
struct MockBuilder;

#[async_trait::async_trait]
impl TransportBuilder for MockBuilder {
    fn scheme(&self) -> &'static str {
        "http"
    }

    async fn build(&self, _connection: &Connection) -> anyhow::Result<Arc<dyn hermes_connectivity::Transport>> {
        Ok(MockTransport::reliable())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn supervisor_creates_and_deletes_clients() -> anyhow::Result<()> {
    let (port, _endpoint) = open_endpoint().await?;
    let registry = hermes_connectivity::utils::metrics::CounterRegistry::new();
    let (bus_tx, _bus_rx) = tokio::sync::mpsc::channel(16);
    let mut supervisor = Supervisor::new(ClientConfig::default(), registry.clone(), bus_tx);
    supervisor.register(Box::new(MockBuilder));

    let connection = local_connection("conn-9", port);
    let mut reply_rx = supervisor.create(connection.clone(), Headers::new()).await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    assert_eq!(status, Status::Success(ClientState::Connected));
    assert_eq!(supervisor.len(), 1);

    let metrics = supervisor
        .retrieve_metrics(&connection.id, Headers::new())
        .await?;
    assert_eq!(metrics.metrics.client_state, "CONNECTED");
    assert!(!registry.is_empty());

    let status = supervisor.delete(&connection.id, Headers::new()).await?;
    assert_eq!(status, Some(Status::Success(ClientState::Disconnected)));
    assert!(supervisor.is_empty());
    // deleting a connection strips its counters
    assert!(registry.is_empty());
    Ok(())
}
