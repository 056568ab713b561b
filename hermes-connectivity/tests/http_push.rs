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

//! HTTP-push scenarios against a scripted local server: JSON responses,
//! unknown status codes and the in-flight budget.

use hermes_connectivity::client::{ClientState, Status};
use hermes_connectivity::config::{ClientConfig, HttpPushConfig};
use hermes_connectivity::harness::Harness;
use hermes_connectivity::impls::http::push::{Builder, DIAGNOSTIC_ACK_LABEL};
use hermes_connectivity::utils::metrics::SlidingWindowCounter;
use hermes_connectivity::TransportBuilder;
use hermes_system::connection::Connection;
use hermes_system::headers::{Headers, REPLY_TO};
use hermes_system::metrics::Metric;
use hermes_system::signal::{BusMessage, Signal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

const REPLY_BUDGET: Duration = Duration::from_secs(10);

/// What the scripted server does with each request
#[derive(Clone)]
enum ServerMode {
    /// Answer every request with the given raw bytes, then close
    Respond(&'static str),
    /// Read the request and never answer
    Hold,
}

/// A minimal scripted HTTP server: accepts connections, reads one request
/// per connection, counts it, then follows the mode.
async fn scripted_server(mode: ServerMode) -> anyhow::Result<(u16, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mode = mode.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                if read_request(&mut stream).await.is_err() {
                    return;
                }
                counter.fetch_add(1, Ordering::AcqRel);
                match mode {
                    ServerMode::Respond(raw) => {
                        let _ = stream.write_all(raw.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    }
                    ServerMode::Hold => {
                        // keep the connection open without answering
                        std::future::pending::<()>().await;
                    }
                }
            });
        }
    });
    Ok((port, requests))
}

/// Reads one request: the head up to the blank line, then a
/// content-length body if one is declared.
async fn read_request(stream: &mut tokio::net::TcpStream) -> anyhow::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid-request");
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buffer[..head_end]).to_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut remaining = content_length.saturating_sub(buffer.len() - head_end);
    while remaining > 0 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }
    Ok(())
}

fn connection_to(id: &str, port: u16, target_address: &str, queue: usize) -> (Connection, HttpPushConfig) {
    let connection: Connection = serde_json::from_value(serde_json::json!({
        "id": id,
        "uri": {"host": "127.0.0.1", "port": port},
        "desired_status": "open",
        "targets": [{"address": target_address}]
    }))
    .expect("the test connection must deserialize");
    let config = HttpPushConfig {
        max_queue_size: queue,
        ..HttpPushConfig::default()
    };
    (connection, config)
}

async fn connected_harness(connection: Connection, config: HttpPushConfig) -> anyhow::Result<Harness> {
    let transport = Builder::http(config).build(&connection).await?;
    let harness = Harness::with_config(connection.clone(), transport, ClientConfig::default());
    let mut reply_rx = harness.addr.create(connection, Headers::new()).await?;
    let status = Harness::expect_status(&mut reply_rx, REPLY_BUDGET).await?;
    anyhow::ensure!(
        status == Status::Success(ClientState::Connected),
        "client must connect, got {status:?}"
    );
    Ok(harness)
}

fn outbound_signal(reply: bool) -> Signal {
    let mut headers = Headers::new();
    if reply {
        headers.insert(REPLY_TO, "bus");
    }
    Signal::new("things.events:modified", "the-thing")
        .with_topic("twin/events")
        .with_headers(headers)
        .with_payload(serde_json::json!({"temperature": 21}))
}

/// Polls a counter until the expected minute-window count shows up.
async fn await_count(
    counter: &SlidingWindowCounter,
    metric: Metric,
    success: bool,
    expected: u64,
) -> anyhow::Result<()> {
    for _ in 0..100 {
        let count = counter
            .measurements(metric, success)
            .first()
            .map_or(0, |m| m.count);
        if count == expected {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("counter did not reach {expected} for {metric:?} success={success}")
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_with_json_response_acknowledges() -> anyhow::Result<()> {
    let (port, requests) = scripted_server(ServerMode::Respond(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}",
    ))
    .await?;
    let (connection, config) = connection_to("conn-http-1", port, "POST:/ack", 100);
    let mut harness = connected_harness(connection.clone(), config).await?;

    harness.addr.outbound(outbound_signal(true)).await?;

    let ack = loop {
        let Some(message) = timeout(REPLY_BUDGET, harness.bus_rx.recv()).await? else {
            anyhow::bail!("the bus closed before an acknowledgement arrived");
        };
        if let BusMessage::Ack(ack) = message {
            break ack;
        }
    };
    // no user-declared ack label on the target, so the diagnostic one
    assert_eq!(ack.label.as_str(), DIAGNOSTIC_ACK_LABEL);
    assert_eq!(ack.status, 200);
    assert_eq!(ack.payload, Some(serde_json::json!({"ok": true})));
    assert_eq!(ack.entity_id.as_str(), "the-thing");

    let published = harness.registry.outbound_published(&connection.id, "POST:/ack");
    await_count(&published, Metric::Published, true, 1).await?;
    assert_eq!(requests.load(Ordering::Acquire), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_status_fails_the_publish() -> anyhow::Result<()> {
    let (port, _requests) = scripted_server(ServerMode::Respond(
        "HTTP/1.1 799 Odd\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
    ))
    .await?;
    let (connection, config) = connection_to("conn-http-2", port, "POST:/ack", 100);
    let mut harness = connected_harness(connection.clone(), config).await?;

    harness.addr.outbound(outbound_signal(true)).await?;

    let published = harness.registry.outbound_published(&connection.id, "POST:/ack");
    await_count(&published, Metric::Published, false, 1).await?;
    // the response was received but not usable
    let responses = harness.registry.response_consumed(&connection.id);
    await_count(&responses, Metric::Consumed, false, 1).await?;
    // nothing reaches the bus for a failed publish
    assert!(
        timeout(Duration::from_millis(300), harness.bus_rx.recv())
            .await
            .is_err(),
        "no bus traffic expected for a failed publish"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_budget_rejects_the_newest_publish() -> anyhow::Result<()> {
    let (port, requests) = scripted_server(ServerMode::Hold).await?;
    let (connection, config) = connection_to("conn-http-3", port, "POST:/ack", 2);
    let harness = connected_harness(connection.clone(), config).await?;

    // two publishes park on the held server, the third is rejected
    for _ in 0..3 {
        harness.addr.outbound(outbound_signal(true)).await?;
    }

    let dropped = harness.registry.outbound_dropped(&connection.id, "POST:/ack");
    await_count(&dropped, Metric::Dropped, true, 1).await?;
    // the rejected publish never reaches the wire
    sleep(Duration::from_millis(500)).await;
    assert!(requests.load(Ordering::Acquire) <= 2);
    // and nothing has been counted as published yet
    let published = harness.registry.outbound_published(&connection.id, "POST:/ack");
    assert_eq!(
        published
            .measurements(Metric::Published, true)
            .first()
            .map_or(0, |m| m.count),
        0
    );
    Ok(())
}
