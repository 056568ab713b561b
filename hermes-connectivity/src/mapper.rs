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

use crate::errors::Error;
use crate::publisher::{self, PublishRequest, PublishTarget};
use crate::{ClientContext, Context};
use hermes_system::connection::{ConnectionId, MappingContext, Target};
use hermes_system::external::ExternalMessage;
use hermes_system::headers::{Headers, CONTENT_TYPE};
use hermes_system::signal::{BusMessage, Signal};
use hermes_system::qsize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};

/// Name of the built-in mapping engine
pub const PASSTHROUGH_ENGINE: &str = "passthrough";

/// Pure transform between external messages and internal signals.
///
/// Implementations must be side-effect free; the runtime decides where and
/// how often they run.
pub trait MessageMapper: Send + Sync {
    /// Maps an external message into zero or more signals. An empty result
    /// drops the message on purpose.
    ///
    /// # Errors
    /// If the message cannot be mapped
    fn inbound(&self, message: ExternalMessage) -> Result<Vec<Signal>, Error>;

    /// Maps an outbound signal into an external message
    ///
    /// # Errors
    /// If the signal cannot be mapped
    fn outbound(&self, signal: &Signal) -> Result<ExternalMessage, Error>;
}

/// Instantiates the mapper for a connection.
///
/// This is a pure factory: it validates the mapping context and builds the
/// mapper, or fails with a mapper-configuration error. It is deliberately
/// callable without a running client so that `TestConnection` can exercise
/// mapper initialization on its own.
///
/// # Errors
/// If the mapping context names an unknown engine or carries unsupported
/// options
pub fn mapper_of(
    connection: &ConnectionId,
    mapping_context: Option<&MappingContext>,
) -> Result<Arc<dyn MessageMapper>, Error> {
    match mapping_context {
        None => Ok(Arc::new(Passthrough)),
        Some(context) if context.engine == PASSTHROUGH_ENGINE => {
            if let Some(option) = context.options.keys().next() {
                return Err(Error::MapperConfiguration {
                    reason: format!(
                        "engine '{PASSTHROUGH_ENGINE}' for connection '{connection}' does not support option '{option}'"
                    ),
                });
            }
            Ok(Arc::new(Passthrough))
        }
        Some(context) => Err(Error::MapperConfiguration {
            reason: format!(
                "unknown mapping engine '{}' for connection '{connection}'",
                context.engine
            ),
        }),
    }
}

/// The built-in mapper: signals travel as JSON objects with `name`,
/// `entity`, `topic` and `payload` fields; anything that is not such an
/// object comes through as an opaque message signal.
struct Passthrough;

impl Passthrough {
    fn signal_from_json(value: &Value, headers: Headers) -> Option<Signal> {
        let object = value.as_object()?;
        let name = object.get("name")?.as_str()?;
        let entity = object.get("entity")?.as_str()?;
        let topic = object.get("topic").and_then(Value::as_str).unwrap_or("");
        let mut signal = Signal::new(name, entity).with_topic(topic).with_headers(headers);
        if let Some(payload) = object.get("payload") {
            signal = signal.with_payload(payload.clone());
        }
        Some(signal)
    }
}

impl MessageMapper for Passthrough {
    fn inbound(&self, message: ExternalMessage) -> Result<Vec<Signal>, Error> {
        let bytes = message.payload_bytes();
        if bytes.is_empty() {
            return Ok(vec![]);
        }
        let headers: Headers = message
            .headers()
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
            if let Some(signal) = Self::signal_from_json(&value, headers.clone()) {
                return Ok(vec![signal]);
            }
            let signal = Signal::new("external.message", "unknown")
                .with_topic("messages")
                .with_headers(headers)
                .with_payload(value);
            return Ok(vec![signal]);
        }
        let payload = message.text_payload().map_or_else(
            || Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            |text| Value::String(text.to_string()),
        );
        Ok(vec![Signal::new("external.message", "unknown")
            .with_topic("messages")
            .with_headers(headers)
            .with_payload(payload)])
    }

    fn outbound(&self, signal: &Signal) -> Result<ExternalMessage, Error> {
        let body = serde_json::json!({
            "name": signal.name,
            "entity": signal.entity_id.as_str(),
            "topic": signal.topic,
            "payload": signal.payload,
        });
        let mut headers: BTreeMap<String, String> = signal
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.insert(CONTENT_TYPE.to_string(), "application/json".to_string());
        Ok(ExternalMessage::text(headers, body.to_string()))
    }
}

enum Job {
    Inbound {
        message: ExternalMessage,
        source_address: String,
    },
    Outbound(Signal),
}

/// Everything the mapping workers need besides the mapper itself
pub(crate) struct MapperEnv {
    pub(crate) ctx: ClientContext,
    pub(crate) bus_tx: Sender<BusMessage>,
    pub(crate) publisher: Option<publisher::Addr>,
    pub(crate) targets: Vec<Target>,
    pub(crate) max_total_message_size: usize,
    pub(crate) ack_size_quota: usize,
}

/// The per-connection mapping runtime: a pool of workers applying the
/// mapper to inbound and outbound traffic and recording the traversal
/// counters. Dropping the runtime drains and stops the workers.
pub(crate) struct MapperRuntime {
    job_tx: Sender<Job>,
    #[allow(dead_code)]
    workers: Vec<JoinHandle<()>>,
}

impl MapperRuntime {
    pub(crate) fn spawn(
        mapper: Arc<dyn MessageMapper>,
        env: MapperEnv,
        pool_size: usize,
    ) -> Self {
        let (job_tx, job_rx) = channel(qsize());
        let job_rx = Arc::new(Mutex::new(job_rx));
        let env = Arc::new(env);
        let workers = (0..pool_size.max(1))
            .map(|_| {
                let mapper = mapper.clone();
                let env = env.clone();
                let job_rx = job_rx.clone();
                task::spawn(worker(mapper, env, job_rx))
            })
            .collect();
        Self { job_tx, workers }
    }

    /// Hands an inbound external message to the pool
    pub(crate) async fn dispatch_inbound(&self, message: ExternalMessage, source_address: String) {
        let _ = self
            .job_tx
            .send(Job::Inbound {
                message,
                source_address,
            })
            .await;
    }

    /// Hands an outbound signal to the pool
    pub(crate) async fn dispatch_outbound(&self, signal: Signal) {
        let _ = self.job_tx.send(Job::Outbound(signal)).await;
    }
}

async fn worker(mapper: Arc<dyn MessageMapper>, env: Arc<MapperEnv>, job_rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            rx.recv().await
        };
        match job {
            None => break,
            Some(Job::Inbound {
                message,
                source_address,
            }) => handle_inbound(&*mapper, &env, message, &source_address).await,
            Some(Job::Outbound(signal)) => handle_outbound(&*mapper, &env, signal).await,
        }
    }
}

async fn handle_inbound(
    mapper: &dyn MessageMapper,
    env: &MapperEnv,
    message: ExternalMessage,
    source_address: &str,
) {
    let registry = env.ctx.registry();
    let connection = env.ctx.connection();
    registry.inbound_consumed(connection, source_address).record(true);
    match mapper.inbound(message) {
        Ok(signals) if signals.is_empty() => {
            registry.inbound_dropped(connection, source_address).record(true);
        }
        Ok(signals) => {
            registry.inbound_mapped(connection, source_address).record(true);
            for signal in signals {
                env.ctx.swallow_err(
                    env.bus_tx.send(BusMessage::Signal(signal)).await,
                    "Error forwarding an inbound signal to the bus",
                );
            }
        }
        Err(e) => {
            registry.inbound_mapped(connection, source_address).record(false);
            warn!("{} Failed to map a message from '{source_address}': {e}", env.ctx);
        }
    }
}

async fn handle_outbound(mapper: &dyn MessageMapper, env: &MapperEnv, signal: Signal) {
    let registry = env.ctx.registry();
    let connection = env.ctx.connection();
    let matched: Vec<&Target> = env
        .targets
        .iter()
        .filter(|target| target.subscribes_to(&signal.topic))
        .collect();
    if matched.is_empty() {
        debug!(
            "{} No target subscribes to topic '{}', dropping signal '{}'.",
            env.ctx, signal.topic, signal.name
        );
        return;
    }

    let external = match mapper.outbound(&signal) {
        Ok(external) => external,
        Err(e) => {
            for target in &matched {
                registry.outbound_mapped(connection, &target.address).record(false);
            }
            warn!("{} Failed to map signal '{}': {e}", env.ctx, signal.name);
            return;
        }
    };

    for target in matched {
        registry.outbound_mapped(connection, &target.address).record(true);
        registry.outbound_filtered(connection, &target.address).record(true);

        let Some(publisher) = &env.publisher else {
            registry.outbound_dropped(connection, &target.address).record(true);
            info!(
                "{} Cannot publish signal '{}', no publisher running.",
                env.ctx, signal.name
            );
            continue;
        };

        let request = PublishRequest {
            signal: signal.clone(),
            auto_ack_target: target.ack_label.is_some().then(|| target.clone()),
            target: PublishTarget::from_target(target),
            message: external.clone(),
            max_total_message_size: env.max_total_message_size,
            ack_size_quota: env.ack_size_quota,
        };
        let result = publisher.publish(request);

        let ctx = env.ctx.clone();
        let bus_tx = env.bus_tx.clone();
        let wants_reply = signal.headers.reply_to().is_some();
        task::spawn(async move {
            match result.await {
                Ok(outcome) => {
                    let registry = ctx.registry();
                    if wants_reply {
                        registry.response_mapped(ctx.connection()).record(true);
                        if let Some(response) = outcome.response {
                            ctx.swallow_err(
                                bus_tx.send(BusMessage::Response(response)).await,
                                "Error forwarding a command response to the bus",
                            );
                        }
                        ctx.swallow_err(
                            bus_tx.send(BusMessage::Ack(outcome.ack)).await,
                            "Error forwarding an acknowledgement to the bus",
                        );
                        registry.response_published(ctx.connection()).record(true);
                    } else {
                        registry.response_dropped(ctx.connection()).record(true);
                    }
                }
                Err(e) => {
                    debug!("{ctx} Publish did not complete: {e}");
                }
            }
        });
    }
}
