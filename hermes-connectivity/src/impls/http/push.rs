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

//! The HTTP-push transport: publishes outbound messages as HTTP requests
//! and converts the responses into acknowledgements, and into message
//! responses for message commands.

use super::{meta, Auth, HttpPushFactory};
use crate::config::HttpPushConfig;
use crate::errors::Error;
use crate::publisher::{
    self, CommandResponseOrAck, PublishContext, PublishFlow, PublishTarget, PublisherContext,
};
use crate::{ClientContext, Context, Transport, TransportBuilder};
use anyhow::anyhow;
use bytes::Bytes;
use hermes_system::connection::Connection;
use hermes_system::signal::{AckLabel, Acknowledgement, MessageResponse};
use http::header::CONTENT_TYPE;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client as HyperClient};
use hyper_util::rt::TokioExecutor;
use mime::Mime;
use std::sync::{Arc, RwLock};
use tokio::time::timeout;

/// Acknowledgement label used when no target declares one. Diagnostic
/// only; never requested by a user.
pub const DIAGNOSTIC_ACK_LABEL: &str = "ditto-http-diagnostic";

type HttpsClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Builder for HTTP-push transports, registered per scheme
#[derive(Debug)]
pub struct Builder {
    scheme: &'static str,
    config: HttpPushConfig,
    auth: Auth,
}

impl Builder {
    /// A builder for plain `http` connections
    #[must_use]
    pub fn http(config: HttpPushConfig) -> Self {
        Self {
            scheme: "http",
            config,
            auth: Auth::None,
        }
    }

    /// A builder for `https` connections
    #[must_use]
    pub fn https(config: HttpPushConfig) -> Self {
        Self {
            scheme: "https",
            config,
            auth: Auth::None,
        }
    }

    /// Returns the builder with the given authentication
    #[must_use]
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::http(HttpPushConfig::default())
    }
}

#[async_trait::async_trait]
impl TransportBuilder for Builder {
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    async fn build(&self, connection: &Connection) -> anyhow::Result<Arc<dyn Transport>> {
        Ok(Arc::new(HttpPushTransport::new(
            connection,
            self.config.clone(),
            self.auth.clone(),
        )?))
    }
}

/// The HTTP-push transport of one connection
pub struct HttpPushTransport {
    config: HttpPushConfig,
    factory: HttpPushFactory,
    client: RwLock<Option<HttpsClient>>,
}

impl HttpPushTransport {
    /// A transport for the endpoint of the given connection
    ///
    /// # Errors
    /// If the connection URI is no valid HTTP endpoint
    pub fn new(connection: &Connection, config: HttpPushConfig, auth: Auth) -> anyhow::Result<Self> {
        let factory = HttpPushFactory::from_connection(connection)?.with_auth(auth);
        Ok(Self {
            config,
            factory,
            client: RwLock::new(None),
        })
    }

    fn build_client(&self) -> anyhow::Result<HttpsClient> {
        let with_roots = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) if !self.factory.is_tls() => {
                // a plain-http endpoint needs no trust anchors
                debug!("No native TLS roots available ({e}), continuing without.");
                HttpsConnectorBuilder::new().with_tls_config(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(rustls::RootCertStore::empty())
                        .with_no_client_auth(),
                )
            }
            Err(e) => return Err(e.into()),
        };
        let https = with_roots
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(HyperClient::builder(TokioExecutor::new()).build(https))
    }

    fn current_client(&self) -> anyhow::Result<Option<HttpsClient>> {
        Ok(self
            .client
            .read()
            .map_err(|_| anyhow!("http client lock poisoned"))?
            .clone())
    }
}

#[async_trait::async_trait]
impl Transport for HttpPushTransport {
    async fn connect(&self, ctx: &ClientContext, connection: &Connection) -> anyhow::Result<()> {
        let client = self.build_client()?;
        *self
            .client
            .write()
            .map_err(|_| anyhow!("http client lock poisoned"))? = Some(client);
        debug!("{ctx} HTTP client ready for {}.", connection.uri);
        Ok(())
    }

    async fn disconnect(&self, ctx: &ClientContext, _connection: &Connection) -> anyhow::Result<()> {
        *self
            .client
            .write()
            .map_err(|_| anyhow!("http client lock poisoned"))? = None;
        debug!("{ctx} HTTP client dropped.");
        Ok(())
    }

    async fn test(&self, _ctx: &ClientContext, _connection: &Connection) -> anyhow::Result<()> {
        // the reachability pre-check has already probed the endpoint;
        // building the connector validates the TLS setup
        self.build_client().map(|_| ())
    }

    async fn create_publisher(
        &self,
        ctx: &ClientContext,
        _connection: &Connection,
    ) -> anyhow::Result<Option<publisher::Addr>> {
        let client = self
            .current_client()?
            .ok_or_else(|| anyhow!("no http client available, not connected"))?;
        let publisher_ctx = PublisherContext::new(
            ctx.connection().clone(),
            ctx.notifier().clone(),
            ctx.registry().clone(),
        );
        let flow = HttpPushFlow {
            ctx: publisher_ctx.clone(),
            client,
            factory: self.factory.clone(),
            config: self.config.clone(),
        };
        Ok(Some(publisher::spawn(
            publisher_ctx,
            flow,
            self.config.max_queue_size,
            self.config.parallelism,
        )))
    }
}

struct HttpPushFlow {
    ctx: PublisherContext,
    client: HttpsClient,
    factory: HttpPushFactory,
    config: HttpPushConfig,
}

#[async_trait::async_trait]
impl PublishFlow for HttpPushFlow {
    type Request = Request<Full<Bytes>>;
    type Response = Response<Incoming>;

    fn build_request(
        &self,
        target: &PublishTarget,
        message: &hermes_system::external::ExternalMessage,
    ) -> Result<Self::Request, Error> {
        meta::build_request(&self.factory, target, message)
    }

    async fn send(&self, request: Self::Request) -> anyhow::Result<Self::Response> {
        let uri = meta::strip_user_info(request.uri());
        let method = request.method().clone();
        debug!("{} Sending {method} {uri}", self.ctx);
        match timeout(self.config.request_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                debug!("{} Got {} for {method} {uri}", self.ctx, response.status());
                Ok(response)
            }
            Ok(Err(e)) => Err(anyhow!("failed to send {method} {uri}: {e}")),
            Err(_) => Err(anyhow!(
                "request {method} {uri} timed out after {}s",
                self.config.request_timeout.as_secs()
            )),
        }
    }

    async fn on_response(
        &self,
        ctx: &PublishContext,
        response: anyhow::Result<Self::Response>,
    ) -> Result<CommandResponseOrAck, Error> {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // a failed send can mean a stale connection pool; force a
                // reconnect through the owning client
                self.ctx.swallow_err(
                    self.ctx
                        .notifier()
                        .failure(
                            Error::MessageSendingFailed {
                                reason: e.to_string(),
                            },
                            format!("failed to send an HTTP request: {e}"),
                        )
                        .await,
                    "Error escalating a send failure",
                );
                return Err(Error::MessageSendingFailed {
                    reason: format!("failed to send HTTP request: {e}"),
                });
            }
        };
        self.to_outcome(ctx, response).await
    }
}

impl HttpPushFlow {
    async fn to_outcome(
        &self,
        ctx: &PublishContext,
        response: Response<Incoming>,
    ) -> Result<CommandResponseOrAck, Error> {
        let status = response.status();
        let Some(status_code) = meta::known_status(status) else {
            // unrecognized status: the body is not worth reading
            drop(response);
            return Err(Error::unknown_status(status.as_u16()));
        };

        let (parts, body) = response.into_parts();
        let is_message_command = ctx.signal().is_message_command();
        let limit = if is_message_command {
            ctx.max_total_message_size()
        } else {
            ctx.ack_size_quota()
        };
        let bytes = meta::read_body(body, limit, self.config.read_body_timeout).await?;

        let entity_content_type: Option<Mime> = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        let payload = meta::decode_body(entity_content_type.as_ref(), &bytes);

        let ack_headers = meta::fold_response_headers(
            &ctx.signal().headers,
            &parts.headers,
            entity_content_type.as_ref(),
        );
        let label = ctx
            .auto_ack_target()
            .and_then(|target| target.ack_label.clone())
            .unwrap_or_else(|| AckLabel::new(DIAGNOSTIC_ACK_LABEL));
        let ack = Acknowledgement {
            label,
            entity_id: ctx.signal().entity_id.clone(),
            status: status_code,
            headers: ack_headers,
            payload: Some(payload.clone()),
        };

        let command_response = ctx.signal().message.as_ref().map(|command| MessageResponse {
            kind: command.kind.clone(),
            entity_id: ctx.signal().entity_id.clone(),
            subject: command.subject.clone(),
            status: status_code,
            headers: meta::fold_response_headers(
                &command.headers,
                &parts.headers,
                entity_content_type.as_ref(),
            ),
            payload: Some(payload),
        });

        Ok(CommandResponseOrAck {
            response: command_response,
            ack,
        })
    }
}
