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

/// Request construction and response decoding helpers
pub mod meta;
/// The HTTP-push transport and publisher flow
pub mod push;

use crate::publisher::PublishTarget;
use base64::Engine;
use hermes_system::connection::Connection;
use serde::Deserialize;
use http::header::{HeaderValue, AUTHORIZATION};
use hyper::Method;
use url::Url;

/// HTTP layer errors; folded into the connectivity error taxonomy at the
/// publish seam
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The target address names a method the HTTP spec does not know
    #[error("invalid HTTP method in target address '{0}'")]
    InvalidMethod(String),
    /// The target address does not resolve to a valid URL
    #[error("invalid request URL '{0}'")]
    InvalidUrl(String),
    /// An external header name is no valid HTTP header name
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    /// An external header value is no valid HTTP header value
    #[error("invalid value for header '{0}'")]
    InvalidHeaderValue(String),
    /// The external content type does not parse
    #[error("invalid content type '{0}'")]
    InvalidContentType(String),
    /// The request could not be assembled
    #[error("could not assemble the request: {0}")]
    Request(String),
}

/// Authentication for requests to the endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Auth {
    /// No authentication
    #[default]
    None,
    /// HTTP basic auth
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token auth
    Bearer {
        /// The token
        token: String,
    },
}

impl Auth {
    fn as_header_value(&self) -> Result<Option<HeaderValue>, Error> {
        let raw = match self {
            Self::None => return Ok(None),
            Self::Basic { username, password } => {
                let credentials =
                    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
                format!("Basic {credentials}")
            }
            Self::Bearer { token } => format!("Bearer {token}"),
        };
        let mut value = HeaderValue::from_str(&raw)
            .map_err(|_| Error::InvalidHeaderValue(AUTHORIZATION.to_string()))?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

/// Builds the base request for every publish to one connection: method,
/// URI and authentication come from the connection and target
/// configuration, never from the published message.
#[derive(Debug, Clone)]
pub struct HttpPushFactory {
    default_method: Method,
    base_url: Url,
    auth: Auth,
}

impl HttpPushFactory {
    /// A factory for the endpoint of the given connection
    ///
    /// # Errors
    /// If the connection URI does not form a valid HTTP base URL
    pub fn from_connection(connection: &Connection) -> Result<Self, Error> {
        let scheme = &connection.uri.scheme;
        if scheme != "http" && scheme != "https" {
            return Err(Error::InvalidUrl(connection.uri.to_string()));
        }
        let raw = format!("{scheme}://{}:{}/", connection.uri.host, connection.uri.port);
        let base_url = Url::parse(&raw).map_err(|_| Error::InvalidUrl(raw))?;
        Ok(Self {
            default_method: Method::POST,
            base_url,
            auth: Auth::None,
        })
    }

    /// Returns the factory with the given authentication
    #[must_use]
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// True if the factory points at an `https` endpoint
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.base_url.scheme() == "https"
    }

    /// Method and URL for a publish to the given target. Target addresses
    /// are `<METHOD>:<path>` or a bare path; the path is resolved against
    /// the connection endpoint.
    ///
    /// # Errors
    /// If the address carries an unknown method or an unresolvable path
    pub fn resolve(&self, target: &PublishTarget) -> Result<(Method, Url), Error> {
        let (method, path) = split_address(&target.address);
        let method = match method {
            Some(raw) => Method::from_bytes(raw.as_bytes())
                .map_err(|_| Error::InvalidMethod(target.address.clone()))?,
            None => self.default_method.clone(),
        };
        let url = self
            .base_url
            .join(&path)
            .map_err(|_| Error::InvalidUrl(target.address.clone()))?;
        Ok((method, url))
    }

    pub(crate) fn auth_header(&self) -> Result<Option<HeaderValue>, Error> {
        self.auth.as_header_value()
    }
}

/// Splits `METHOD:path` target addresses; everything else is a bare path.
fn split_address(address: &str) -> (Option<String>, String) {
    if let Some((method, rest)) = address.split_once(':') {
        if !rest.starts_with("//") && !method.is_empty() && method.chars().all(|c| c.is_ascii_alphabetic()) {
            return (Some(method.to_uppercase()), rest.to_string());
        }
    }
    (None, address.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use hermes_system::connection::{ConnectionId, ConnectionUri, DesiredStatus};

    fn connection(scheme: &str) -> Connection {
        Connection {
            id: ConnectionId::new("conn-http"),
            uri: ConnectionUri {
                scheme: scheme.to_string(),
                host: "svc".to_string(),
                port: 8080,
            },
            desired_status: DesiredStatus::Open,
            sources: vec![],
            targets: vec![],
            mapping_context: None,
            processor_pool_size: 1,
        }
    }

    #[test]
    fn resolves_method_and_path() -> Result<(), Error> {
        let factory = HttpPushFactory::from_connection(&connection("http"))?;
        let (method, url) = factory.resolve(&PublishTarget {
            address: "PUT:/ingest/things".to_string(),
        })?;
        assert_eq!(method, Method::PUT);
        assert_eq!(url.as_str(), "http://svc:8080/ingest/things");
        Ok(())
    }

    #[test]
    fn bare_paths_use_the_default_method() -> Result<(), Error> {
        let factory = HttpPushFactory::from_connection(&connection("http"))?;
        let (method, url) = factory.resolve(&PublishTarget {
            address: "/ack".to_string(),
        })?;
        assert_eq!(method, Method::POST);
        assert_eq!(url.as_str(), "http://svc:8080/ack");
        Ok(())
    }

    #[test]
    fn rejects_non_http_schemes() {
        let result = HttpPushFactory::from_connection(&connection("amqp"));
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn basic_auth_is_marked_sensitive() -> Result<(), Error> {
        let auth = Auth::Basic {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let value = auth.as_header_value()?.expect("a header value");
        assert!(value.is_sensitive());
        Ok(())
    }
}
