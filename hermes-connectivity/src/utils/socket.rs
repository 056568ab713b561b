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

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Reachability probe errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The endpoint refused or the address did not resolve
    #[error("could not open a socket to {0}:{1}: {2}")]
    Connect(String, u16, #[source] std::io::Error),
    /// Nothing answered within the probe budget
    #[error("no answer from {0}:{1} within {2:?}")]
    Timeout(String, u16, Duration),
}

/// Probes whether a raw TCP connection to `host:port` can be opened within
/// the given budget.
///
/// This runs before any protocol-level connect so that DNS and firewall
/// misconfigurations surface immediately instead of after protocol
/// timeouts.
///
/// # Errors
/// If the endpoint cannot be reached within the budget
pub async fn probe(host: &str, port: u16, budget: Duration) -> Result<(), Error> {
    match timeout(budget, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(Error::Connect(host.to_string(), port, e)),
        Err(_) => Err(Error::Timeout(host.to_string(), port, budget)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_succeeds_against_a_listener() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        probe("127.0.0.1", port, Duration::from_secs(2)).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn probe_fails_against_a_closed_port() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let result = probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(Error::Connect(_, _, _))));
        Ok(())
    }
}
