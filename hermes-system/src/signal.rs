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

use crate::headers::Headers;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};

/// Identifier of the entity a signal refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id from anything stringy
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Label of an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckLabel(String);

impl AckLabel {
    /// Creates an acknowledgement label
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// The label as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for AckLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for AckLabel {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

/// What kind of message command a signal carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A message addressed to a thing
    Thing,
    /// A message addressed to a feature of a thing
    Feature {
        /// Id of the addressed feature
        feature_id: String,
    },
    /// A claim message
    Claim,
}

/// A message command: a signal that forwards an opaque message to an
/// external party and expects the response body to travel back to the
/// originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCommand {
    /// The kind of message command
    pub kind: MessageKind,
    /// The message subject
    pub subject: String,
    /// Message specific headers, inherited by the response
    pub headers: Headers,
}

/// The response matching a [`MessageCommand`], built from an external reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// The kind of the originating message command
    pub kind: MessageKind,
    /// The entity the originating command addressed
    pub entity_id: EntityId,
    /// The message subject
    pub subject: String,
    /// HTTP-style status code of the reply
    pub status: u16,
    /// Response headers, inherited from the command and enriched from the reply
    pub headers: Headers,
    /// The reply payload
    pub payload: Option<Value>,
}

/// A typed receipt for a published signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// The acknowledgement label
    pub label: AckLabel,
    /// The entity the acknowledged signal referred to
    pub entity_id: EntityId,
    /// HTTP-style status code
    pub status: u16,
    /// Headers of the acknowledgement
    pub headers: Headers,
    /// Optional payload, e.g. a decoded response body
    pub payload: Option<Value>,
}

/// Umbrella type for internal commands, command-responses and events
/// traveling over the signal bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Type name of the signal, e.g. `things.events:thingModified`
    pub name: String,
    /// The entity the signal refers to
    pub entity_id: EntityId,
    /// The topic the signal is published under
    pub topic: String,
    /// Header bag
    pub headers: Headers,
    /// Optional payload
    pub payload: Option<Value>,
    /// Present if this signal is a message command
    pub message: Option<MessageCommand>,
}

impl Signal {
    /// Creates a bare signal without payload
    pub fn new(name: impl Into<String>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            name: name.into(),
            entity_id: entity_id.into(),
            topic: String::new(),
            headers: Headers::new(),
            payload: None,
            message: None,
        }
    }

    /// Returns a copy published under the given topic
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Returns a copy with the given headers
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Returns a copy with the given payload
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Returns a copy carrying the given message command
    #[must_use]
    pub fn with_message(mut self, message: MessageCommand) -> Self {
        self.message = Some(message);
        self
    }

    /// True if this signal is a message command
    #[must_use]
    pub fn is_message_command(&self) -> bool {
        self.message.is_some()
    }
}

/// An item on the internal signal bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// A mapped inbound signal
    Signal(Signal),
    /// A command response correlated from an external reply
    Response(MessageResponse),
    /// An acknowledgement for a published signal
    Ack(Acknowledgement),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_command_round_trip() -> Result<(), serde_json::Error> {
        let signal = Signal::new("messages.commands:sendMessage", "the-thing")
            .with_topic("live/messages")
            .with_message(MessageCommand {
                kind: MessageKind::Feature {
                    feature_id: "temperature".to_string(),
                },
                subject: "calibrate".to_string(),
                headers: Headers::new().with("content-type", "application/json"),
            });
        let json = serde_json::to_value(&signal)?;
        let back: Signal = serde_json::from_value(json)?;
        assert!(back.is_message_command());
        assert_eq!(back, signal);
        Ok(())
    }
}
