//! Outgoing envelopes and fully received messages

use bytes::{Bytes, BytesMut};
use fe3o4_amqp_types::properties::Properties;

/// A message to be published: its properties plus the body bytes
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// The content header properties sent along with the body
    pub properties: Properties,
    body: Bytes,
}

impl Envelope {
    /// An envelope around a body with default properties
    pub fn new(body: impl Into<Bytes>) -> Self {
        Envelope {
            properties: Properties::default(),
            body: body.into(),
        }
    }

    /// An envelope with explicit properties
    pub fn with_properties(body: impl Into<Bytes>, properties: Properties) -> Self {
        Envelope {
            properties,
            body: body.into(),
        }
    }

    /// The body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Size of the body in bytes
    pub fn body_size(&self) -> u64 {
        self.body.len() as u64
    }
}

impl From<&str> for Envelope {
    fn from(body: &str) -> Self {
        Envelope::new(Bytes::copy_from_slice(body.as_bytes()))
    }
}

impl From<Vec<u8>> for Envelope {
    fn from(body: Vec<u8>) -> Self {
        Envelope::new(body)
    }
}

/// A message received from the broker
///
/// Assembled from a deliver, get-ok or return method frame, the content
/// header that followed it and zero or more body frames.
#[derive(Debug)]
pub struct Message {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: BytesMut,
}

impl Message {
    pub(crate) fn new(exchange: String, routing_key: String) -> Self {
        Message {
            exchange,
            routing_key,
            properties: Properties::default(),
            body: BytesMut::new(),
        }
    }

    pub(crate) fn set_properties(&mut self, properties: Properties) {
        self.properties = properties;
    }

    pub(crate) fn reserve(&mut self, size: usize) {
        self.body.reserve(size);
    }

    pub(crate) fn append(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// The exchange the message was published to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The routing key it was published with
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The content header properties
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The assembled body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume the message and take the body
    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }
}
