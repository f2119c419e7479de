//! Member-to-member transport
//!
//! Components never talk to the network directly: they hand a
//! [`SystemMessage`] to a [`Transport`] and get back the response payload or
//! the remote error. The node binary provides an HTTP implementation; tests
//! wire several nodes together in one process with [`LocalTransport`].

use async_trait::async_trait;
use dashmap::DashMap;
use kvmesh_common::{Error, Member, Result};
use kvmesh_proto::{SystemMessage, SystemResponse, decode_message};
use prost::Message;
use std::sync::Arc;

/// Sends system messages to other members
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to `target` and wait for its response payload
    async fn request(&self, target: &Member, message: SystemMessage) -> Result<Vec<u8>>;
}

/// Receives system messages on behalf of a node
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one request and produce its response payload
    async fn handle(&self, message: SystemMessage) -> Result<Vec<u8>>;
}

/// In-process transport routing messages between registered handlers
///
/// Requests and responses are encoded and decoded exactly as on the wire.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl LocalTransport {
    /// Create an empty transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler serving `name`
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Remove a handler; later requests to it fail with `ConnectionFailed`
    pub fn unregister(&self, name: &str) {
        self.handlers.remove(name);
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check whether no handler is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&self, target: &Member, message: SystemMessage) -> Result<Vec<u8>> {
        let handler = self
            .handlers
            .get(target.name())
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::ConnectionFailed(format!("{target} is not reachable")))?;

        let request: SystemMessage = decode_message(&message.encode_to_vec())?;
        let response = SystemResponse::from_result(handler.handle(request).await);
        decode_message::<SystemResponse>(&response.encode_to_vec())?.into_result()
    }
}
