//! Delivery capability: what the pool needs from a transport.
//!
//! A transport opens channels bound to one conversation at a time; a channel can be
//! repointed at another conversation, sent into, and closed. The pool depends only on
//! these traits, so tests can supply an in-memory transport.

use crate::events::Payload;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("delivery api error: {0}")]
    Api(String),
    #[error("delivery io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// A stateful delivery resource bound to exactly one conversation at a time.
#[async_trait]
pub trait DeliveryChannel: Send {
    /// Conversation this channel currently delivers into.
    fn conversation_id(&self) -> &str;

    /// Rebind to another conversation (e.g. navigate to a different thread).
    async fn repoint(&mut self, conversation_id: &str) -> Result<(), DeliveryError>;

    async fn send(&mut self, payload: &Payload) -> Result<(), DeliveryError>;

    /// Release the underlying resource. The channel is not used afterwards.
    async fn close(&mut self);
}

/// Transport that can open delivery channels.
#[async_trait]
pub trait ChannelCapability: Send + Sync {
    /// Transport id (e.g. "telegram").
    fn id(&self) -> &str;

    /// Create and initialize a channel for a conversation.
    async fn open(&self, conversation_id: &str) -> Result<Box<dyn DeliveryChannel>, DeliveryError>;

    /// Stop inbound connectors, if any. Default does nothing.
    fn stop(&self) {}
}
