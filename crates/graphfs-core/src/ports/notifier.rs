//! Realtime-notification transport port
//!
//! A push channel to the remote store that signals "something changed";
//! the payload is opaque. The Change Notifier facade in `graphfs-engine`
//! owns reconnection, backoff, and health accounting; this port is only
//! the raw transport.

use async_trait::async_trait;

use crate::error::CoreError;

/// An open push subscription.
#[async_trait]
pub trait NotifyStream: Send {
    /// Wait for the next push signal.
    ///
    /// `Ok(Some(()))`: the remote reported a change (payload is opaque).
    /// `Ok(None)`: the subscription lapsed and must be renewed.
    /// `Err(_)`: transport failure; the caller reconnects with backoff.
    async fn next_signal(&mut self) -> Result<Option<()>, CoreError>;
}

/// Transport capable of opening push subscriptions.
#[async_trait]
pub trait NotifierTransport: Send + Sync {
    /// Open a subscription to the drive's change channel.
    async fn subscribe(&self) -> Result<Box<dyn NotifyStream>, CoreError>;
}
