//! Peer coordination glue.
//!
//! Instances announce completed pushes to each other so every peer can pull
//! promptly instead of waiting for its next scheduled sync. The transport is
//! deliberately opaque; this module defines the message shape, the announcer
//! trait, and two implementations: a `tokio::sync::broadcast` channel for
//! same-process wiring and tests, and a null notifier for local-only
//! operation when no transport is configured.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::log_event;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer channel closed")]
    ChannelClosed,

    #[error("malformed peer message: {raw:?}")]
    Malformed { raw: String },
}

/// Stable identity of one running instance. Notifications carry the sender's
/// id so a peer can recognize its own announcement echoed back and skip the
/// pull (loopback suppression by identity, not by message text).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an id from the host name and process id. Used when the
    /// configuration does not pin one.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
        Self(format!("{}/{}", host, std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One push announcement: who pushed, and the remote it pushed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub origin: InstanceId,
    pub remote_ref: String,
}

impl PeerMessage {
    /// Wire form of the payload, without the origin (the transport carries
    /// sender identity separately).
    pub fn encode(&self) -> String {
        format!("pushed {}", self.remote_ref)
    }

    /// Parses a `pushed <remote-ref>` payload from `origin`.
    pub fn parse(origin: InstanceId, raw: &str) -> Result<Self, PeerError> {
        match raw.trim().strip_prefix("pushed ") {
            Some(remote_ref) if !remote_ref.trim().is_empty() => Ok(Self {
                origin,
                remote_ref: remote_ref.trim().to_owned(),
            }),
            _ => Err(PeerError::Malformed {
                raw: raw.to_owned(),
            }),
        }
    }
}

/// Outbound announcement channel. Best effort: implementations log failures
/// and never propagate them as fatal.
#[async_trait]
pub trait PeerNotifier: Send + Sync {
    async fn announce(&self, message: PeerMessage) -> Result<(), PeerError>;
}

/// Same-process notifier over a broadcast channel. Every subscriber receives
/// every announcement, including the sender's own (loopback filtering is the
/// receiver's job).
pub struct ChannelPeerNotifier {
    tx: broadcast::Sender<PeerMessage>,
}

impl ChannelPeerNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerMessage> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl PeerNotifier for ChannelPeerNotifier {
    async fn announce(&self, message: PeerMessage) -> Result<(), PeerError> {
        // send only fails with zero subscribers, which is not an error here
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Local-only operation: announcements are logged and dropped.
pub struct NullPeerNotifier;

#[async_trait]
impl PeerNotifier for NullPeerNotifier {
    async fn announce(&self, message: PeerMessage) -> Result<(), PeerError> {
        log_event!(
            "peer",
            "no transport",
            "dropping announcement `{}`",
            message.encode()
        );
        Ok(())
    }
}
