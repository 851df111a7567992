//! The overlay network as seen by stream mounting.
//!
//! Stream mounting needs four things from the network below it: the local
//! peer id, a way to open an outbound stream to a peer for a protocol, and a
//! way to register (and later drop) interest in inbound streams for a
//! protocol. Inbound streams are delivered on a bounded channel, one per
//! registered protocol.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::PeerId;

/// Default number of inbound streams queued per registered protocol.
pub const DEFAULT_HANDLER_QUEUE: usize = 64;

/// Combined trait for async read + write
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// A bidirectional byte stream on the overlay. Payload is opaque.
pub type OverlayStream = Box<dyn Duplex>;

/// An inbound stream, already matched to a registered protocol.
pub struct IncomingStream {
    /// Peer that opened the stream
    pub peer: PeerId,
    /// Protocol the stream was opened for
    pub protocol: String,
    pub stream: OverlayStream,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Receiving end of a protocol registration.
///
/// Yields `None` once the protocol is unregistered or the overlay shuts down.
pub type StreamReceiver = tokio::sync::mpsc::Receiver<IncomingStream>;

/// Errors reported by an overlay.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("peer {peer} is unreachable: {source}")]
    Unreachable { peer: PeerId, source: eyre::Error },

    #[error("peer {peer} refused protocol {protocol:?}: {reason}")]
    Rejected {
        peer: PeerId,
        protocol: String,
        reason: String,
    },

    #[error("protocol {0:?} already has a handler")]
    AlreadyRegistered(String),

    #[error("stream error: {source}")]
    Stream { source: eyre::Error },

    #[error("overlay is shut down")]
    Closed,
}

/// The overlay network collaborator.
#[async_trait::async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// Identity of this node.
    fn local_peer_id(&self) -> PeerId;

    /// Open a new outbound stream to `peer` for `protocol`.
    ///
    /// Resolves once the remote side has accepted the protocol.
    async fn open_stream(&self, peer: &PeerId, protocol: &str)
    -> Result<OverlayStream, OverlayError>;

    /// Start receiving inbound streams for `protocol`.
    fn register_handler(&self, protocol: &str) -> Result<StreamReceiver, OverlayError>;

    /// Stop receiving inbound streams for `protocol`. Returns `false` if no
    /// handler was registered.
    fn unregister_handler(&self, protocol: &str) -> bool;

    /// Release network resources. Called after every binding is closed.
    async fn shutdown(&self) {}
}

/// Table of registered protocols and the channels feeding their handlers.
///
/// Shared by the overlay implementations in this crate.
pub struct HandlerTable {
    handlers: scc::HashMap<String, tokio::sync::mpsc::Sender<IncomingStream>>,
    queue: usize,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_QUEUE)
    }
}

impl HandlerTable {
    pub fn new(queue: usize) -> Self {
        Self {
            handlers: scc::HashMap::new(),
            queue: queue.max(1),
        }
    }

    pub fn register(&self, protocol: &str) -> Result<StreamReceiver, OverlayError> {
        let (tx, rx) = tokio::sync::mpsc::channel(self.queue);
        self.handlers
            .insert(protocol.to_string(), tx)
            .map_err(|(protocol, _)| OverlayError::AlreadyRegistered(protocol))?;
        tracing::debug!(protocol, "registered stream handler");
        Ok(rx)
    }

    pub fn unregister(&self, protocol: &str) -> bool {
        let removed = self.handlers.remove(protocol).is_some();
        if removed {
            tracing::debug!(protocol, "unregistered stream handler");
        }
        removed
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.handlers.contains(protocol)
    }

    /// Drop every registration; all receivers observe `None`.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Hand an inbound stream to its protocol handler.
    ///
    /// Gives the stream back if no handler is registered or the handler has
    /// gone away.
    pub async fn dispatch(&self, incoming: IncomingStream) -> Result<(), IncomingStream> {
        let Some(tx) = self.handlers.read(&incoming.protocol, |_, tx| tx.clone()) else {
            return Err(incoming);
        };
        tx.send(incoming).await.map_err(|e| e.0)
    }
}
