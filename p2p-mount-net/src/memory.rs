//! In-process overlay.
//!
//! A [`MemoryNetwork`] is a set of nodes living in one process; streams
//! between them are `tokio::io::duplex` pipes. It behaves like a real overlay
//! from the point of view of stream mounting: unknown peers are unreachable,
//! peers without a handler reject the protocol, and shutting a node down
//! removes it from the network.

use std::sync::Arc;

use crate::{
    HandlerTable, IncomingStream, Overlay, OverlayError, OverlayStream, PeerId, StreamReceiver,
};

/// Default capacity of each direction of an in-memory stream.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// A set of in-process nodes that can open streams to each other.
#[derive(Clone)]
pub struct MemoryNetwork {
    nodes: Arc<scc::HashMap<PeerId, Arc<HandlerTable>>>,
    pipe_capacity: usize,
    handler_queue: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_pipe_capacity(pipe_capacity: usize) -> Self {
        Self {
            nodes: Arc::new(scc::HashMap::new()),
            pipe_capacity: pipe_capacity.max(1),
            handler_queue: crate::DEFAULT_HANDLER_QUEUE,
        }
    }

    /// Inbound streams queued per protocol on nodes added from now on.
    pub fn with_handler_queue(mut self, handler_queue: usize) -> Self {
        self.handler_queue = handler_queue;
        self
    }

    /// Add a node with a freshly generated identity.
    pub fn node(&self) -> MemoryOverlay {
        self.node_with_key(&crate::generate_secret_key())
    }

    /// Add a node for a known identity. Re-adding an identity replaces the
    /// previous node's handlers.
    pub fn node_with_key(&self, secret_key: &crate::SecretKey) -> MemoryOverlay {
        let id = PeerId::from(secret_key);
        let handlers = Arc::new(HandlerTable::new(self.handler_queue));
        self.nodes.upsert(id, handlers.clone());
        tracing::debug!(peer = %id, "memory node joined");
        MemoryOverlay {
            id,
            handlers,
            network: self.clone(),
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.nodes.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One node of a [`MemoryNetwork`].
pub struct MemoryOverlay {
    id: PeerId,
    handlers: Arc<HandlerTable>,
    network: MemoryNetwork,
}

#[async_trait::async_trait]
impl Overlay for MemoryOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    #[tracing::instrument(skip(self), fields(local = %self.id))]
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<OverlayStream, OverlayError> {
        let Some(remote) = self.network.nodes.read(peer, |_, h| h.clone()) else {
            return Err(OverlayError::Unreachable {
                peer: *peer,
                source: eyre::eyre!("peer is not part of this network"),
            });
        };

        let (local, other) = tokio::io::duplex(self.network.pipe_capacity);
        let incoming = IncomingStream {
            peer: self.id,
            protocol: protocol.to_string(),
            stream: Box::new(other),
        };
        if remote.dispatch(incoming).await.is_err() {
            return Err(OverlayError::Rejected {
                peer: *peer,
                protocol: protocol.to_string(),
                reason: "no handler for protocol".to_string(),
            });
        }
        Ok(Box::new(local))
    }

    fn register_handler(&self, protocol: &str) -> Result<StreamReceiver, OverlayError> {
        if !self.network.contains(&self.id) {
            return Err(OverlayError::Closed);
        }
        self.handlers.register(protocol)
    }

    fn unregister_handler(&self, protocol: &str) -> bool {
        self.handlers.unregister(protocol)
    }

    async fn shutdown(&self) {
        // only remove the entry if it still belongs to this node
        self.network
            .nodes
            .remove_if(&self.id, |h| Arc::ptr_eq(h, &self.handlers));
        self.handlers.clear();
        tracing::debug!(peer = %self.id, "memory node left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn streams_flow_between_nodes() {
        let network = MemoryNetwork::new();
        let a = network.node();
        let b = network.node();

        let mut inbound = b.register_handler("echo").unwrap();
        let mut outbound = a.open_stream(&b.local_peer_id(), "echo").await.unwrap();

        let mut incoming = inbound.recv().await.unwrap();
        assert_eq!(incoming.peer, a.local_peer_id());
        assert_eq!(incoming.protocol, "echo");

        outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn unknown_protocol_is_rejected() {
        let network = MemoryNetwork::new();
        let a = network.node();
        let b = network.node();

        let err = a.open_stream(&b.local_peer_id(), "nope").await.err().unwrap();
        assert!(matches!(err, OverlayError::Rejected { protocol, .. } if protocol == "nope"));
    }

    #[tokio::test]
    async fn full_handler_queue_applies_backpressure() {
        let network = MemoryNetwork::new().with_handler_queue(1);
        let a = network.node();
        let b = network.node();
        let b_id = b.local_peer_id();
        let mut inbound = tokio_test::assert_ok!(b.register_handler("echo"));

        assert!(a.open_stream(&b_id, "echo").await.is_ok());
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            a.open_stream(&b_id, "echo"),
        );
        assert!(blocked.await.is_err());

        assert!(inbound.recv().await.is_some());
        assert!(a.open_stream(&b_id, "echo").await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_makes_node_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.node();
        let b = network.node();
        let _inbound = b.register_handler("echo").unwrap();

        b.shutdown().await;
        assert!(!network.contains(&b.local_peer_id()));
        assert_eq!(network.len(), 1);

        let err = a.open_stream(&b.local_peer_id(), "echo").await.err().unwrap();
        assert!(matches!(err, OverlayError::Unreachable { .. }));
        assert!(matches!(b.register_handler("echo"), Err(OverlayError::Closed)));
    }
}
