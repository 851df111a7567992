//! Overlay backed by an iroh endpoint.
//!
//! One ALPN ([`ALPN`]) carries every mount protocol; each tunneled connection
//! is one bidirectional QUIC stream that starts with the header exchange from
//! [`crate::protocol`]. Connections to a peer are cached and reused while
//! they stay open, so many tunneled TCP connections to the same peer share a
//! single QUIC connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::protocol::{self, Reply};
use crate::{
    Duplex, HandlerTable, IncomingStream, Overlay, OverlayError, OverlayStream, PeerId, SecretKey,
    StreamReceiver,
};

/// ALPN shared by all p2p-mount connections.
pub const ALPN: &[u8] = b"/p2p-mount/0.1";

/// How long an inbound stream may take to send its header.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// A QUIC bidirectional stream as one duplex byte stream.
pub struct IrohStream {
    send: iroh::endpoint::SendStream,
    recv: iroh::endpoint::RecvStream,
}

impl IrohStream {
    pub fn new(send: iroh::endpoint::SendStream, recv: iroh::endpoint::RecvStream) -> Self {
        Self { send, recv }
    }
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    // finishes the QUIC send stream; the peer reads EOF
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Overlay node on the iroh network.
pub struct IrohOverlay {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: iroh::Endpoint,
    local: PeerId,
    handlers: HandlerTable,
    connections: tokio::sync::Mutex<HashMap<iroh::NodeId, iroh::endpoint::Connection>>,
    addresses: scc::HashMap<iroh::NodeId, iroh::NodeAddr>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl IrohOverlay {
    /// Bind a new iroh endpoint for `secret_key` with n0 discovery.
    ///
    /// `handler_queue` bounds the inbound streams waiting per protocol.
    pub async fn bind(secret_key: &SecretKey, handler_queue: usize) -> eyre::Result<Self> {
        let endpoint = iroh::Endpoint::builder()
            .discovery_n0()
            .alpns(vec![ALPN.to_vec()])
            .secret_key(iroh::SecretKey::from_bytes(&secret_key.to_bytes()))
            .bind()
            .await
            // https://github.com/n0-computer/iroh/issues/2741
            .map_err(|e| eyre::eyre!("failed to bind to iroh network: {e:?}"))?;

        tracing::info!(node_id = %endpoint.node_id(), "iroh endpoint bound");
        Self::from_endpoint(endpoint, handler_queue)
    }

    /// Wrap an endpoint that was built elsewhere. It must accept [`ALPN`].
    pub fn from_endpoint(endpoint: iroh::Endpoint, handler_queue: usize) -> eyre::Result<Self> {
        let local = PeerId::from_bytes(endpoint.node_id().as_bytes())?;
        let inner = Arc::new(Inner {
            endpoint,
            local,
            handlers: HandlerTable::new(handler_queue),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            addresses: scc::HashMap::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        inner.tracker.spawn(accept_loop(inner.clone()));
        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> &iroh::Endpoint {
        &self.inner.endpoint
    }

    /// Dial `peer` at these addresses from now on, in addition to whatever
    /// discovery finds. Needed on networks without discovery.
    pub fn add_direct_addresses(
        &self,
        peer: &PeerId,
        addrs: impl IntoIterator<Item = SocketAddr>,
    ) -> eyre::Result<()> {
        let node_id = node_id(peer)?;
        let addr = iroh::NodeAddr::new(node_id).with_direct_addresses(addrs);
        self.inner.addresses.upsert(node_id, addr);
        Ok(())
    }

    async fn connection(
        &self,
        peer: &PeerId,
    ) -> Result<iroh::endpoint::Connection, OverlayError> {
        let node_id = node_id(peer).map_err(|source| OverlayError::Unreachable {
            peer: *peer,
            source,
        })?;

        if let Some(conn) = self.inner.connections.lock().await.get(&node_id) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            tracing::debug!(%peer, "cached connection closed, reconnecting");
        }

        // the cache stays unlocked while dialing
        let addr = self
            .inner
            .addresses
            .read(&node_id, |_, addr| addr.clone())
            .unwrap_or_else(|| node_id.into());
        let conn = self
            .inner
            .endpoint
            .connect(addr, ALPN)
            .await
            .map_err(|e| OverlayError::Unreachable {
                peer: *peer,
                source: eyre::eyre!("{e:?}"),
            })?;

        let mut connections = self.inner.connections.lock().await;
        match connections.get(&node_id) {
            // lost a race with another dial; ours closes when dropped
            Some(existing) if existing.close_reason().is_none() => Ok(existing.clone()),
            _ => {
                connections.insert(node_id, conn.clone());
                Ok(conn)
            }
        }
    }
}

fn node_id(peer: &PeerId) -> eyre::Result<iroh::NodeId> {
    iroh::NodeId::from_bytes(peer.as_bytes()).map_err(|e| eyre::eyre!("invalid node id: {e:?}"))
}

#[async_trait::async_trait]
impl Overlay for IrohOverlay {
    fn local_peer_id(&self) -> PeerId {
        self.inner.local
    }

    #[tracing::instrument(skip(self))]
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<OverlayStream, OverlayError> {
        if self.inner.cancel.is_cancelled() {
            return Err(OverlayError::Closed);
        }

        let conn = self.connection(peer).await?;
        let (send, recv) = conn.open_bi().await.map_err(|e| OverlayError::Stream {
            source: eyre::Error::from(e),
        })?;
        let mut stream = IrohStream::new(send, recv);

        protocol::send_header(&mut stream, protocol)
            .await
            .map_err(|e| OverlayError::Stream {
                source: eyre::Error::from(e),
            })?;
        let reply = protocol::read_reply(&mut stream)
            .await
            .map_err(|e| OverlayError::Stream {
                source: eyre::Error::from(e),
            })?;

        match reply {
            Reply::Ack => Ok(Box::new(stream)),
            Reply::Rejected(reason) => Err(OverlayError::Rejected {
                peer: *peer,
                protocol: protocol.to_string(),
                reason,
            }),
        }
    }

    fn register_handler(&self, protocol: &str) -> Result<StreamReceiver, OverlayError> {
        if self.inner.cancel.is_cancelled() {
            return Err(OverlayError::Closed);
        }
        self.inner.handlers.register(protocol)
    }

    fn unregister_handler(&self, protocol: &str) -> bool {
        self.inner.handlers.unregister(protocol)
    }

    async fn shutdown(&self) {
        tracing::info!(node_id = %self.inner.local, "shutting down iroh overlay");
        self.inner.cancel.cancel();
        self.inner.handlers.clear();
        self.inner.connections.lock().await.clear();
        self.inner.tracker.close();
        self.inner.endpoint.close().await;
        self.inner.tracker.wait().await;
    }
}

impl Drop for IrohOverlay {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn accept_loop(inner: Arc<Inner>) {
    loop {
        let incoming = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            incoming = inner.endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => {
                    tracing::info!("iroh endpoint closed");
                    break;
                }
            },
        };

        let conn_inner = inner.clone();
        inner.tracker.spawn(async move {
            if let Err(e) = handle_connection(conn_inner, incoming).await {
                tracing::debug!("connection ended: {e:?}");
            }
        });
    }
}

async fn handle_connection(
    inner: Arc<Inner>,
    incoming: iroh::endpoint::Incoming,
) -> eyre::Result<()> {
    let conn = incoming.await?;
    let remote = conn
        .remote_node_id()
        .map_err(|e| eyre::eyre!("no remote node id: {e:?}"))?;
    let peer = PeerId::from_bytes(remote.as_bytes())?;
    tracing::debug!(%peer, "connection established");

    loop {
        let (send, recv) = tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            accepted = conn.accept_bi() => accepted?,
        };

        let stream_inner = inner.clone();
        inner.tracker.spawn(async move {
            let stream = IrohStream::new(send, recv);
            if let Err(e) =
                handle_stream(&stream_inner.handlers, peer, stream, HEADER_TIMEOUT).await
            {
                tracing::warn!(%peer, "failed to accept stream: {e}");
            }
        });
    }
}

async fn handle_stream<S: Duplex + 'static>(
    handlers: &HandlerTable,
    peer: PeerId,
    mut stream: S,
    header_timeout: Duration,
) -> Result<(), protocol::FramingError> {
    let read = tokio::time::timeout(header_timeout, protocol::read_header(&mut stream));
    let header = match read.await {
        Ok(header) => header?,
        Err(_) => {
            tracing::debug!(%peer, "no header within {header_timeout:?}, dropping stream");
            return Ok(());
        }
    };

    if !handlers.contains(&header.protocol) {
        tracing::warn!(%peer, protocol = %header.protocol, "no handler for protocol");
        let reason = format!("no handler for protocol {:?}", header.protocol);
        protocol::send_reply(&mut stream, &Reply::Rejected(reason)).await?;
        tokio::io::AsyncWriteExt::shutdown(&mut stream).await?;
        return Ok(());
    }

    protocol::send_reply(&mut stream, &Reply::Ack).await?;
    let incoming = IncomingStream {
        peer,
        protocol: header.protocol,
        stream: Box::new(stream),
    };
    if let Err(incoming) = handlers.dispatch(incoming).await {
        // handler went away between the check and the dispatch
        tracing::debug!(%peer, protocol = %incoming.protocol, "dropping stream");
    }
    Ok(())
}
