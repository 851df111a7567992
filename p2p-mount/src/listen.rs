//! Listen bindings: local TCP clients tunneled out to a peer.
//!
//! ```text
//! tcp client ──► TcpListener ──accept──► open_stream(peer, protocol) ──► peer
//! ```
//!
//! Every accepted TCP connection gets its own overlay stream. A connection
//! whose stream cannot be opened within the dial timeout is dropped; the
//! binding keeps accepting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use p2p_mount_net::{Overlay, PeerId};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    Endpoint, Graceful, ListenerInfo, MountConfig, MountError, Result, Role, SessionSet,
    StreamInfo,
};

pub struct ListenBinding {
    shared: Arc<Shared>,
}

struct Shared {
    protocol: String,
    endpoint: Endpoint,
    peer: PeerId,
    overlay: Arc<dyn Overlay>,
    sessions: Arc<SessionSet>,
    graceful: Graceful,
    dial_timeout: Duration,
    buffer_size: usize,
}

impl ListenBinding {
    /// Bind `endpoint` and start accepting. Returns once the port is bound.
    #[tracing::instrument(
        skip_all,
        fields(protocol = %protocol, endpoint = %endpoint, peer = %peer)
    )]
    pub async fn bind(
        protocol: &str,
        endpoint: Endpoint,
        peer: PeerId,
        overlay: Arc<dyn Overlay>,
        config: &MountConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind((endpoint.host(), endpoint.port()))
            .await
            .map_err(|source| MountError::BindFailed {
                address: endpoint.clone(),
                source,
            })?;

        let shared = Arc::new(Shared {
            protocol: protocol.to_string(),
            endpoint,
            peer,
            overlay,
            sessions: SessionSet::new(),
            graceful: Graceful::new(),
            dial_timeout: config.dial_timeout(),
            buffer_size: config.relay_buffer_size(),
        });
        tracing::info!("listening");
        shared.graceful.spawn(accept_loop(shared.clone(), listener));
        Ok(Self { shared })
    }

    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            protocol: self.shared.protocol.clone(),
            target_address: self.shared.endpoint.clone(),
            role: Role::Listen,
            peer: Some(self.shared.peer),
        }
    }

    pub fn sessions(&self) -> Vec<StreamInfo> {
        self.shared.sessions.snapshot()
    }

    /// Stop accepting, cancel every session and wait for all of them. The
    /// port is free again when this returns.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.sessions.cancel_all();
        shared.graceful.shutdown().await;
        tracing::info!(protocol = %shared.protocol, endpoint = %shared.endpoint, "listener closed");
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (tcp, addr) = tokio::select! {
            _ = shared.graceful.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(protocol = %shared.protocol, "failed to accept connection: {e}");
                    continue;
                }
            },
        };
        shared.graceful.spawn(tunnel(shared.clone(), tcp, addr));
    }
    // the listener goes with this task, releasing the port
    tracing::debug!(protocol = %shared.protocol, "accept loop stopped");
}

async fn tunnel(shared: Arc<Shared>, tcp: TcpStream, addr: SocketAddr) {
    let origin = match Endpoint::try_from(addr) {
        Ok(origin) => origin,
        Err(e) => {
            tracing::warn!(protocol = %shared.protocol, %addr, "dropping connection: {e}");
            return;
        }
    };
    let opened = tokio::select! {
        _ = shared.graceful.cancelled() => return,
        opened = tokio::time::timeout(
            shared.dial_timeout,
            shared.overlay.open_stream(&shared.peer, &shared.protocol),
        ) => opened,
    };

    let stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return dial_failed(&shared, &origin, eyre::Error::from(e)),
        Err(_) => {
            let e = eyre::eyre!("no stream within {:?}", shared.dial_timeout);
            return dial_failed(&shared, &origin, e);
        }
    };

    let handle = shared.sessions.insert(
        StreamInfo {
            protocol: shared.protocol.clone(),
            origin_address: origin.clone(),
            target_address: shared.endpoint.clone(),
            peer: shared.peer,
        },
        shared.graceful.child_token(),
    );
    tracing::debug!(
        protocol = %shared.protocol,
        session = handle.id(),
        origin = %origin,
        peer = %shared.peer,
        "session started"
    );
    handle.run(tcp, stream, shared.buffer_size).await;
}

// the TCP connection is dropped by the caller returning
fn dial_failed(shared: &Shared, origin: &Endpoint, source: eyre::Error) {
    let err = MountError::DialFailed {
        target: shared.peer.to_string(),
        source,
    };
    tracing::warn!(protocol = %shared.protocol, origin = %origin, "{err}");
}
