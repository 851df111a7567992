//! Forward bindings: inbound overlay streams tunneled to a local TCP target.
//!
//! ```text
//! peer ──► overlay handler(protocol) ──► TcpStream::connect(target)
//! ```
//!
//! A binding either serves one authorised peer, dropping streams from
//! anyone else on arrival, or serves whichever peer opens a stream.

use std::sync::Arc;
use std::time::Duration;

use p2p_mount_net::{IncomingStream, Overlay, OverlayError, PeerId, StreamReceiver};
use tokio::net::TcpStream;

use crate::{
    Endpoint, Graceful, ListenerInfo, MountConfig, MountError, Result, Role, SessionSet,
    StreamInfo,
};

pub struct ForwardBinding {
    shared: Arc<Shared>,
}

struct Shared {
    protocol: String,
    target: Endpoint,
    /// `None` serves any peer.
    peer: Option<PeerId>,
    overlay: Arc<dyn Overlay>,
    sessions: Arc<SessionSet>,
    graceful: Graceful,
    dial_timeout: Duration,
    buffer_size: usize,
}

impl ForwardBinding {
    /// Register the overlay handler for `protocol` and start serving it,
    /// to `peer` only or, without one, to every peer.
    #[tracing::instrument(
        skip_all,
        fields(protocol = %protocol, target = %target, peer = ?peer)
    )]
    pub fn register(
        protocol: &str,
        target: Endpoint,
        peer: Option<PeerId>,
        overlay: Arc<dyn Overlay>,
        config: &MountConfig,
    ) -> Result<Self> {
        let receiver = overlay.register_handler(protocol).map_err(|e| match e {
            OverlayError::AlreadyRegistered(protocol) => MountError::ProtocolInUse(protocol),
            e => MountError::Overlay(e),
        })?;

        let shared = Arc::new(Shared {
            protocol: protocol.to_string(),
            target,
            peer,
            overlay,
            sessions: SessionSet::new(),
            graceful: Graceful::new(),
            dial_timeout: config.dial_timeout(),
            buffer_size: config.relay_buffer_size(),
        });
        tracing::info!("forwarding");
        shared.graceful.spawn(accept_loop(shared.clone(), receiver));
        Ok(Self { shared })
    }

    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            protocol: self.shared.protocol.clone(),
            target_address: self.shared.target.clone(),
            role: Role::Forward,
            peer: self.shared.peer,
        }
    }

    pub fn sessions(&self) -> Vec<StreamInfo> {
        self.shared.sessions.snapshot()
    }

    /// Unregister the handler, then cancel and wait for every session.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.overlay.unregister_handler(&shared.protocol);
        shared.sessions.cancel_all();
        shared.graceful.shutdown().await;
        tracing::info!(protocol = %shared.protocol, target = %shared.target, "forward closed");
    }
}

async fn accept_loop(shared: Arc<Shared>, mut receiver: StreamReceiver) {
    loop {
        let incoming = tokio::select! {
            _ = shared.graceful.cancelled() => break,
            incoming = receiver.recv() => match incoming {
                Some(incoming) => incoming,
                None => {
                    tracing::info!(protocol = %shared.protocol, "handler released by the overlay");
                    break;
                }
            },
        };

        if shared.peer.is_some_and(|peer| peer != incoming.peer) {
            tracing::warn!(
                protocol = %shared.protocol,
                peer = %incoming.peer,
                "dropping stream from unauthorised peer"
            );
            continue;
        }
        shared.graceful.spawn(tunnel(shared.clone(), incoming));
    }
    tracing::debug!(protocol = %shared.protocol, "accept loop stopped");
}

async fn tunnel(shared: Arc<Shared>, incoming: IncomingStream) {
    let target = &shared.target;
    let dialed = tokio::select! {
        _ = shared.graceful.cancelled() => return,
        dialed = tokio::time::timeout(
            shared.dial_timeout,
            TcpStream::connect((target.host(), target.port())),
        ) => dialed,
    };

    let tcp = match dialed {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => return dial_failed(&shared, &incoming, eyre::Error::from(e)),
        Err(_) => {
            let e = eyre::eyre!("no connection within {:?}", shared.dial_timeout);
            return dial_failed(&shared, &incoming, e);
        }
    };

    let origin = match tcp.local_addr().map(Endpoint::try_from) {
        Ok(Ok(origin)) => origin,
        Ok(Err(e)) => {
            tracing::warn!(protocol = %shared.protocol, "unusable local address: {e}");
            return;
        }
        Err(e) => {
            let err = MountError::StreamError(e);
            tracing::warn!(protocol = %shared.protocol, "{err}");
            return;
        }
    };

    let handle = shared.sessions.insert(
        StreamInfo {
            protocol: shared.protocol.clone(),
            origin_address: origin.clone(),
            target_address: target.clone(),
            peer: incoming.peer,
        },
        shared.graceful.child_token(),
    );
    tracing::debug!(
        protocol = %shared.protocol,
        session = handle.id(),
        origin = %origin,
        peer = %incoming.peer,
        "session started"
    );
    handle.run(incoming.stream, tcp, shared.buffer_size).await;
}

// dropping `incoming` closes the overlay stream
fn dial_failed(shared: &Shared, incoming: &IncomingStream, source: eyre::Error) {
    let err = MountError::DialFailed {
        target: shared.target.to_string(),
        source,
    };
    tracing::warn!(protocol = %shared.protocol, peer = %incoming.peer, "{err}");
}
