//! The table of mounted protocols of one overlay node.

use std::collections::BTreeMap;
use std::sync::Arc;

use p2p_mount_net::{Overlay, PeerId};

use crate::error::parse_peer;
use crate::{
    Binding, Endpoint, ForwardBinding, ListenBinding, ListenerInfo, MountConfig, MountError,
    Result, StreamInfo,
};

/// Mounted protocols of one overlay node, at most one binding per protocol.
///
/// Every mutation holds the table lock until the binding is fully set up or
/// fully torn down, so concurrent `listen`/`forward`/`close` calls for the
/// same protocol are seen in a single order.
///
/// ```no_run
/// # async fn demo() -> Result<(), p2p_mount::MountError> {
/// use std::sync::Arc;
/// use p2p_mount::{MountConfig, TunnelRegistry};
/// use p2p_mount_net::{MemoryNetwork, Overlay};
///
/// let network = MemoryNetwork::new();
/// let registry = TunnelRegistry::new(Arc::new(network.node()), MountConfig::default());
/// let server = network.node().local_peer_id().to_string();
///
/// registry.listen("demo", "/ip4/127.0.0.1/tcp/8765", Some(&server)).await?;
/// let (listeners, streams) = registry.list().await;
/// assert_eq!(listeners.len(), 1);
/// assert!(streams.is_empty());
///
/// registry.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TunnelRegistry {
    overlay: Arc<dyn Overlay>,
    config: MountConfig,
    bindings: tokio::sync::Mutex<BTreeMap<String, Binding>>,
}

impl TunnelRegistry {
    pub fn new(overlay: Arc<dyn Overlay>, config: MountConfig) -> Self {
        Self {
            overlay,
            config,
            bindings: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// A registry on a fresh iroh node for `secret_key`.
    #[cfg(feature = "iroh")]
    pub async fn bind_iroh(
        secret_key: &p2p_mount_net::SecretKey,
        config: MountConfig,
    ) -> eyre::Result<Self> {
        let overlay = p2p_mount_net::IrohOverlay::bind(secret_key, config.handler_queue).await?;
        Ok(Self::new(Arc::new(overlay), config))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.overlay.local_peer_id()
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Accept TCP connections on `local_addr` and tunnel each one to
    /// `peer_target` under `protocol`.
    ///
    /// Without a `peer_target` the configured default peer is used. With
    /// neither, nothing is bound and [`MountError::NoPeerTarget`] is
    /// returned.
    #[tracing::instrument(skip(self))]
    pub async fn listen(
        &self,
        protocol: &str,
        local_addr: &str,
        peer_target: Option<&str>,
    ) -> Result<ListenerInfo> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains_key(protocol) {
            return Err(MountError::ProtocolInUse(protocol.to_string()));
        }

        let endpoint = Endpoint::parse(local_addr)?;
        let peer = match (peer_target, self.config.default_peer) {
            (Some(peer), _) => parse_peer(peer)?,
            (None, Some(peer)) => peer,
            (None, None) => return Err(MountError::NoPeerTarget(protocol.to_string())),
        };

        let binding =
            ListenBinding::bind(protocol, endpoint, peer, self.overlay.clone(), &self.config)
                .await?;
        let info = binding.info();
        bindings.insert(protocol.to_string(), binding.into());
        Ok(info)
    }

    /// Serve inbound overlay streams for `protocol` by connecting each one
    /// to `local_addr`. With a `peer_id` only that peer is served, without
    /// one any peer is.
    #[tracing::instrument(skip(self))]
    pub async fn forward(
        &self,
        protocol: &str,
        local_addr: &str,
        peer_id: Option<&str>,
    ) -> Result<ListenerInfo> {
        let mut bindings = self.bindings.lock().await;
        if bindings.contains_key(protocol) {
            return Err(MountError::ProtocolInUse(protocol.to_string()));
        }

        let target = Endpoint::parse(local_addr)?;
        let peer = peer_id.map(parse_peer).transpose()?;

        // last fallible step; nothing is registered when it fails
        let binding =
            ForwardBinding::register(protocol, target, peer, self.overlay.clone(), &self.config)?;
        let info = binding.info();
        bindings.insert(protocol.to_string(), binding.into());
        Ok(info)
    }

    /// Every binding, ordered by protocol, and every live session.
    pub async fn list(&self) -> (Vec<ListenerInfo>, Vec<StreamInfo>) {
        let bindings = self.bindings.lock().await;
        let listeners = bindings.values().map(Binding::listener_info).collect();
        let streams = bindings.values().flat_map(Binding::sessions).collect();
        (listeners, streams)
    }

    /// Tear down the binding for `protocol`. Returns after its listener or
    /// handler is released and all of its sessions have ended.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self, protocol: &str) -> Result<()> {
        let mut bindings = self.bindings.lock().await;
        let Some(binding) = bindings.remove(protocol) else {
            return Err(MountError::NotFound(protocol.to_string()));
        };
        binding.close().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        let mut bindings = self.bindings.lock().await;
        let closing = std::mem::take(&mut *bindings);
        if !closing.is_empty() {
            tracing::info!(count = closing.len(), "closing all bindings");
        }
        futures_util::future::join_all(closing.values().map(|b| b.close())).await;
    }

    /// Close every binding, then shut the overlay down.
    pub async fn shutdown(&self) {
        self.close_all().await;
        self.overlay.shutdown().await;
    }

    pub async fn contains(&self, protocol: &str) -> bool {
        self.bindings.lock().await.contains_key(protocol)
    }

    pub async fn len(&self) -> usize {
        self.bindings.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.lock().await.is_empty()
    }
}
