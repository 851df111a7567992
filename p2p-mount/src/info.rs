use p2p_mount_net::PeerId;

use crate::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Local TCP listener, tunneled out to a peer.
    Listen,
    /// Inbound overlay streams, tunneled to a local TCP target.
    Forward,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Listen => f.write_str("listen"),
            Role::Forward => f.write_str("forward"),
        }
    }
}

/// One active binding, as reported by [`TunnelRegistry::list`](crate::TunnelRegistry::list).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ListenerInfo {
    pub protocol: String,
    /// Listening endpoint for [`Role::Listen`], dial target for
    /// [`Role::Forward`].
    pub target_address: Endpoint,
    pub role: Role,
    /// Overlay target for [`Role::Listen`], authorised peer for
    /// [`Role::Forward`]. `None` is a forward open to any peer.
    pub peer: Option<PeerId>,
}

/// One live tunneled connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamInfo {
    pub protocol: String,
    pub origin_address: Endpoint,
    pub target_address: Endpoint,
    /// Overlay peer on the other end
    pub peer: PeerId,
}
