use crate::AddressError;

/// Errors reported by the mount registry.
///
/// Only the registration and teardown calls return these to the caller.
/// `DialFailed` and `StreamError` describe a single tunneled connection;
/// they are logged by the binding that hit them and never stop it.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid peer id {input:?}: {source}")]
    InvalidPeerId {
        input: String,
        source: p2p_mount_net::ParsePeerIdError,
    },

    #[error("no peer to tunnel {0:?} to, and no default peer configured")]
    NoPeerTarget(String),

    #[error("protocol {0:?} is already mounted")]
    ProtocolInUse(String),

    #[error("protocol {0:?} is not mounted")]
    NotFound(String),

    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: crate::Endpoint,
        source: std::io::Error,
    },

    #[error("failed to reach {target}: {source}")]
    DialFailed { target: String, source: eyre::Error },

    #[error("stream error: {0}")]
    StreamError(#[from] std::io::Error),

    #[error("overlay error: {0}")]
    Overlay(#[from] p2p_mount_net::OverlayError),
}

pub type Result<T> = std::result::Result<T, MountError>;

pub(crate) fn parse_peer(input: &str) -> Result<p2p_mount_net::PeerId> {
    input
        .parse()
        .map_err(|source| MountError::InvalidPeerId {
            input: input.to_string(),
            source,
        })
}
