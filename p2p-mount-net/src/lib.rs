//! # p2p-mount-net
//!
//! The overlay network underneath stream mounting.
//!
//! Stream mounting only needs a narrow slice of a peer-to-peer network:
//!
//! - who am I ([`Overlay::local_peer_id`]),
//! - open a stream to peer P for protocol X ([`Overlay::open_stream`]),
//! - hand me inbound streams for protocol X ([`Overlay::register_handler`]).
//!
//! This crate defines that slice as the [`Overlay`] trait and ships two
//! implementations:
//!
//! - [`IrohOverlay`] (feature `iroh`, on by default): a real node on the
//!   iroh network. All mount protocols share a single ALPN and are
//!   multiplexed over bidirectional streams, each starting with a small
//!   header (see [`protocol`]).
//! - [`MemoryNetwork`]: nodes living in one process, connected by in-memory
//!   pipes. Useful for tests and for embedding both ends in one binary.
//!
//! ## Peer ids
//!
//! Peers are identified by their Ed25519 public key, written as ID52: 52
//! lowercase `BASE32_DNSSEC` characters.
//!
//! ```
//! use p2p_mount_net::{PeerId, generate_secret_key};
//!
//! let secret = generate_secret_key();
//! let peer = PeerId::from(&secret);
//! let id52 = peer.to_string();
//! assert_eq!(id52.len(), 52);
//! assert_eq!(id52.parse::<PeerId>().unwrap(), peer);
//! ```

#[cfg(feature = "iroh")]
mod iroh_overlay;
mod memory;
mod overlay;
mod peer_id;
pub mod protocol;

#[cfg(feature = "iroh")]
pub use iroh_overlay::{ALPN, HEADER_TIMEOUT, IrohOverlay, IrohStream};
pub use memory::{DEFAULT_PIPE_CAPACITY, MemoryNetwork, MemoryOverlay};
pub use overlay::{
    DEFAULT_HANDLER_QUEUE, Duplex, HandlerTable, IncomingStream, Overlay, OverlayError,
    OverlayStream, StreamReceiver,
};
pub use peer_id::{ID52_LEN, ParsePeerIdError, PeerId, SecretKey, generate_secret_key};
