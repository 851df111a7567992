//! # p2p-mount
//!
//! Mount local TCP services on a peer-to-peer overlay, addressed by protocol
//! name instead of by port.
//!
//! A [`TunnelRegistry`] holds the bindings of one overlay node. Two kinds
//! exist:
//!
//! - **listen**: a local TCP listener; each accepted connection is carried
//!   over a fresh overlay stream for the protocol to a peer.
//! - **forward**: a handler for the protocol on the overlay; each inbound
//!   stream from the authorised peer (or from any peer, when none is given)
//!   is connected to a local TCP target.
//!
//! Put a listen binding on one node and a forward binding for the same
//! protocol on another, and a TCP client of the first reaches the service
//! behind the second:
//!
//! ```text
//!  node A                                            node B
//!  tcp client ─► listen("ssh", /ip4/127.0.0.1/tcp/2222, B)
//!                    │ overlay stream "ssh"
//!                    └──────────────────────► forward("ssh", /ip4/127.0.0.1/tcp/22, A) ─► sshd
//! ```
//!
//! Overlays are provided by [`p2p_mount_net`]; tests and single-process
//! setups use its [`MemoryNetwork`](p2p_mount_net::MemoryNetwork).

pub mod address;
mod binding;
pub mod config;
mod error;
pub mod forward;
mod graceful;
mod info;
pub mod listen;
mod registry;
pub mod session;
mod splice;

pub use address::{AddressError, Endpoint, Transport};
pub use binding::Binding;
pub use config::{ConfigError, MountConfig};
pub use error::{MountError, Result};
pub use forward::ForwardBinding;
pub use graceful::Graceful;
pub use info::{ListenerInfo, Role, StreamInfo};
pub use listen::ListenBinding;
pub use registry::TunnelRegistry;
pub use session::{SessionHandle, SessionSet};
pub use splice::splice;

pub use p2p_mount_net::{Overlay, OverlayError, PeerId};
