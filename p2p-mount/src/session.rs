//! Live sessions of a binding.
//!
//! A binding owns an `Arc<SessionSet>`; each session task owns a
//! [`SessionHandle`] that points back into the set weakly. Dropping the
//! handle (the task finished, failed, or was cancelled) removes the entry,
//! so the set never outlives its binding through its sessions and never
//! lists a finished session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{MountError, StreamInfo};

struct Entry {
    info: StreamInfo,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct SessionSet {
    sessions: scc::HashMap<u64, Entry>,
    next_id: AtomicU64,
}

impl SessionSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a session. It stays listed until the returned handle is dropped.
    pub fn insert(self: &Arc<Self>, info: StreamInfo, cancel: CancellationToken) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            info,
            cancel: cancel.clone(),
        };
        let listed = self.sessions.insert(id, entry).is_ok();
        if !listed {
            tracing::error!(session = id, "session id already listed");
        }
        debug_assert!(listed, "session id {id} handed out twice");
        SessionHandle {
            id,
            set: Arc::downgrade(self),
            cancel,
        }
    }

    /// Live sessions, oldest first.
    pub fn snapshot(&self) -> Vec<StreamInfo> {
        let mut sessions = Vec::with_capacity(self.sessions.len());
        self.sessions
            .scan(|id, entry| sessions.push((*id, entry.info.clone())));
        sessions.sort_by_key(|(id, _)| *id);
        sessions.into_iter().map(|(_, info)| info).collect()
    }

    pub fn cancel_all(&self) {
        self.sessions.scan(|_, entry| entry.cancel.cancel());
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Ownership of one listed session.
pub struct SessionHandle {
    id: u64,
    set: Weak<SessionSet>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Relay between `a` and `b` until either side is done, then unlist the
    /// session. Failures are logged, never returned: one broken connection
    /// must not affect the binding.
    pub async fn run<A, B>(self, a: A, b: B, buffer_size: usize)
    where
        A: AsyncRead + AsyncWrite,
        B: AsyncRead + AsyncWrite,
    {
        match crate::splice(a, b, &self.cancel, buffer_size).await {
            Ok((sent, received)) => {
                tracing::debug!(session = self.id, sent, received, "session finished");
            }
            Err(_) if self.cancel.is_cancelled() => {
                tracing::debug!(session = self.id, "session cancelled");
            }
            Err(e) => {
                let err = MountError::StreamError(e);
                tracing::warn!(session = self.id, "session failed: {err}");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.sessions.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2p_mount_net::PeerId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn info(port: u16) -> StreamInfo {
        StreamInfo {
            protocol: "demo".to_string(),
            origin_address: crate::Endpoint::new("127.0.0.1", port).unwrap(),
            target_address: crate::Endpoint::new("127.0.0.1", 9000).unwrap(),
            peer: PeerId::from(&p2p_mount_net::generate_secret_key()),
        }
    }

    #[test]
    fn dropping_handle_unlists_session() {
        let set = SessionSet::new();
        let first = set.insert(info(1000), CancellationToken::new());
        let second = set.insert(info(1001), CancellationToken::new());
        assert_eq!(set.len(), 2);
        assert_eq!(set.snapshot()[0].origin_address.port(), 1000);

        drop(first);
        let remaining = set.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].origin_address.port(), 1001);
        assert_ne!(second.id(), 0);

        drop(second);
        assert!(set.is_empty());
    }

    #[test]
    fn ids_are_not_reused() {
        let set = SessionSet::new();
        let first = set.insert(info(1000), CancellationToken::new());
        let first_id = first.id();
        drop(first);

        let second = set.insert(info(1001), CancellationToken::new());
        assert_ne!(second.id(), first_id);
        let listed = set.snapshot();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].origin_address.port(), 1001);
    }

    #[test]
    fn handle_does_not_keep_set_alive() {
        let set = SessionSet::new();
        let handle = set.insert(info(1000), CancellationToken::new());
        let weak = Arc::downgrade(&set);
        drop(set);
        assert!(weak.upgrade().is_none());
        drop(handle);
    }

    #[test]
    fn cancel_all_reaches_every_session() {
        let set = SessionSet::new();
        let a = set.insert(info(1000), CancellationToken::new());
        let b = set.insert(info(1001), CancellationToken::new());
        set.cancel_all();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }

    #[tokio::test]
    async fn run_unlists_when_relay_ends() {
        let set = SessionSet::new();
        let handle = set.insert(info(1000), CancellationToken::new());
        let (a, mut a_peer) = tokio::io::duplex(64);
        let (b, mut b_peer) = tokio::io::duplex(64);
        let task = tokio::spawn(handle.run(a, b, 64));

        a_peer.write_all(b"x").await.unwrap();
        let mut byte = [0u8; 1];
        b_peer.read_exact(&mut byte).await.unwrap();
        assert_eq!(set.len(), 1);

        drop(a_peer);
        drop(b_peer);
        task.await.unwrap();
        assert!(set.is_empty());
    }
}
