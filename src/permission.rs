//! Permissions: per-peer-IP authorization to relay data.
//!
//! RFC 5766 expires permissions five minutes after installation, so each
//! permission re-issues its CreatePermission on the client's refresh
//! cadence. A failing refresh is logged and retried at the next tick; the
//! permission itself stays usable until closed.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::allocation::AllocationInner;
use crate::client::ClientInner;
use crate::connection::{PeerConnInner, PeerConnection};
use crate::Error;

/// Queue depth of a peer connection's inbound pipe.
const INBOUND_CAPACITY: usize = 32;

/// A server-side permission to exchange data with one peer IP.
///
/// Owns the peer connections created through it. May be cloned; clones
/// refer to the same permission.
#[derive(Clone)]
pub struct Permission {
    inner: Arc<PermissionInner>,
}

impl std::fmt::Debug for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permission")
            .field("ip", &self.inner.ip)
            .finish_non_exhaustive()
    }
}

impl Permission {
    pub(crate) fn from_inner(inner: Arc<PermissionInner>) -> Self {
        Self { inner }
    }

    /// The peer IP this permission covers.
    pub fn peer_ip(&self) -> IpAddr {
        self.inner.ip
    }

    /// Opens a stream-like connection to `peer`, which must carry the
    /// permission's IP. No traffic is exchanged until the first write or
    /// bind.
    pub fn create_udp(&self, peer: SocketAddr) -> Result<PeerConnection, Error> {
        self.inner.create_udp(peer)
    }

    /// Sending to an arbitrary address through the permission is not
    /// supported; use a [`PeerConnection`].
    pub fn write_to(&self, _data: &[u8], _addr: SocketAddr) -> Result<usize, Error> {
        Err(Error::NotImplemented)
    }

    /// Stops the refresh loop and closes every owned peer connection.
    /// Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

pub(crate) struct PermissionInner {
    client: Arc<ClientInner>,
    alloc: Weak<AllocationInner>,
    ip: IpAddr,
    token: CancellationToken,
    closed: AtomicBool,
    conns: Mutex<Vec<Arc<PeerConnInner>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl PermissionInner {
    /// Builds the permission and starts its refresh loop.
    pub(crate) fn spawn(alloc: &Arc<AllocationInner>, ip: IpAddr) -> Arc<Self> {
        let inner = Arc::new(Self {
            client: alloc.client.clone(),
            alloc: Arc::downgrade(alloc),
            ip,
            token: alloc.token().child_token(),
            closed: AtomicBool::new(false),
            conns: Mutex::new(Vec::new()),
            refresh_task: Mutex::new(None),
        });

        let perm = inner.clone();
        let task = crate::client::spawn_refresh_loop(
            inner.client.refresh_rate,
            inner.token.clone(),
            move || {
                let perm = perm.clone();
                async move {
                    match perm.client.install_permission(perm.ip).await {
                        Ok(()) => debug!(ip = %perm.ip, "permission refreshed"),
                        // A refresh interrupted by close is not a failure.
                        Err(Error::Closed) => debug!("refresh aborted by close"),
                        Err(err) => error!("failed to refresh permission: {err}"),
                    }
                }
            },
        );
        *inner.refresh_task.lock().unwrap() = task;

        inner
    }

    pub(crate) fn ip(&self) -> IpAddr {
        self.ip
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn create_udp(self: &Arc<Self>, peer: SocketAddr) -> Result<PeerConnection, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let alloc = self.alloc.upgrade().ok_or(Error::Closed)?;

        let (pipe_tx, pipe_rx) = mpsc::channel(INBOUND_CAPACITY);
        let conn = PeerConnInner::new(self, &alloc, peer, pipe_tx.clone(), pipe_rx);
        self.client
            .routes
            .lock()
            .unwrap()
            .peers
            .insert(peer, pipe_tx);
        self.conns.lock().unwrap().push(conn.clone());

        Ok(PeerConnection::from_inner(conn))
    }

    pub(crate) fn remove_conn(&self, target: &Arc<PeerConnInner>) {
        self.conns
            .lock()
            .unwrap()
            .retain(|conn| !Arc::ptr_eq(conn, target));
    }

    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let task = self.refresh_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let conns: Vec<_> = self.conns.lock().unwrap().drain(..).collect();
        for conn in conns {
            conn.close().await;
        }
        if let Some(alloc) = self.alloc.upgrade() {
            alloc.remove_permission(self);
        }
    }
}
