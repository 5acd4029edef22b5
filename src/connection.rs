//! Peer connections: a full-duplex, stream-like endpoint for one peer.
//!
//! While unbound, writes travel as SEND indications and cost ~36 bytes of
//! overhead; after [`PeerConnection::bind`] they use 4-byte channel-data
//! frames. Inbound payloads arrive on the connection's pipe from the
//! client's dispatchers, whichever wire form the server chose.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use rand::random;
use stun_codec::rfc5389::attributes::Fingerprint;
use stun_codec::rfc5766::attributes::{ChannelNumber, Data, XorPeerAddress};
use stun_codec::rfc5766::methods::{CHANNEL_BIND, SEND};
use stun_codec::{Message, MessageClass, TransactionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::allocation::{check_success, AllocationInner};
use crate::attr::Attribute;
use crate::chandata;
use crate::client::ClientInner;
use crate::permission::PermissionInner;
use crate::Error;

/// A bidirectional path to one peer through the relay.
///
/// May be cloned; clones refer to the same connection. Writes are not
/// internally queued, so callers that need ordering must serialize their
/// own writes.
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<PeerConnInner>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.inner.peer)
            .field("binding", &*self.inner.number.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    pub(crate) fn from_inner(inner: Arc<PeerConnInner>) -> Self {
        Self { inner }
    }

    /// Delivers one peer payload, copying at most `buf.len()` bytes and
    /// discarding any excess (datagram semantics). Blocks until a payload
    /// arrives, the read deadline passes, or the connection closes.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.inner.read(buf).await
    }

    /// Sends `data` to the peer, framed as channel data when bound and as a
    /// SEND indication otherwise. Returns the payload length.
    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        self.inner.write(data).await
    }

    /// Binds a channel number to the peer, switching writes to channel-data
    /// framing and starting the rebind loop. A connection can be bound once.
    pub async fn bind(&self) -> Result<(), Error> {
        self.inner.bind().await
    }

    /// Whether a channel number is bound.
    pub fn bound(&self) -> bool {
        self.inner.number.lock().unwrap().is_some()
    }

    /// The bound channel number, if any. Stable for the connection's
    /// lifetime once assigned.
    pub fn binding(&self) -> Option<u16> {
        *self.inner.number.lock().unwrap()
    }

    /// The allocation's relayed address: what the peer sees as our address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.relayed
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Sets the deadline applied to blocked and future reads; `None` clears
    /// it. Write deadlines are not supported.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
    }

    /// See [`set_deadline`](PeerConnection::set_deadline).
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock().unwrap() = deadline;
    }

    /// Write deadlines are not implemented for relayed connections.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), Error> {
        Err(Error::NotImplemented)
    }

    /// Closes the inbound pipe, stops the rebind loop and detaches from the
    /// owning permission. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

pub(crate) struct PeerConnInner {
    client: Arc<ClientInner>,
    alloc: Weak<AllocationInner>,
    perm: Weak<PermissionInner>,
    peer: SocketAddr,
    relayed: SocketAddr,
    number: Mutex<Option<u16>>,
    bind_lock: tokio::sync::Mutex<()>,
    pipe_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    read_deadline: Mutex<Option<Instant>>,
    token: CancellationToken,
    closed: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnInner {
    pub(crate) fn new(
        perm: &Arc<PermissionInner>,
        alloc: &Arc<AllocationInner>,
        peer: SocketAddr,
        pipe_tx: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client: alloc.client.clone(),
            alloc: Arc::downgrade(alloc),
            perm: Arc::downgrade(perm),
            peer,
            relayed: alloc.relayed,
            number: Mutex::new(None),
            bind_lock: tokio::sync::Mutex::new(()),
            pipe_tx: Mutex::new(Some(pipe_tx)),
            inbound: tokio::sync::Mutex::new(inbound),
            read_deadline: Mutex::new(None),
            token: perm.token().child_token(),
            closed: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
        })
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let deadline = *self.read_deadline.lock().unwrap();
        let mut inbound = self.inbound.lock().await;
        let payload = match deadline {
            Some(at) => {
                let at = tokio::time::Instant::from_std(at);
                tokio::time::timeout_at(at, inbound.recv())
                    .await
                    .map_err(|_| Error::TimedOut)?
            }
            None => inbound.recv().await,
        };
        let payload = payload.ok_or(Error::Closed)?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if data.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        let number = *self.number.lock().unwrap();
        match number {
            Some(number) => {
                trace!(number, "writing as channel data");
                let frame = chandata::encode(number, data);
                self.client.send_datagram(&frame).await?;
            }
            None => {
                trace!(peer = %self.peer, "writing as SEND indication");
                let mut message =
                    Message::new(MessageClass::Indication, SEND, TransactionId::new(random()));
                message.add_attribute(XorPeerAddress::new(self.peer));
                message.add_attribute(Data::new(data.to_vec())?);
                let fingerprint = Fingerprint::new(&message)?;
                message.add_attribute(fingerprint);
                self.client.indicate(message).await?;
            }
        }
        Ok(data.len())
    }

    async fn bind(self: &Arc<Self>) -> Result<(), Error> {
        let _bind = self.bind_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.number.lock().unwrap().is_some() {
            return Err(Error::AlreadyBound);
        }
        let alloc = self.alloc.upgrade().ok_or(Error::Closed)?;
        let number = alloc.next_channel()?;
        self.channel_bind(number).await?;

        *self.number.lock().unwrap() = Some(number);
        {
            let mut routes = self.client.routes.lock().unwrap();
            if let Some(pipe) = self.pipe_tx.lock().unwrap().as_ref() {
                routes.channels.insert(number, pipe.clone());
            }
        }

        let conn = self.clone();
        let task = crate::client::spawn_refresh_loop(
            self.client.refresh_rate,
            self.token.clone(),
            move || {
                let conn = conn.clone();
                async move {
                    match conn.channel_bind(number).await {
                        Ok(()) => debug!(number, "binding refreshed"),
                        // A rebind interrupted by close is not a failure.
                        Err(Error::Closed) => debug!("rebind aborted by close"),
                        Err(err) => error!("failed to refresh bind: {err}"),
                    }
                }
            },
        );
        *self.refresh_task.lock().unwrap() = task;

        Ok(())
    }

    /// One ChannelBind transaction for `number`; used for the initial bind
    /// and every rebind.
    async fn channel_bind(&self, number: u16) -> Result<(), Error> {
        let response = self
            .client
            .transact(
                CHANNEL_BIND,
                vec![
                    Attribute::XorPeerAddress(XorPeerAddress::new(self.peer)),
                    Attribute::ChannelNumber(ChannelNumber::new(number)?),
                ],
            )
            .await?;
        check_success(&response, CHANNEL_BIND)
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
        {
            let mut routes = self.client.routes.lock().unwrap();
            routes.peers.remove(&self.peer);
            if let Some(number) = *self.number.lock().unwrap() {
                routes.channels.remove(&number);
            }
        }
        // Dropping the sender wakes any blocked read with `Closed` once the
        // pipe drains.
        self.pipe_tx.lock().unwrap().take();
        if let Some(perm) = self.perm.upgrade() {
            perm.remove_conn(self);
        }
    }
}
