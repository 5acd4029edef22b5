//! Client handle and the STUN transaction engine.
//!
//! A [`Client`] owns one transport to one TURN server. Inbound traffic is
//! demultiplexed into three streams; this module consumes two of them
//! (matching STUN responses to outstanding transactions by transaction id
//! and routing DATA indications and channel-data frames to peer
//! connections) and discards the third after logging it.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::random;
use stun_codec::rfc5389::attributes::Nonce;
use stun_codec::rfc5389::errors::StaleNonce;
use stun_codec::rfc5766::attributes::{Data, XorPeerAddress};
use stun_codec::rfc5766::methods::DATA;
use stun_codec::{Message, MessageClass, Method, TransactionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::allocation::AllocationInner;
use crate::attr::{self, Attribute};
use crate::auth::AuthState;
use crate::transport::{self, Conn};
use crate::{chandata, mux, Error};

/// Initial retransmission timeout for a request over an unreliable
/// transport (RFC 5389 §7.2.1); doubled after every resend.
const INITIAL_RTO: Duration = Duration::from_millis(500);

/// Configuration for a [`Client`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Username for long-term credentials; empty for anonymous use.
    pub username: String,
    /// Password for long-term credentials.
    pub password: String,
    /// Cadence of the allocation, permission and channel refresh loops.
    /// A zero duration disables them.
    pub refresh_rate: Duration,
    /// Disables every refresh loop regardless of `refresh_rate`.
    pub refresh_disabled: bool,
    /// Deadline for a single STUN transaction, retransmissions included.
    pub request_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            refresh_rate: Duration::from_secs(60),
            refresh_disabled: false,
            // 500ms initial RTO doubled over seven retransmits.
            request_timeout: Duration::from_millis(39_500),
        }
    }
}

/// Handle to one TURN session over one transport.
///
/// May be cloned; all clones refer to the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("refresh_rate", &self.inner.refresh_rate)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Wires a client onto `conn` and starts its reader tasks.
    ///
    /// The transport must already be connected to the TURN server; the
    /// client performs no traffic until [`allocate`](Client::allocate).
    pub fn new<C: Conn>(conn: C, options: Options) -> Result<Self, Error> {
        let auth = AuthState::new(&options.username, &options.password)?;
        let conn: Arc<dyn Conn> = Arc::new(conn);
        let token = CancellationToken::new();

        let inner = Arc::new(ClientInner {
            conn: conn.clone(),
            token: token.clone(),
            refresh_rate: if options.refresh_disabled {
                Duration::ZERO
            } else {
                options.refresh_rate
            },
            request_timeout: options.request_timeout,
            auth: tokio::sync::Mutex::new(auth),
            write_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(BTreeMap::new()),
            routes: Mutex::new(Routes::default()),
            allocation: Mutex::new(Weak::new()),
        });

        let pipes = mux::spawn(conn, token);
        tokio::spawn(drive_stun(inner.clone(), pipes.stun));
        tokio::spawn(drive_chandata(inner.clone(), pipes.chandata));
        tokio::spawn(drive_app(pipes.app));

        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    /// Tears the session down: cancels every task this client spawned and
    /// closes the live allocation, if any. Idempotent.
    pub async fn close(&self) {
        let allocation = self.inner.allocation.lock().unwrap().upgrade();
        if let Some(allocation) = allocation {
            allocation.close().await;
        }
        self.inner.token.cancel();
    }
}

#[derive(Default)]
pub(crate) struct Routes {
    pub(crate) channels: HashMap<u16, mpsc::Sender<Vec<u8>>>,
    pub(crate) peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
}

pub(crate) struct ClientInner {
    pub(crate) conn: Arc<dyn Conn>,
    pub(crate) token: CancellationToken,
    pub(crate) refresh_rate: Duration,
    request_timeout: Duration,
    pub(crate) auth: tokio::sync::Mutex<AuthState>,
    write_lock: tokio::sync::Mutex<()>,
    pending: Mutex<BTreeMap<TransactionId, oneshot::Sender<Message<Attribute>>>>,
    pub(crate) routes: Mutex<Routes>,
    pub(crate) allocation: Mutex<Weak<AllocationInner>>,
}

impl ClientInner {
    /// Sends one datagram on the transport. The write lock serializes
    /// outbound bytes across tasks.
    pub(crate) async fn send_datagram(&self, data: &[u8]) -> Result<(), Error> {
        let _write = self.write_lock.lock().await;
        let sent = transport::send(self.conn.as_ref(), data).await?;
        if sent != data.len() {
            warn!(sent, len = data.len(), "transport truncated a datagram");
        }
        Ok(())
    }

    /// Sends `message` and waits for the response with the same transaction
    /// id, retransmitting on an exponential schedule until the configured
    /// deadline.
    pub(crate) async fn request(
        &self,
        message: Message<Attribute>,
    ) -> Result<Message<Attribute>, Error> {
        let id = message.transaction_id();
        let bytes = attr::encode(message)?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let _cleanup = PendingGuard { client: self, id };

        self.send_datagram(&bytes).await?;

        let deadline = Instant::now() + self.request_timeout;
        let mut rto = INITIAL_RTO;
        loop {
            let retransmit_at = Instant::now() + rto;
            tokio::select! {
                response = &mut rx => return response.map_err(|_| Error::Closed),
                _ = self.token.cancelled() => return Err(Error::Closed),
                _ = sleep_until(retransmit_at.min(deadline)) => {
                    if retransmit_at >= deadline {
                        return Err(Error::TimedOut);
                    }
                    trace!(?id, "retransmitting request");
                    self.send_datagram(&bytes).await?;
                    rto *= 2;
                }
            }
        }
    }

    /// Sends an indication; no response is expected or awaited.
    pub(crate) async fn indicate(&self, message: Message<Attribute>) -> Result<(), Error> {
        let bytes = attr::encode(message)?;
        self.send_datagram(&bytes).await
    }

    /// Issues an authenticated request built from `method` and
    /// `attributes`, transparently retrying once on 438 Stale Nonce with
    /// the rotated nonce. The auth state stays locked for the whole
    /// exchange so concurrent requests never observe a half-rotated nonce.
    pub(crate) async fn transact(
        &self,
        method: Method,
        attributes: Vec<Attribute>,
    ) -> Result<Message<Attribute>, Error> {
        let mut auth = self.auth.lock().await;
        let request = auth.seal(new_request(method, &attributes))?;
        let response = self.request(request).await?;

        if response.class() != MessageClass::ErrorResponse || !auth.is_authenticated() {
            return Ok(response);
        }
        match attr::error_code(&response) {
            Some((code, _)) if code == StaleNonce::CODEPOINT => {}
            _ => return Ok(response),
        }
        let nonce = response
            .get_attribute::<Nonce>()
            .ok_or(Error::MissingAttribute("NONCE"))?;
        debug!(method = %method, "stale nonce, retrying with rotated nonce");
        auth.rotate_nonce(nonce.clone());

        let request = auth.seal(new_request(method, &attributes))?;
        self.request(request).await
    }

    fn handle_indication(&self, message: Message<Attribute>) {
        if message.method() != DATA {
            debug!(method = %message.method(), "ignoring unexpected indication");
            return;
        }
        let Some(peer) = message.get_attribute::<XorPeerAddress>() else {
            debug!("DATA indication without XOR-PEER-ADDRESS");
            return;
        };
        let Some(data) = message.get_attribute::<Data>() else {
            debug!("DATA indication without DATA");
            return;
        };
        let peer = peer.address();
        let pipe = self.routes.lock().unwrap().peers.get(&peer).cloned();
        match pipe {
            Some(pipe) => {
                if let Err(err) = pipe.try_send(data.data().to_vec()) {
                    warn!(%peer, %err, "failed to deliver peer data");
                }
            }
            None => debug!(%peer, "DATA indication from peer without a connection"),
        }
    }
}

/// Removes a pending transaction when its waiter goes away, whatever the
/// exit path.
struct PendingGuard<'a> {
    client: &'a ClientInner,
    id: TransactionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.pending.lock().unwrap().remove(&self.id);
    }
}

pub(crate) fn new_request(method: Method, attributes: &[Attribute]) -> Message<Attribute> {
    let mut message = Message::new(MessageClass::Request, method, TransactionId::new(random()));
    for attribute in attributes {
        message.add_attribute(attribute.clone());
    }
    message
}

async fn drive_stun(client: Arc<ClientInner>, mut pipe: mpsc::Receiver<Vec<u8>>) {
    while let Some(datagram) = pipe.recv().await {
        let message = match attr::decode(&datagram) {
            Ok(message) => message,
            Err(_) => {
                debug!("dropping undecodable STUN datagram");
                continue;
            }
        };
        match message.class() {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                let id = message.transaction_id();
                let waiter = client.pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => debug!(?id, "response without an outstanding transaction"),
                }
            }
            MessageClass::Indication => client.handle_indication(message),
            MessageClass::Request => {
                warn!(method = %message.method(), "server sent a request; dropping")
            }
        }
    }
}

async fn drive_chandata(client: Arc<ClientInner>, mut pipe: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = pipe.recv().await {
        let Some((number, payload)) = chandata::parse(&frame) else {
            debug!(len = frame.len(), "dropping malformed channel-data frame");
            continue;
        };
        let pipe = client.routes.lock().unwrap().channels.get(&number).cloned();
        match pipe {
            Some(pipe) => {
                if let Err(err) = pipe.try_send(payload.to_vec()) {
                    warn!(number, %err, "failed to deliver channel data");
                }
            }
            None => debug!(number, "channel data for an unbound channel"),
        }
    }
}

/// Drains the application stream; this client has no consumer for it.
async fn drive_app(mut pipe: mpsc::Receiver<Vec<u8>>) {
    while let Some(datagram) = pipe.recv().await {
        trace!(len = datagram.len(), "discarding application datagram");
    }
}

/// Spawns a periodic task that runs `tick` at `rate` until `token` is
/// cancelled. A zero rate disables the loop entirely and returns `None`.
pub(crate) fn spawn_refresh_loop<F, Fut>(
    rate: Duration,
    token: CancellationToken,
    mut tick: F,
) -> Option<tokio::task::JoinHandle<()>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    if rate.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(rate);
        // The first tick of an interval completes immediately; the loop
        // below starts one full period after the owning operation.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => tick().await,
            }
        }
    }))
}
