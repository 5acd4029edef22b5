//! Allocations: the relayed-address lease on the TURN server.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use stun_codec::rfc5389::attributes::{Nonce, Realm, XorMappedAddress};
use stun_codec::rfc5389::errors::Unauthorized;
use stun_codec::rfc5766::attributes::{Lifetime, RequestedTransport, XorPeerAddress, XorRelayAddress};
use stun_codec::rfc5766::methods::{ALLOCATE, CREATE_PERMISSION, REFRESH};
use stun_codec::{Message, MessageClass, Method};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::attr::{self, Attribute};
use crate::chandata::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
use crate::client::{new_request, Client, ClientInner};
use crate::permission::{Permission, PermissionInner};
use crate::Error;

/// REQUESTED-TRANSPORT protocol number for UDP (RFC 5766 §14.7).
const TRANSPORT_UDP: u8 = 17;

impl Client {
    /// Leases a relayed address from the server.
    ///
    /// The first attempt is anonymous; a 401 with realm and nonce triggers
    /// the long-term-credential retry when the client was configured with a
    /// username. At most one allocation may be live per client.
    pub async fn allocate(&self) -> Result<Allocation, Error> {
        let client = self.inner().clone();
        {
            let slot = client.allocation.lock().unwrap();
            if let Some(existing) = slot.upgrade() {
                if !existing.closed.load(Ordering::SeqCst) {
                    return Err(Error::AllocationInUse);
                }
            }
        }

        let attributes = vec![Attribute::RequestedTransport(RequestedTransport::new(
            TRANSPORT_UDP,
        ))];
        let mut auth = client.auth.lock().await;
        let request = auth.seal(new_request(ALLOCATE, &attributes))?;
        let mut response = client.request(request).await?;

        if response.class() == MessageClass::ErrorResponse {
            let (code, reason) =
                attr::error_code(&response).ok_or(Error::MissingAttribute("ERROR-CODE"))?;
            if code != Unauthorized::CODEPOINT {
                return Err(Error::ErrorResponse { code, reason });
            }
            if !auth.has_credentials() || auth.is_authenticated() {
                return Err(Error::Unauthorized);
            }
            // 401 carrying the realm and nonce: authenticate and retry.
            let realm = response
                .get_attribute::<Realm>()
                .ok_or(Error::MissingAttribute("REALM"))?
                .clone();
            let nonce = response
                .get_attribute::<Nonce>()
                .ok_or(Error::MissingAttribute("NONCE"))?
                .clone();
            auth.learn(realm, nonce);

            let request = auth.seal(new_request(ALLOCATE, &attributes))?;
            response = client.request(request).await?;
            if response.class() == MessageClass::ErrorResponse {
                let (code, reason) =
                    attr::error_code(&response).ok_or(Error::MissingAttribute("ERROR-CODE"))?;
                return Err(if code == Unauthorized::CODEPOINT {
                    Error::Unauthorized
                } else {
                    Error::ErrorResponse { code, reason }
                });
            }
        }
        drop(auth);
        check_success(&response, ALLOCATE)?;

        let relayed = response
            .get_attribute::<XorRelayAddress>()
            .ok_or(Error::MissingAttribute("XOR-RELAYED-ADDRESS"))?
            .address();
        let reflexive = response
            .get_attribute::<XorMappedAddress>()
            .map(|addr| addr.address());

        let inner = Arc::new(AllocationInner {
            client: client.clone(),
            relayed,
            reflexive,
            token: client.token.child_token(),
            closed: AtomicBool::new(false),
            state: Mutex::new(AllocState {
                perms: Vec::new(),
                min_bound: MIN_CHANNEL_NUMBER,
            }),
            refresh_task: Mutex::new(None),
        });
        inner.spawn_refresh();
        *client.allocation.lock().unwrap() = Arc::downgrade(&inner);

        Ok(Allocation { inner })
    }
}

/// A relayed transport address leased from the TURN server.
///
/// Owns its permissions; closing the allocation closes them all. May be
/// cloned; clones refer to the same lease.
#[derive(Clone)]
pub struct Allocation {
    inner: Arc<AllocationInner>,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("relayed", &self.inner.relayed)
            .field("reflexive", &self.inner.reflexive)
            .finish_non_exhaustive()
    }
}

impl Allocation {
    /// The public address the server relays from, as reported in
    /// XOR-RELAYED-ADDRESS.
    pub fn relayed(&self) -> SocketAddr {
        self.inner.relayed
    }

    /// The client's address as the server saw it, when the server reported
    /// one.
    pub fn reflexive(&self) -> Option<SocketAddr> {
        self.inner.reflexive
    }

    /// Installs a server-side permission for `peer` and starts its refresh
    /// loop. Permissions are per IP; requesting one for an IP that already
    /// has a live permission returns the existing handle.
    pub async fn create(&self, peer: IpAddr) -> Result<Permission, Error> {
        self.inner.create_permission(peer).await
    }

    /// Cancels the refresh loop and closes every owned permission. The
    /// server reclaims the lease at its own timeout. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

pub(crate) struct AllocationInner {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) relayed: SocketAddr,
    reflexive: Option<SocketAddr>,
    token: CancellationToken,
    closed: AtomicBool,
    state: Mutex<AllocState>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

struct AllocState {
    perms: Vec<Arc<PermissionInner>>,
    min_bound: u16,
}

impl AllocationInner {
    fn spawn_refresh(self: &Arc<Self>) {
        let alloc = self.clone();
        let task = crate::client::spawn_refresh_loop(
            self.client.refresh_rate,
            self.token.clone(),
            move || {
                let alloc = alloc.clone();
                async move {
                    match alloc.refresh().await {
                        Ok(()) => debug!("allocation refreshed"),
                        // A refresh interrupted by close is not a failure.
                        Err(Error::Closed) => debug!("refresh aborted by close"),
                        Err(err) => error!("failed to refresh allocation: {err}"),
                    }
                }
            },
        );
        *self.refresh_task.lock().unwrap() = task;
    }

    /// One Refresh transaction carrying LIFETIME equal to the refresh rate.
    /// Stale-nonce rotation happens inside the transaction helper.
    async fn refresh(&self) -> Result<(), Error> {
        let lifetime = Lifetime::new(self.client.refresh_rate)?;
        let response = self
            .client
            .transact(REFRESH, vec![Attribute::Lifetime(lifetime)])
            .await?;
        check_success(&response, REFRESH)
    }

    async fn create_permission(self: &Arc<Self>, ip: IpAddr) -> Result<Permission, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let existing = self
            .state
            .lock()
            .unwrap()
            .perms
            .iter()
            .find(|perm| perm.ip() == ip && !perm.is_closed())
            .cloned();
        if let Some(existing) = existing {
            return Ok(Permission::from_inner(existing));
        }

        self.client.install_permission(ip).await?;

        let perm = PermissionInner::spawn(self, ip);
        self.state.lock().unwrap().perms.push(perm.clone());
        Ok(Permission::from_inner(perm))
    }

    /// Issues the next channel number. Numbers are unique and increasing
    /// within the allocation, starting just above the protocol minimum.
    pub(crate) fn next_channel(&self) -> Result<u16, Error> {
        let mut state = self.state.lock().unwrap();
        if state.min_bound >= MAX_CHANNEL_NUMBER {
            return Err(Error::ChannelsExhausted);
        }
        state.min_bound += 1;
        Ok(state.min_bound)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn remove_permission(&self, target: &Arc<PermissionInner>) {
        self.state
            .lock()
            .unwrap()
            .perms
            .retain(|perm| !Arc::ptr_eq(perm, target));
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
        let perms: Vec<_> = self.state.lock().unwrap().perms.drain(..).collect();
        for perm in perms {
            perm.close().await;
        }
        *self.client.allocation.lock().unwrap() = Weak::new();
    }
}

impl ClientInner {
    /// CreatePermission transaction for one peer IP; the port is
    /// irrelevant to the server. Used both for installation and refresh.
    pub(crate) async fn install_permission(&self, ip: IpAddr) -> Result<(), Error> {
        let peer = XorPeerAddress::new(SocketAddr::new(ip, 0));
        let response = self
            .transact(CREATE_PERMISSION, vec![Attribute::XorPeerAddress(peer)])
            .await?;
        check_success(&response, CREATE_PERMISSION)
    }
}

/// Requires a success response to `method`; anything else is an error.
pub(crate) fn check_success(response: &Message<Attribute>, method: Method) -> Result<(), Error> {
    if response.method() == method && response.class() == MessageClass::SuccessResponse {
        return Ok(());
    }
    if let Some((code, reason)) = attr::error_code(response) {
        return Err(Error::ErrorResponse { code, reason });
    }
    Err(Error::UnexpectedResponse(format!(
        "{:?} {:?}",
        response.method(),
        response.class()
    )))
}
