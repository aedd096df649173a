//! The per-session Vault client.
//!
//! A client moves through `Uninitialized → Initialized → LoggedIn →
//! (WatcherRunning | WatcherDone) → Closed`; `Closed` is terminal and
//! `close` is idempotent. One client is shared (via `Arc`) between the
//! cache and every reconciler currently holding it, so session state sits
//! behind a client-local lock and the flags are atomics.
//!
//! Lifecycle events (watcher termination, cache removal) leave through a
//! send-only sink handed in at construction; the factory owns the
//! receiving end, so no reference cycle exists between client and factory.

mod watcher;

pub use watcher::DEFAULT_RENEWAL_PERCENT;

use crate::config::{VaultAuthConfig, VaultConnectionConfig};
use crate::core::error::{CacheKeyError, ClientError};
use crate::core::key::{CacheKey, CacheKeyInputs, CloneKey};
use crate::core::meta::ClientStats;
use crate::metrics::Metrics;
use crate::providers::{CredentialProvider, CredentialSource};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vault_api::{ReadResponse, ResponseKind, VaultSecret, VaultTransport};
use watcher::WatcherHandle;

/// Safety margin applied by `validate` when judging token freshness
const VALIDATE_EXPIRY_OFFSET_SECS: u64 = 5;

/// Lifecycle event categories, combinable as a mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEvent(u8);

impl ClientEvent {
    /// The lifetime watcher terminated
    pub const WATCHER_DONE: Self = Self(1);
    /// The client left the in-memory cache
    pub const CACHE_REMOVAL: Self = Self(1 << 1);
    /// Matches every event
    pub const ANY: Self = Self(u8::MAX);

    /// Whether the masks share a bit
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for ClientEvent {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A lifecycle notification sent to the factory's dispatcher
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// What happened
    pub on: ClientEvent,
    /// The client it happened to
    pub client: Arc<VaultClient>,
    /// Whether registered handlers should see this event; teardown runs
    /// either way
    pub(crate) deliver: bool,
}

impl LifecycleEvent {
    pub(crate) fn new(on: ClientEvent, client: Arc<VaultClient>) -> Self {
        Self {
            on,
            client,
            deliver: true,
        }
    }

    pub(crate) fn silent(on: ClientEvent, client: Arc<VaultClient>) -> Self {
        Self {
            on,
            client,
            deliver: false,
        }
    }
}

/// Identity fixed at `init`: where the session points and who it is
pub struct ClientIdentity {
    cache_key: CacheKey,
    auth: VaultAuthConfig,
    conn: VaultConnectionConfig,
    provider: CredentialProvider,
    transport: Arc<VaultTransport>,
    vault_namespace: Option<String>,
}

impl ClientIdentity {
    /// The auth descriptor backing this session
    pub fn auth(&self) -> &VaultAuthConfig {
        &self.auth
    }

    /// The connection descriptor backing this session
    pub fn connection(&self) -> &VaultConnectionConfig {
        &self.conn
    }
}

struct Session {
    token: Option<SecretString>,
    last_auth: Option<VaultSecret>,
    last_renewal: Option<Instant>,
    watcher_error: Option<String>,
}

/// A request to read a secret through a client
#[derive(Debug, Clone)]
pub enum ReadRequest {
    /// Raw path, payload handed back as-is
    Raw {
        /// Full Vault path
        path: String,
    },
    /// KV version 1 read
    KvV1 {
        /// KV mount
        mount: String,
        /// Secret path within the mount
        path: String,
    },
    /// KV version 2 read (the versioned `data/` infix is added here)
    KvV2 {
        /// KV mount
        mount: String,
        /// Secret path within the mount
        path: String,
    },
}

impl ReadRequest {
    fn request_path(&self) -> String {
        match self {
            Self::Raw { path } => path.clone(),
            Self::KvV1 { mount, path } => format!("{mount}/{path}"),
            Self::KvV2 { mount, path } => format!("{mount}/data/{path}"),
        }
    }

    fn kind(&self) -> ResponseKind {
        match self {
            Self::Raw { .. } => ResponseKind::Default,
            Self::KvV1 { .. } => ResponseKind::KvV1,
            Self::KvV2 { .. } => ResponseKind::KvV2,
        }
    }
}

/// A request to write data through a client
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Full Vault path
    pub path: String,
    /// Request payload
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// One authenticated Vault session
pub struct VaultClient {
    id: String,
    stats: ClientStats,
    identity: OnceLock<ClientIdentity>,
    session: RwLock<Session>,
    tainted: AtomicBool,
    closed: AtomicBool,
    watcher: Mutex<Option<WatcherHandle>>,
    event_sink: mpsc::Sender<LifecycleEvent>,
    metrics: Arc<Metrics>,
    clone_key: Option<CloneKey>,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("id", &self.id)
            .field("cache_key", &self.identity.get().map(|i| &i.cache_key))
            .field("is_clone", &self.is_clone())
            .field("closed", &self.closed())
            .field("tainted", &self.tainted())
            .finish()
    }
}

impl VaultClient {
    /// A fresh, uninitialized client
    pub fn new(event_sink: mpsc::Sender<LifecycleEvent>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            stats: ClientStats::new(),
            identity: OnceLock::new(),
            session: RwLock::new(Session {
                token: None,
                last_auth: None,
                last_renewal: None,
                watcher_error: None,
            }),
            tainted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            watcher: Mutex::new(None),
            event_sink,
            metrics,
            clone_key: None,
        })
    }

    /// Fix the client's identity: transport, credential provider, cache key.
    ///
    /// Idempotent — a second call on an initialized client is a no-op.
    pub async fn init(
        &self,
        auth: VaultAuthConfig,
        conn: VaultConnectionConfig,
        provider_namespace: &str,
        source: Arc<dyn CredentialSource>,
    ) -> Result<(), ClientError> {
        if self.identity.get().is_some() {
            return Ok(());
        }
        let method = auth.auth_method()?.clone();
        let provider = CredentialProvider::new(&method, provider_namespace, source).await?;
        self.init_with_provider(auth, conn, provider)
    }

    /// [`Self::init`] with an already-constructed credential provider (the
    /// factory builds one anyway to derive the cache key)
    pub fn init_with_provider(
        &self,
        auth: VaultAuthConfig,
        conn: VaultConnectionConfig,
        provider: CredentialProvider,
    ) -> Result<(), ClientError> {
        if self.identity.get().is_some() {
            return Ok(());
        }
        let cache_key = CacheKey::derive(&CacheKeyInputs {
            method: provider.method(),
            auth_uid: &auth.uid,
            auth_generation: auth.generation,
            connection_uid: &conn.uid,
            connection_generation: conn.generation,
            provider_uid: provider.uid(),
        })?;
        let transport = Arc::new(conn.build_transport()?);
        let vault_namespace = auth
            .vault_namespace
            .clone()
            .or_else(|| conn.vault_namespace.clone());

        // Lost init races leave the winner's identity in place.
        let _ = self.identity.set(ClientIdentity {
            cache_key,
            auth,
            conn,
            provider,
            transport,
            vault_namespace,
        });
        Ok(())
    }

    fn identity(&self) -> Result<&ClientIdentity, ClientError> {
        self.identity.get().ok_or(ClientError::NotInitialized)
    }

    /// The session identity, if initialized
    pub fn identity_ref(&self) -> Option<&ClientIdentity> {
        self.identity.get()
    }

    /// Client id, assigned at creation
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Per-client counters
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// The cache key of the session (the parent's key for clones)
    pub fn cache_key(&self) -> Result<&CacheKey, ClientError> {
        Ok(&self.identity()?.cache_key)
    }

    /// The clone key, when this client is a namespace clone
    pub fn clone_key(&self) -> Option<&CloneKey> {
        self.clone_key.as_ref()
    }

    /// Whether this client is a namespace clone
    pub fn is_clone(&self) -> bool {
        self.clone_key.is_some()
    }

    /// The Vault namespace requests are scoped to
    pub fn namespace(&self) -> Option<&str> {
        self.identity
            .get()
            .and_then(|i| i.vault_namespace.as_deref())
    }

    /// Whether the client observed a transient error since its last
    /// successful validation
    pub fn tainted(&self) -> bool {
        self.tainted.load(Ordering::Relaxed)
    }

    /// Mark the client as having observed a transient error
    pub fn taint(&self) {
        self.tainted.store(true, Ordering::Relaxed);
    }

    /// Whether `close` was called
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Log in via the credential provider and seat the session.
    ///
    /// Starts the lifetime watcher when the server reports a renewable
    /// token.
    pub async fn login(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.closed() {
            return Err(ClientError::Closed);
        }
        let ident = self.identity()?;
        let mut creds = ident.provider.get_creds().await?;
        if let Some(params) = &ident.auth.params {
            creds.extend(params.clone());
        }
        let resp = ident
            .transport
            .login(&ident.auth.mount, &creds)
            .await
            .map_err(ClientError::Login)?;
        self.seat_session(resp)?;
        info!(
            client_id = %self.id,
            cache_key = %ident.cache_key,
            "vault login succeeded"
        );
        self.maybe_start_watcher();
        Ok(())
    }

    /// Re-seat a previously persisted auth response.
    ///
    /// Fails when the payload has no auth section; starts the watcher when
    /// the restored token is renewable.
    pub fn restore(self: &Arc<Self>, secret: VaultSecret) -> Result<(), ClientError> {
        if self.closed() {
            return Err(ClientError::Closed);
        }
        self.identity()?;
        if secret.auth.is_none() {
            return Err(ClientError::MissingAuth);
        }
        self.seat_session(secret)?;
        self.maybe_start_watcher();
        Ok(())
    }

    fn seat_session(&self, secret: VaultSecret) -> Result<(), ClientError> {
        let auth = secret.auth.as_ref().ok_or(ClientError::MissingAuth)?;
        let token = SecretString::from(auth.client_token.clone());
        let mut session = self.session.write();
        session.token = Some(token);
        session.last_auth = Some(secret);
        session.last_renewal = Some(Instant::now());
        session.watcher_error = None;
        Ok(())
    }

    fn maybe_start_watcher(self: &Arc<Self>) {
        if self.is_clone() {
            return;
        }
        let renewable = self.session.read().last_auth.as_ref().is_some_and(
            // Only the server's word starts a watcher; batch tokens and
            // non-renewable leases never get one.
            vault_api::VaultSecret::is_renewable,
        );
        if !renewable {
            return;
        }
        let mut slot = self.watcher.lock();
        if let Some(old) = slot.take() {
            old.stop();
        }
        *slot = Some(watcher::spawn(self));
    }

    /// Whether a lifetime watcher task is currently attached
    pub fn watcher_running(&self) -> bool {
        self.watcher.lock().as_ref().is_some_and(WatcherHandle::is_running)
    }

    pub(crate) fn record_watcher_error(&self, err: &ClientError) {
        self.session.write().watcher_error = Some(err.to_string());
        self.taint();
    }

    pub(crate) async fn emit(&self, event: LifecycleEvent) {
        if self.event_sink.send(event).await.is_err() {
            debug!(client_id = %self.id, "lifecycle sink closed, dropping event");
        }
    }

    pub(crate) fn renewal_horizon(&self) -> Duration {
        let ttl = self
            .session
            .read()
            .last_auth
            .as_ref()
            .map_or(0, VaultSecret::effective_lease_duration);
        watcher::horizon(ttl)
    }

    /// Renew the session token in place
    pub(crate) async fn renew(&self) -> Result<(), ClientError> {
        let ident = self.identity()?;
        let token = self.current_token()?;
        let resp = ident
            .transport
            .renew_self(token.expose_secret(), None)
            .await
            .map_err(|e| {
                self.taint();
                ClientError::Renewal(e)
            })?;
        self.seat_session(resp)?;
        debug!(client_id = %self.id, "vault token renewed");
        Ok(())
    }

    fn current_token(&self) -> Result<SecretString, ClientError> {
        self.session
            .read()
            .token
            .clone()
            .ok_or(ClientError::NotLoggedIn)
    }

    /// The auth response currently backing the session
    pub fn last_auth(&self) -> Option<VaultSecret> {
        self.session.read().last_auth.clone()
    }

    /// True when the token's lease will have run out `offset_secs` from now
    pub fn check_expiry(&self, offset_secs: u64) -> Result<bool, ClientError> {
        let session = self.session.read();
        let last_renewal = session.last_renewal.ok_or(ClientError::NotLoggedIn)?;
        let ttl = session
            .last_auth
            .as_ref()
            .map_or(0, VaultSecret::effective_lease_duration);
        drop(session);
        if ttl == 0 {
            // Zero lease duration is a non-expiring token.
            return Ok(false);
        }
        let horizon = Duration::from_secs(ttl.saturating_sub(offset_secs));
        Ok(last_renewal.elapsed() >= horizon)
    }

    /// Composite freshness check: initialized, open, unexpired, and no
    /// terminal watcher error. Clears the taint flag on success.
    pub fn validate(&self) -> Result<(), ClientError> {
        self.identity()?;
        if self.closed() {
            return Err(ClientError::Closed);
        }
        if let Some(err) = self.session.read().watcher_error.clone() {
            return Err(ClientError::WatcherTerminated(err));
        }
        if self.check_expiry(VALIDATE_EXPIRY_OFFSET_SECS)? {
            return Err(ClientError::Expired);
        }
        self.tainted.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Read a secret; errors taint the client
    pub async fn read(&self, req: ReadRequest) -> Result<ReadResponse, ClientError> {
        let (ident, token) = self.operational()?;
        let result = ident
            .transport
            .read(
                token.expose_secret(),
                self.namespace(),
                &req.request_path(),
            )
            .await;
        self.record_operation("read", result.is_err());
        match result {
            Ok(secret) => Ok(ReadResponse::new(req.kind(), secret)),
            Err(e) => {
                self.taint();
                Err(e.into())
            }
        }
    }

    /// Write data; errors taint the client
    pub async fn write(&self, req: WriteRequest) -> Result<Option<ReadResponse>, ClientError> {
        let (ident, token) = self.operational()?;
        let result = ident
            .transport
            .write(token.expose_secret(), self.namespace(), &req.path, &req.data)
            .await;
        self.record_operation("write", result.is_err());
        match result {
            Ok(secret) => Ok(secret.map(|s| ReadResponse::new(ResponseKind::Default, s))),
            Err(e) => {
                self.taint();
                Err(e.into())
            }
        }
    }

    fn operational(&self) -> Result<(&ClientIdentity, SecretString), ClientError> {
        if self.closed() {
            return Err(ClientError::Closed);
        }
        let ident = self.identity()?;
        let token = self.current_token()?;
        Ok((ident, token))
    }

    fn record_operation(&self, operation: &str, errored: bool) {
        let connection = self
            .identity
            .get()
            .map_or("", |i| i.conn.name.as_str());
        self.metrics
            .record_client_operation(operation, connection, errored);
    }

    /// A client sharing this session's token and transport, scoped to the
    /// given Vault namespace. Clones own no watcher; the parent renews for
    /// all of them.
    pub fn clone_for_namespace(&self, namespace: &str) -> Result<Arc<Self>, ClientError> {
        if self.is_clone() {
            return Err(CacheKeyError::AlreadyClone.into());
        }
        if self.closed() {
            return Err(ClientError::Closed);
        }
        let ident = self.identity()?;
        let clone_key = CloneKey::new(&ident.cache_key, namespace)?;
        let session = self.session.read();
        let clone = Self {
            id: Uuid::new_v4().to_string(),
            stats: ClientStats::new(),
            identity: OnceLock::new(),
            session: RwLock::new(Session {
                token: session.token.clone(),
                last_auth: session.last_auth.clone(),
                last_renewal: session.last_renewal,
                watcher_error: None,
            }),
            tainted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            watcher: Mutex::new(None),
            event_sink: self.event_sink.clone(),
            metrics: Arc::clone(&self.metrics),
            clone_key: Some(clone_key),
        };
        let _ = clone.identity.set(ClientIdentity {
            cache_key: ident.cache_key.clone(),
            auth: ident.auth.clone(),
            conn: ident.conn.clone(),
            provider: ident.provider.clone(),
            transport: Arc::clone(&ident.transport),
            vault_namespace: Some(namespace.to_string()),
        });
        Ok(Arc::new(clone))
    }

    /// Stop the lifetime watcher without closing the session. Safe to call
    /// from the cache's synchronous eviction callback.
    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.stop();
        }
    }

    /// Close the session: stop the watcher and, when asked, revoke the
    /// token best-effort. Idempotent; the closed state is terminal.
    pub async fn close(&self, revoke: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        if !revoke {
            return;
        }
        let Ok(ident) = self.identity() else { return };
        let Ok(token) = self.current_token() else {
            return;
        };
        match ident.transport.revoke_self(token.expose_secret()).await {
            Ok(()) => info!(client_id = %self.id, "vault token revoked"),
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "best-effort token revocation failed");
            }
        }
    }
}
