//! Test fixtures and stubs.
//!
//! Shared by the in-crate unit tests and the integration suites: canned
//! auth/connection descriptors with deterministic UIDs, a credential
//! source that never touches a cluster, a static resolver, a recording
//! event recorder, and a minimal [`SyncableObject`] implementation.

use crate::client::{LifecycleEvent, VaultClient};
use crate::config::{AuthMethod, GlobalVaultAuthConfig, VaultAuthConfig, VaultConnectionConfig};
use crate::core::error::{ConfigError, ProviderError};
use crate::core::key::CacheKey;
use crate::core::obj::{ObjectRef, ResourceResolver, SyncableObject, VaultClientMeta};
use crate::event::{Event, EventRecorder};
use crate::metrics::Metrics;
use crate::providers::CredentialSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use secrecy::SecretString;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use vault_api::{AuthInfo, VaultSecret};

/// A deterministic 36-character UID
pub fn uid(group: u8, index: u64) -> String {
    format!("{group:08x}-0000-4000-8000-{index:012x}")
}

/// Shared per-test wiring: metrics registry and the lifecycle channel
pub struct TestContext {
    /// Metrics registered into the held registry
    pub metrics: Arc<Metrics>,
    /// The registry backing `metrics`, for exposition assertions
    pub registry: Mutex<Registry>,
    /// Send half handed to clients
    pub sink: mpsc::Sender<LifecycleEvent>,
    /// Receive half for asserting emitted events
    pub events: tokio::sync::Mutex<mpsc::Receiver<LifecycleEvent>>,
}

impl TestContext {
    /// Fresh wiring
    pub fn new() -> Arc<Self> {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        let (sink, rx) = mpsc::channel(64);
        Arc::new(Self {
            metrics,
            registry: Mutex::new(registry),
            sink,
            events: tokio::sync::Mutex::new(rx),
        })
    }

    /// Current metrics in Prometheus text exposition
    pub fn metrics_text(&self) -> String {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry.lock())
            .expect("metrics encode");
        out
    }
}

/// Auth descriptor `index`, pointing at the stock kubernetes method
pub fn auth_config(index: u64) -> VaultAuthConfig {
    VaultAuthConfig {
        name: format!("auth-{index}"),
        namespace: "vso".into(),
        uid: uid(0xA, index),
        generation: 0,
        connection_ref: None,
        mount: "kubernetes".into(),
        method: Some(AuthMethod::Kubernetes {
            role: "app".into(),
            service_account: "default".into(),
            audiences: vec![],
            token_expiration_seconds: 600,
        }),
        params: None,
        vault_namespace: None,
        allowed_namespaces: Some(vec!["*".into()]),
    }
}

/// Connection descriptor `index` for the given address
pub fn conn_config(index: u64, address: &str) -> VaultConnectionConfig {
    VaultConnectionConfig {
        name: format!("conn-{index}"),
        namespace: "vso".into(),
        uid: uid(0xB, index),
        generation: 0,
        address: address.into(),
        ca_cert_pem: None,
        skip_tls_verify: false,
        tls_server_name: None,
        vault_namespace: None,
        timeout: Duration::from_secs(5),
    }
}

/// A synthetic auth response
pub fn auth_secret(token: &str, lease_secs: u64, renewable: bool) -> VaultSecret {
    VaultSecret {
        request_id: "fixture".into(),
        auth: Some(AuthInfo {
            client_token: token.into(),
            accessor: "fixture-accessor".into(),
            policies: vec!["default".into()],
            lease_duration: lease_secs,
            renewable,
            token_type: if renewable { "service" } else { "batch" }.into(),
            ..AuthInfo::default()
        }),
        ..VaultSecret::default()
    }
}

/// Credential source with a fixed provider UID; never touches a cluster
pub struct StubCredentialSource {
    /// UID reported for every backing object
    pub uid: String,
}

impl StubCredentialSource {
    /// Source reporting provider uid `index`
    pub fn new(index: u64) -> Arc<Self> {
        Arc::new(Self {
            uid: uid(0xC, index),
        })
    }
}

#[async_trait]
impl CredentialSource for StubCredentialSource {
    async fn service_account_uid(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<String, ProviderError> {
        Ok(self.uid.clone())
    }

    async fn secret_uid(&self, _namespace: &str, _name: &str) -> Result<String, ProviderError> {
        Ok(self.uid.clone())
    }

    async fn service_account_token(
        &self,
        namespace: &str,
        name: &str,
        _audiences: &[String],
        _expiration_seconds: i64,
    ) -> Result<SecretString, ProviderError> {
        Ok(SecretString::from(format!("sa-jwt-{namespace}-{name}")))
    }

    async fn secret_field(
        &self,
        _namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<SecretString, ProviderError> {
        Ok(SecretString::from(format!("{name}-{key}")))
    }
}

/// An initialized (but not logged-in) client with identity `index`
pub async fn initialized_client(ctx: &Arc<TestContext>, index: u64) -> Arc<VaultClient> {
    let client = VaultClient::new(ctx.sink.clone(), Arc::clone(&ctx.metrics));
    client
        .init(
            auth_config(index),
            conn_config(index, "http://127.0.0.1:8201"),
            "tenant",
            StubCredentialSource::new(index),
        )
        .await
        .expect("fixture init");
    client
}

/// An initialized client seated with a non-renewable fixture session
pub async fn logged_in_client(ctx: &Arc<TestContext>) -> Arc<VaultClient> {
    let client = initialized_client(ctx, 0).await;
    client
        .restore(auth_secret("hvs.fixture", 3600, false))
        .expect("fixture restore");
    client
}

/// Resolver that always answers with the same descriptors
pub struct StaticResolver {
    /// Auth handed to every `vault_auth` call
    pub auth: VaultAuthConfig,
    /// Connection handed to every `vault_connection` call
    pub conn: VaultConnectionConfig,
    /// Optional global defaults
    pub global: Option<GlobalVaultAuthConfig>,
    /// Cache keys reported as referenced by live CRs
    pub referenced: Mutex<HashSet<CacheKey>>,
}

impl StaticResolver {
    /// Resolver for identity `index` against `address`
    pub fn new(index: u64, address: &str) -> Arc<Self> {
        Arc::new(Self {
            auth: auth_config(index),
            conn: conn_config(index, address),
            global: None,
            referenced: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl ResourceResolver for StaticResolver {
    async fn vault_auth(
        &self,
        _namespace: &str,
        _name: Option<&str>,
    ) -> Result<VaultAuthConfig, ConfigError> {
        Ok(self.auth.clone())
    }

    async fn vault_connection(
        &self,
        _namespace: &str,
        _name: Option<&str>,
    ) -> Result<VaultConnectionConfig, ConfigError> {
        Ok(self.conn.clone())
    }

    async fn global_vault_auth(&self) -> Result<Option<GlobalVaultAuthConfig>, ConfigError> {
        Ok(self.global.clone())
    }

    async fn referenced_cache_keys(&self) -> Result<HashSet<CacheKey>, ConfigError> {
        Ok(self.referenced.lock().clone())
    }
}

/// Resolver serving one connection and several auths, selected by ref name
pub struct MultiAuthResolver {
    /// Auths by resource name; the `None` ref resolves `default_auth`
    pub auths: std::collections::HashMap<String, VaultAuthConfig>,
    /// Name served when the object has no auth ref
    pub default_auth: String,
    /// Connection handed to every `vault_connection` call
    pub conn: VaultConnectionConfig,
    /// Cache keys reported as referenced by live CRs
    pub referenced: Mutex<HashSet<CacheKey>>,
}

impl MultiAuthResolver {
    /// Resolver serving auths `0..count` against `address`; `auth-0` is
    /// the default
    pub fn new(count: u64, address: &str) -> Arc<Self> {
        let auths = (0..count)
            .map(|i| (format!("auth-{i}"), auth_config(i)))
            .collect();
        Arc::new(Self {
            auths,
            default_auth: "auth-0".into(),
            conn: conn_config(0, address),
            referenced: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl ResourceResolver for MultiAuthResolver {
    async fn vault_auth(
        &self,
        namespace: &str,
        name: Option<&str>,
    ) -> Result<VaultAuthConfig, ConfigError> {
        let name = name.unwrap_or(&self.default_auth);
        self.auths
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound {
                kind: "VaultAuth",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn vault_connection(
        &self,
        _namespace: &str,
        _name: Option<&str>,
    ) -> Result<VaultConnectionConfig, ConfigError> {
        Ok(self.conn.clone())
    }

    async fn global_vault_auth(&self) -> Result<Option<GlobalVaultAuthConfig>, ConfigError> {
        Ok(None)
    }

    async fn referenced_cache_keys(&self) -> Result<HashSet<CacheKey>, ConfigError> {
        Ok(self.referenced.lock().clone())
    }
}

/// Event recorder that captures instead of publishing
#[derive(Default)]
pub struct RecordingEventRecorder {
    /// Everything recorded so far
    pub events: Mutex<Vec<(ObjectRef, Event)>>,
}

impl RecordingEventRecorder {
    /// Reasons recorded so far, in order
    pub fn reasons(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(_, e)| e.reason).collect()
    }
}

impl EventRecorder for RecordingEventRecorder {
    fn record(&self, object: &ObjectRef, event: Event) {
        self.events.lock().push((object.clone(), event));
    }
}

/// Minimal syncable object for driving the factory
pub struct TestObject {
    object_ref: ObjectRef,
    auth_ref: Option<String>,
    vault_namespace: Option<String>,
    /// Mutable stand-in for `status.vaultClientMeta`
    pub meta: Mutex<Option<VaultClientMeta>>,
}

impl TestObject {
    /// Object `namespace/name` with a deterministic UID
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            object_ref: ObjectRef {
                kind: "VaultStaticSecret".into(),
                namespace: namespace.into(),
                name: name.into(),
                uid: uid(0xD, name.len() as u64),
            },
            auth_ref: None,
            vault_namespace: None,
            meta: Mutex::new(None),
        }
    }

    /// Scope reads to a Vault namespace
    pub fn with_vault_namespace(mut self, namespace: &str) -> Self {
        self.vault_namespace = Some(namespace.into());
        self
    }

    /// Reference a named VaultAuth
    pub fn with_auth_ref(mut self, name: &str) -> Self {
        self.auth_ref = Some(name.into());
        self
    }
}

impl SyncableObject for TestObject {
    fn object_ref(&self) -> ObjectRef {
        self.object_ref.clone()
    }

    fn namespace(&self) -> &str {
        &self.object_ref.namespace
    }

    fn vault_auth_ref(&self) -> Option<&str> {
        self.auth_ref.as_deref()
    }

    fn vault_namespace(&self) -> Option<&str> {
        self.vault_namespace.as_deref()
    }

    fn vault_client_meta(&self) -> Option<VaultClientMeta> {
        self.meta.lock().clone()
    }
}
