//! End-to-end factory scenarios against a stubbed Vault server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vso_client_cache::core::error::FactoryError;
use vso_client_cache::factory::{
    CachingClientFactory, ClientCachePruneRequest, FactoryConfig, ShutdownCoordinator,
    ShutdownMode, ShutdownRequest, ShutdownStatus,
};
use vso_client_cache::storage::{MemorySecretsBackend, SecretsBackend};
use vso_client_cache::SyncableObject;
use vso_client_cache::testing::{
    MultiAuthResolver, RecordingEventRecorder, StubCredentialSource, TestContext, TestObject,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn login_response(lease: u64, renewable: bool) -> serde_json::Value {
    json!({
        "request_id": "r-login",
        "auth": {
            "client_token": "hvs.scenario",
            "accessor": "acc",
            "policies": ["default"],
            "lease_duration": lease,
            "renewable": renewable,
            "token_type": if renewable { "service" } else { "batch" }
        }
    })
}

async fn mount_login(server: &MockServer, expect: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/auth/kubernetes/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_response(3600, true)))
        .expect(expect)
        .mount(server)
        .await;
}

struct Harness {
    ctx: Arc<TestContext>,
    resolver: Arc<MultiAuthResolver>,
    recorder: Arc<RecordingEventRecorder>,
    backend: Arc<MemorySecretsBackend>,
    factory: Arc<CachingClientFactory>,
}

async fn harness(server: &MockServer, config: FactoryConfig) -> Harness {
    let ctx = TestContext::new();
    let resolver = MultiAuthResolver::new(3, &server.uri());
    let recorder = Arc::new(RecordingEventRecorder::default());
    let backend = Arc::new(MemorySecretsBackend::new());
    let factory = CachingClientFactory::builder()
        .config(config)
        .resolver(Arc::clone(&resolver) as _)
        .credentials(StubCredentialSource::new(9))
        .recorder(Arc::clone(&recorder) as _)
        .backend(Arc::clone(&backend) as Arc<dyn SecretsBackend>)
        .metrics(Arc::clone(&ctx.metrics))
        .build()
        .expect("factory build");
    Harness {
        ctx,
        resolver,
        recorder,
        backend,
        factory,
    }
}

fn persisting_config() -> FactoryConfig {
    FactoryConfig {
        persist: true,
        ..FactoryConfig::default()
    }
}

// Scenario: cache miss with persistence disabled performs one login and
// caches the client; nothing lands in storage.
#[tokio::test]
async fn cache_miss_without_persistence_logs_in() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;
    let h = harness(&server, FactoryConfig::default()).await;

    let obj = TestObject::new("tenant", "app-secret");
    let client = h.factory.get(&obj).await.unwrap();

    assert!(client.cache_key().unwrap().as_str().starts_with("kubernetes-"));
    assert_eq!(h.factory.cache().len(), 1);
    assert!(h.backend.is_empty());
    assert!(client.watcher_running());
    assert!(h.recorder.reasons().contains(&"ClientLogin"));
}

// Scenario: a second get for the same object is a cache hit; no second
// login happens and the hit counter moves.
#[tokio::test]
async fn cache_hit_returns_same_client() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;
    let h = harness(&server, FactoryConfig::default()).await;

    let obj = TestObject::new("tenant", "app-secret");
    let first = h.factory.get(&obj).await.unwrap();
    *obj.meta.lock() = Some(vso_client_cache::core::obj::VaultClientMeta {
        cache_key: Some(first.cache_key().unwrap().clone()),
        id: Some(first.id().to_string()),
        creation_timestamp: Some(first.stats().created_at()),
    });
    let second = h.factory.get(&obj).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(first.stats().ref_count(), 1);
    let metrics = h.ctx.metrics_text();
    assert!(metrics.contains("vso_client_cache_hits_total 1"));
    assert!(metrics.contains("vso_client_factory_requests_total 2"));
}

// Invariant: concurrent gets for one cache key issue at most one login.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_share_one_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/kubernetes/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(login_response(3600, true))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let h = harness(&server, FactoryConfig::default()).await;
    let factory = Arc::clone(&h.factory);

    let mut tasks = Vec::new();
    for i in 0..4 {
        let factory = Arc::clone(&factory);
        tasks.push(tokio::spawn(async move {
            let obj = TestObject::new("tenant", &format!("obj-{i}"));
            factory.get(&obj).await.map(|c| c.id().to_string())
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers share the same client");
    assert_eq!(h.factory.cache().len(), 1);
}

// Scenario: persisted sessions survive an operator restart — the second
// factory restores from storage without logging in again.
#[tokio::test]
async fn persisted_session_restores_without_login() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;
    let h = harness(&server, persisting_config()).await;

    let obj = TestObject::new("tenant", "app-secret");
    let client = h.factory.get(&obj).await.unwrap();
    let key = client.cache_key().unwrap().clone();
    // Record plus the HKDF key secret.
    assert_eq!(h.backend.len(), 2);

    // "Restart": fresh factory over the same backend, no logins allowed.
    let restarted = CachingClientFactory::builder()
        .config(persisting_config())
        .resolver(Arc::clone(&h.resolver) as _)
        .credentials(StubCredentialSource::new(9))
        .backend(Arc::clone(&h.backend) as Arc<dyn SecretsBackend>)
        .build()
        .unwrap();
    let restored = restarted.get(&obj).await.unwrap();
    assert_eq!(restored.cache_key().unwrap(), &key);
    assert!(restored.validate().is_ok());
}

// Scenario: a tampered persisted record is quarantined and the factory
// falls through to a fresh login.
#[tokio::test]
async fn tampered_record_falls_through_to_login() {
    let server = MockServer::start().await;
    mount_login(&server, 2).await;
    let h = harness(&server, persisting_config()).await;

    let obj = TestObject::new("tenant", "app-secret");
    let client = h.factory.get(&obj).await.unwrap();
    let record_name = format!("vso-cc-{}", client.cache_key().unwrap());

    // Corrupt the MAC out-of-band.
    let mut raw = h.backend.get(&record_name).await.unwrap().unwrap();
    if let Some(data) = raw.data.as_mut() {
        data.insert(
            "messageMAC".to_string(),
            k8s_openapi::ByteString(vec![0u8; 32]),
        );
    }
    h.backend.delete(&record_name).await.unwrap();
    h.backend.create(&raw).await.unwrap();

    let restarted = CachingClientFactory::builder()
        .config(persisting_config())
        .resolver(Arc::clone(&h.resolver) as _)
        .credentials(StubCredentialSource::new(9))
        .recorder(Arc::clone(&h.recorder) as _)
        .backend(Arc::clone(&h.backend) as Arc<dyn SecretsBackend>)
        .build()
        .unwrap();
    let fresh = restarted.get(&obj).await.unwrap();
    assert!(fresh.validate().is_ok());
    assert!(h.recorder.reasons().contains(&"CacheRestoreFailed"));
    // The tampered record was replaced by the fresh session's record.
    let replaced = h.backend.get(&record_name).await.unwrap().unwrap();
    let mac = replaced.data.unwrap().get("messageMAC").unwrap().0.clone();
    assert_ne!(mac, vec![0u8; 32]);
}

// Scenario: requesting a Vault namespace derives a cached clone; the
// parent keeps the only watcher.
#[tokio::test]
async fn namespace_request_derives_clone() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;
    let h = harness(&server, FactoryConfig::default()).await;

    let obj = TestObject::new("tenant", "app-secret").with_vault_namespace("tenant-a");
    let clone = h.factory.get(&obj).await.unwrap();

    assert!(clone.is_clone());
    assert_eq!(clone.namespace(), Some("tenant-a"));
    assert!(!clone.watcher_running());

    let stats = h.factory.cache().stats();
    assert_eq!(stats.len, 1);
    assert_eq!(stats.clone_len, 1);

    let parent = h
        .factory
        .cache()
        .peek(clone.cache_key().unwrap())
        .expect("parent cached");
    assert!(parent.watcher_running());
    assert_eq!(
        clone.clone_key().unwrap().to_string(),
        format!("{}-tenant-a", parent.cache_key().unwrap())
    );

    // Same namespace again: the cached clone is reused.
    let again = h.factory.get(&obj).await.unwrap();
    assert_eq!(again.id(), clone.id());
}

// Scenario: shutdown with revoke closes every client, revokes every
// token, purges storage, and disables the factory.
#[tokio::test]
async fn shutdown_with_revoke_purges_everything() {
    let server = MockServer::start().await;
    mount_login(&server, 3).await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/token/revoke-self"))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&server)
        .await;
    let h = harness(&server, persisting_config()).await;

    let mut clients = Vec::new();
    for i in 0..3 {
        let obj = TestObject::new("tenant", &format!("obj-{i}")).with_auth_ref(&format!("auth-{i}"));
        clients.push(h.factory.get(&obj).await.unwrap());
    }
    assert_eq!(h.factory.cache().len(), 3);
    assert_eq!(h.factory.storage().unwrap().len().await.unwrap(), 3);

    h.factory
        .shutdown(ShutdownRequest { revoke: true })
        .await
        .unwrap();

    assert!(h.factory.cache().is_empty());
    assert_eq!(h.factory.storage().unwrap().len().await.unwrap(), 0);
    for client in &clients {
        assert!(client.closed());
    }

    let obj = TestObject::new("tenant", "late");
    let err = h.factory.get(&obj).await.unwrap_err();
    assert!(matches!(err, FactoryError::Disabled));
    assert!(h.recorder.reasons().contains(&"FactoryDisabled"));
}

// Scenario: an unreferenced client older than the grace age is pruned;
// a younger one survives.
#[tokio::test]
async fn orphan_pruning_respects_grace_age() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;
    let config = FactoryConfig {
        prune_orphan_age: Duration::from_secs(600),
        ..FactoryConfig::default()
    };
    let h = harness(&server, config).await;

    let obj = TestObject::new("tenant", "app-secret");
    let client = h.factory.get(&obj).await.unwrap();
    let key = client.cache_key().unwrap().clone();

    // Young and unreferenced: survives the sweep.
    assert_eq!(h.factory.prune_orphans().await.unwrap(), 0);
    assert_eq!(h.factory.cache().len(), 1);

    // Referenced: survives even with a zero grace age.
    h.resolver.referenced.lock().insert(key.clone());
    let server2 = MockServer::start().await;
    mount_login(&server2, 1).await;
    let aggressive = FactoryConfig {
        prune_orphan_age: Duration::ZERO,
        ..FactoryConfig::default()
    };
    let h2 = harness(&server2, aggressive).await;
    let obj2 = TestObject::new("tenant", "other");
    let client2 = h2.factory.get(&obj2).await.unwrap();
    h2.resolver
        .referenced
        .lock()
        .insert(client2.cache_key().unwrap().clone());
    assert_eq!(h2.factory.prune_orphans().await.unwrap(), 0);

    // Unreferenced with zero grace age: evicted and closed.
    h2.resolver.referenced.lock().clear();
    assert_eq!(h2.factory.prune_orphans().await.unwrap(), 1);
    assert!(h2.factory.cache().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client2.closed());
}

// Pruning by auth identity evicts matching clients and their records.
#[tokio::test]
async fn prune_by_auth_uid() {
    let server = MockServer::start().await;
    mount_login(&server, 2).await;
    let h = harness(&server, persisting_config()).await;

    let keep = TestObject::new("tenant", "keep");
    let drop_obj = TestObject::new("tenant", "drop").with_auth_ref("auth-1");
    h.factory.get(&keep).await.unwrap();
    let dropped = h.factory.get(&drop_obj).await.unwrap();
    assert_eq!(h.factory.cache().len(), 2);

    let auth_uid = vso_client_cache::testing::uid(0xA, 1);
    let evicted = h
        .factory
        .prune(
            &drop_obj.object_ref(),
            ClientCachePruneRequest::for_auth_uid(auth_uid),
        )
        .await
        .unwrap();
    assert_eq!(evicted, 1);
    assert_eq!(h.factory.cache().len(), 1);
    assert!(h.factory.cache().peek(dropped.cache_key().unwrap()).is_none());
    assert_eq!(h.factory.storage().unwrap().len().await.unwrap(), 1);
}

// A CR moving between namespaces it is not allowed to use fails with the
// allow-list error rather than silently dropping the reference.
#[tokio::test]
async fn namespace_allow_list_violation_is_an_error() {
    let server = MockServer::start().await;
    let ctx = TestContext::new();
    let resolver = MultiAuthResolver::new(1, &server.uri());
    let mut auth = resolver.auths.get("auth-0").unwrap().clone();
    auth.allowed_namespaces = Some(vec!["team-a".into()]);
    let resolver = Arc::new(MultiAuthResolver {
        auths: [("auth-0".to_string(), auth)].into_iter().collect(),
        default_auth: "auth-0".into(),
        conn: resolver.conn.clone(),
        referenced: parking_lot::Mutex::new(Default::default()),
    });
    let factory = CachingClientFactory::builder()
        .resolver(resolver as _)
        .credentials(StubCredentialSource::new(9))
        .metrics(Arc::clone(&ctx.metrics))
        .build()
        .unwrap();

    let obj = TestObject::new("team-b", "app-secret");
    let err = factory.get(&obj).await.unwrap_err();
    assert!(matches!(
        err,
        FactoryError::Config(vso_client_cache::core::error::ConfigError::NamespaceNotAllowed { .. })
    ));
}

// Deleting a CR decrements its client's reference count.
#[tokio::test]
async fn unregister_object_ref_decrements() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;
    let h = harness(&server, FactoryConfig::default()).await;

    let obj = TestObject::new("tenant", "app-secret");
    let client = h.factory.get(&obj).await.unwrap();
    assert_eq!(client.stats().ref_count(), 1);

    *obj.meta.lock() = Some(vso_client_cache::core::obj::VaultClientMeta {
        cache_key: Some(client.cache_key().unwrap().clone()),
        id: Some(client.id().to_string()),
        creation_timestamp: Some(client.stats().created_at()),
    });
    h.factory.unregister_object_ref(&obj).await;
    assert_eq!(client.stats().ref_count(), 0);
}

// The shutdown coordinator is single-shot.
#[tokio::test]
async fn shutdown_coordinator_is_single_shot() {
    let server = MockServer::start().await;
    let h = harness(&server, FactoryConfig::default()).await;
    let coordinator = ShutdownCoordinator::new(Arc::clone(&h.factory));
    assert_eq!(coordinator.status(), ShutdownStatus::Idle);

    let status = coordinator.signal(ShutdownMode::NoRevoke).await.unwrap();
    assert_eq!(status, ShutdownStatus::Done);
    assert!(h.factory.is_shut_down());

    // A second signal (even with a different mode) is a no-op.
    let status = coordinator.signal(ShutdownMode::Revoke).await.unwrap();
    assert_eq!(status, ShutdownStatus::Done);
}
