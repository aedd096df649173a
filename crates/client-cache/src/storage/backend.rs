//! The secrets backend seam.
//!
//! The persistent store reads and writes plain Kubernetes `Secret`
//! objects; this trait is the only place the Kubernetes API appears.
//! [`KubeSecretsBackend`] is the production implementation over a
//! namespaced `Api<Secret>`; [`MemorySecretsBackend`] backs the test
//! suites.

use crate::core::error::BackendError;
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use tracing::debug;

/// Stores cache records as Kubernetes Secrets
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Fetch a secret by name; `None` when absent
    async fn get(&self, name: &str) -> Result<Option<Secret>, BackendError>;

    /// Create a secret; fails with [`BackendError::AlreadyExists`] on
    /// name conflicts
    async fn create(&self, secret: &Secret) -> Result<Secret, BackendError>;

    /// Delete a secret by name. Idempotent.
    async fn delete(&self, name: &str) -> Result<(), BackendError>;

    /// List secrets matching an equality-based label selector
    async fn list(&self, label_selector: &str) -> Result<Vec<Secret>, BackendError>;
}

/// Production backend over the Kubernetes API, scoped to the operator
/// namespace
pub struct KubeSecretsBackend {
    api: Api<Secret>,
}

impl KubeSecretsBackend {
    /// Backend over `client`, scoped to `namespace`
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl SecretsBackend for KubeSecretsBackend {
    async fn get(&self, name: &str) -> Result<Option<Secret>, BackendError> {
        match self.api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(BackendError::Kube(e)),
        }
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, BackendError> {
        match self.api.create(&PostParams::default(), secret).await {
            Ok(created) => Ok(created),
            Err(e) if is_status(&e, 409) => Err(BackendError::AlreadyExists {
                name: secret.metadata.name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(BackendError::Kube(e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                debug!(name, "delete of absent secret");
                Ok(())
            }
            Err(e) => Err(BackendError::Kube(e)),
        }
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Secret>, BackendError> {
        let params = ListParams::default().labels(label_selector);
        match self.api.list(&params).await {
            Ok(list) => Ok(list.items),
            Err(e) => Err(BackendError::Kube(e)),
        }
    }
}

/// In-memory backend for tests and non-cluster tooling
#[derive(Default)]
pub struct MemorySecretsBackend {
    secrets: DashMap<String, Secret>,
}

impl MemorySecretsBackend {
    /// An empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether the backend is empty
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

fn matches_selector(secret: &Secret, selector: &str) -> bool {
    let labels = secret.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|have| have == v),
            None => false,
        })
}

#[async_trait]
impl SecretsBackend for MemorySecretsBackend {
    async fn get(&self, name: &str) -> Result<Option<Secret>, BackendError> {
        Ok(self.secrets.get(name).map(|s| s.clone()))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, BackendError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        if self.secrets.contains_key(&name) {
            return Err(BackendError::AlreadyExists { name });
        }
        self.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.secrets.remove(name);
        Ok(())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Secret>, BackendError> {
        Ok(self
            .secrets
            .iter()
            .filter(|entry| matches_selector(entry.value(), label_selector))
            .map(|entry| entry.value().clone())
            .collect())
    }
}
