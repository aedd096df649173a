//! Prometheus metrics.
//!
//! All metrics register into a caller-supplied
//! [`prometheus_client::registry::Registry`] so the operator owns exactly
//! one registry and tests get a fresh one per case. Counters take the
//! conventional `_total` suffix at exposition time.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Instant;

/// Labels for per-operation client metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClientOperationLabels {
    /// Operation name ("read", "write", "login", …)
    pub operation: String,
    /// Name of the VaultConnection in use
    pub vault_connection: String,
}

/// Labels for per-operation storage metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StorageOperationLabels {
    /// Operation name ("store", "restore", "prune", "delete", …)
    pub operation: String,
}

/// Labels describing the persistent-store configuration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StorageConfigLabels {
    /// Whether persistence is enabled
    pub persist: String,
    /// Whether encryption is enforced
    pub enforce_encryption: String,
}

/// Labels on the build-info gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildInfoLabels {
    /// Crate version
    pub version: String,
}

/// Labels on the per-resource status gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceStatusLabels {
    /// Resource kind
    pub kind: String,
    /// Resource namespace
    pub namespace: String,
    /// Resource name
    pub name: String,
}

/// All metrics exported by the client cache
pub struct Metrics {
    cache_hits: Counter,
    cache_misses: Counter,
    cache_evictions: Counter,
    clone_cache_hits: Counter,
    clone_cache_misses: Counter,
    clone_cache_evictions: Counter,
    cache_size: Gauge,
    cache_length: Gauge,
    tainted_clients: Gauge,
    client_refs: Gauge,

    storage_length: Gauge,
    storage_config: Family<StorageConfigLabels, Gauge>,
    storage_requests: Counter,
    storage_request_errors: Counter,
    storage_operations: Family<StorageOperationLabels, Counter>,
    storage_operation_errors: Family<StorageOperationLabels, Counter>,

    factory_requests: Counter,
    factory_request_errors: Counter,
    factory_operation_time: Histogram,

    client_operations: Family<ClientOperationLabels, Counter>,
    client_operation_errors: Family<ClientOperationLabels, Counter>,

    build_info: Family<BuildInfoLabels, Gauge>,
    resource_status: Family<ResourceStatusLabels, Gauge>,
}

impl Metrics {
    /// Register every metric into `registry` and hand back the shared
    /// handle
    pub fn new(registry: &mut Registry) -> Arc<Self> {
        let metrics = Self {
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            cache_evictions: Counter::default(),
            clone_cache_hits: Counter::default(),
            clone_cache_misses: Counter::default(),
            clone_cache_evictions: Counter::default(),
            cache_size: Gauge::default(),
            cache_length: Gauge::default(),
            tainted_clients: Gauge::default(),
            client_refs: Gauge::default(),
            storage_length: Gauge::default(),
            storage_config: Family::default(),
            storage_requests: Counter::default(),
            storage_request_errors: Counter::default(),
            storage_operations: Family::default(),
            storage_operation_errors: Family::default(),
            factory_requests: Counter::default(),
            factory_request_errors: Counter::default(),
            factory_operation_time: Histogram::new(exponential_buckets(0.005, 2.0, 12)),
            client_operations: Family::default(),
            client_operation_errors: Family::default(),
            build_info: Family::default(),
            resource_status: Family::default(),
        };

        registry.register(
            "vso_client_cache_hits",
            "Client cache hits",
            metrics.cache_hits.clone(),
        );
        registry.register(
            "vso_client_cache_misses",
            "Client cache misses",
            metrics.cache_misses.clone(),
        );
        registry.register(
            "vso_client_cache_evictions",
            "Client cache evictions",
            metrics.cache_evictions.clone(),
        );
        registry.register(
            "vso_client_clone_cache_hits",
            "Clone cache hits",
            metrics.clone_cache_hits.clone(),
        );
        registry.register(
            "vso_client_clone_cache_misses",
            "Clone cache misses",
            metrics.clone_cache_misses.clone(),
        );
        registry.register(
            "vso_client_clone_cache_evictions",
            "Clone cache evictions",
            metrics.clone_cache_evictions.clone(),
        );
        registry.register(
            "vso_client_cache_size",
            "Configured client cache capacity",
            metrics.cache_size.clone(),
        );
        registry.register(
            "vso_client_cache_length",
            "Live client cache entries",
            metrics.cache_length.clone(),
        );
        registry.register(
            "vso_client_cache_tainted_clients",
            "Cached clients currently tainted",
            metrics.tainted_clients.clone(),
        );
        registry.register(
            "vso_client_cache_client_refs",
            "Sum of custom-resource references to cached clients",
            metrics.client_refs.clone(),
        );
        registry.register(
            "vso_client_cache_storage_length",
            "Persisted cache records",
            metrics.storage_length.clone(),
        );
        registry.register(
            "vso_client_cache_storage_config",
            "Persistent-store configuration",
            metrics.storage_config.clone(),
        );
        registry.register(
            "vso_client_cache_storage_requests",
            "Persistent-store requests",
            metrics.storage_requests.clone(),
        );
        registry.register(
            "vso_client_cache_storage_requests_errors",
            "Persistent-store request failures",
            metrics.storage_request_errors.clone(),
        );
        registry.register(
            "vso_client_cache_storage_operations",
            "Persistent-store operations by kind",
            metrics.storage_operations.clone(),
        );
        registry.register(
            "vso_client_cache_storage_operations_errors",
            "Persistent-store operation failures by kind",
            metrics.storage_operation_errors.clone(),
        );
        registry.register(
            "vso_client_factory_requests",
            "Client factory requests",
            metrics.factory_requests.clone(),
        );
        registry.register(
            "vso_client_factory_requests_errors",
            "Client factory request failures",
            metrics.factory_request_errors.clone(),
        );
        registry.register(
            "vso_client_factory_operations_time_seconds",
            "Client factory operation latency",
            metrics.factory_operation_time.clone(),
        );
        registry.register(
            "vso_client_operations",
            "Vault operations by kind and connection",
            metrics.client_operations.clone(),
        );
        registry.register(
            "vso_client_operations_errors",
            "Vault operation failures by kind and connection",
            metrics.client_operation_errors.clone(),
        );
        registry.register(
            "vso_build_info",
            "Build metadata",
            metrics.build_info.clone(),
        );
        registry.register(
            "controller_resource_status",
            "Per-resource reconciliation status",
            metrics.resource_status.clone(),
        );

        metrics
            .build_info
            .get_or_create(&BuildInfoLabels {
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .set(1);

        Arc::new(metrics)
    }

    /// Record a primary cache lookup
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.inc();
        } else {
            self.cache_misses.inc();
        }
    }

    /// Record a clone cache lookup
    pub fn record_clone_lookup(&self, hit: bool) {
        if hit {
            self.clone_cache_hits.inc();
        } else {
            self.clone_cache_misses.inc();
        }
    }

    /// Record a primary cache eviction
    pub fn record_cache_eviction(&self) {
        self.cache_evictions.inc();
    }

    /// Record a clone cache eviction
    pub fn record_clone_eviction(&self) {
        self.clone_cache_evictions.inc();
    }

    /// Record one Vault operation through a client
    pub fn record_client_operation(&self, operation: &str, vault_connection: &str, errored: bool) {
        let labels = ClientOperationLabels {
            operation: operation.to_string(),
            vault_connection: vault_connection.to_string(),
        };
        self.client_operations.get_or_create(&labels).inc();
        if errored {
            self.client_operation_errors.get_or_create(&labels).inc();
        }
    }

    /// Record one top-level persistent-store request
    pub fn record_storage_request(&self, errored: bool) {
        self.storage_requests.inc();
        if errored {
            self.storage_request_errors.inc();
        }
    }

    /// Record one persistent-store operation
    pub fn record_storage_operation(&self, operation: &str, errored: bool) {
        let labels = StorageOperationLabels {
            operation: operation.to_string(),
        };
        self.storage_operations.get_or_create(&labels).inc();
        if errored {
            self.storage_operation_errors.get_or_create(&labels).inc();
        }
    }

    /// Publish the persistent-store configuration
    pub fn set_storage_config(&self, persist: bool, enforce_encryption: bool) {
        self.storage_config
            .get_or_create(&StorageConfigLabels {
                persist: persist.to_string(),
                enforce_encryption: enforce_encryption.to_string(),
            })
            .set(1);
    }

    /// Publish the persisted record count
    pub fn set_storage_length(&self, length: i64) {
        self.storage_length.set(length);
    }

    /// Record one factory request
    pub fn record_factory_request(&self, errored: bool) {
        self.factory_requests.inc();
        if errored {
            self.factory_request_errors.inc();
        }
    }

    /// Time a factory operation; observation happens when the guard drops
    pub fn factory_timer(self: &Arc<Self>) -> FactoryTimer {
        FactoryTimer {
            metrics: Arc::clone(self),
            started: Instant::now(),
        }
    }

    /// Publish cache occupancy gauges
    pub fn set_cache_gauges(&self, length: usize, capacity: usize, tainted: usize, refs: i64) {
        self.cache_length.set(length as i64);
        self.cache_size.set(capacity as i64);
        self.tainted_clients.set(tainted as i64);
        self.client_refs.set(refs);
    }

    /// Publish a per-resource status value
    pub fn set_resource_status(&self, kind: &str, namespace: &str, name: &str, value: i64) {
        self.resource_status
            .get_or_create(&ResourceStatusLabels {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .set(value);
    }
}

/// Drop guard recording elapsed factory-operation time
pub struct FactoryTimer {
    metrics: Arc<Metrics>,
    started: Instant,
}

impl Drop for FactoryTimer {
    fn drop(&mut self) {
        self.metrics
            .factory_operation_time
            .observe(self.started.elapsed().as_secs_f64());
    }
}
