//! Auth and connection descriptors.
//!
//! These are the factory's view of the `VaultAuth` / `VaultConnection`
//! custom resources: immutable per generation, resolved through the
//! [`crate::core::obj::ResourceResolver`] seam. A `VaultAuth` may leave
//! fields unset and inherit them from the operator-wide global default;
//! [`merge_auth`] produces the effective descriptor and validation always
//! runs on the merged result.

use crate::core::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use vault_api::{VaultError, VaultTransport};

/// Connection descriptor: where Vault is and how to trust it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConnectionConfig {
    /// Resource name
    pub name: String,
    /// Kubernetes namespace of the resource
    pub namespace: String,
    /// Object UID
    pub uid: String,
    /// Observed generation
    #[serde(default)]
    pub generation: i64,

    /// Vault server address (e.g. "https://vault.example.com:8200")
    pub address: String,
    /// PEM-encoded CA bundle to trust in addition to system roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_pem: Option<String>,
    /// Disable TLS verification. Development only.
    #[serde(default)]
    pub skip_tls_verify: bool,
    /// Server name to present during the TLS handshake (SNI override)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    /// Default Vault namespace for all requests over this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_namespace: Option<String>,
    /// Per-request timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl VaultConnectionConfig {
    /// Reject descriptors that cannot produce a working transport
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::MissingRequired { field: "address" });
        }
        if !self.skip_tls_verify
            && !self.address.starts_with("https://")
            && !self.address.starts_with("http://")
        {
            return Err(ConfigError::InvalidValue {
                field: "address",
                reason: "address must be an http(s) URL".into(),
            });
        }
        Ok(())
    }

    /// Build the HTTP transport described by this connection
    pub fn build_transport(&self) -> Result<VaultTransport, ConfigError> {
        self.validate()?;
        let mut builder = VaultTransport::builder(self.address.as_str())
            .timeout(self.timeout)
            .skip_verify(self.skip_tls_verify);
        if let Some(pem) = &self.ca_cert_pem {
            builder = builder.ca_cert_pem(pem.as_bytes().to_vec());
        }
        if let Some(sni) = &self.tls_server_name {
            builder = builder.tls_server_name(sni.as_str());
        }
        if let Some(ns) = &self.vault_namespace {
            builder = builder.namespace(ns.as_str());
        }
        builder.build().map_err(|e| match e {
            VaultError::InvalidAddress { reason, .. } => ConfigError::InvalidValue {
                field: "address",
                reason,
            },
            other => ConfigError::InvalidValue {
                field: "tls",
                reason: other.to_string(),
            },
        })
    }
}

/// Login method and its method-specific parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum AuthMethod {
    /// Kubernetes service-account JWT login
    #[serde(rename_all = "camelCase")]
    Kubernetes {
        /// Vault role to assume
        role: String,
        /// Service account whose token is presented
        service_account: String,
        /// Token audiences
        #[serde(default)]
        audiences: Vec<String>,
        /// TokenRequest expiration
        #[serde(default = "default_token_expiration")]
        token_expiration_seconds: i64,
    },
    /// Static or service-account-projected JWT login
    #[serde(rename_all = "camelCase")]
    Jwt {
        /// Vault role to assume
        role: String,
        /// Secret holding the JWT under key "jwt"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_ref: Option<String>,
        /// Service account to project a token from, when no secret ref
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_account: Option<String>,
        /// Token audiences
        #[serde(default)]
        audiences: Vec<String>,
    },
    /// AppRole login with role id + secret id
    #[serde(rename_all = "camelCase")]
    AppRole {
        /// The role id
        role_id: String,
        /// Secret holding the secret id under key "id"
        secret_ref: String,
    },
    /// AWS IAM login
    #[serde(rename_all = "camelCase")]
    Aws {
        /// Vault role to assume
        role: String,
        /// STS region
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        /// IRSA-annotated service account to source credentials from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        irsa_service_account: Option<String>,
        /// Value for the X-Vault-AWS-IAM-Server-ID header
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iam_server_id_header_value: Option<String>,
    },
    /// GCP IAM/GCE login
    #[serde(rename_all = "camelCase")]
    Gcp {
        /// Vault role to assume
        role: String,
        /// Workload-identity service account to source a JWT from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workload_identity_service_account: Option<String>,
        /// Compute region for GCE metadata
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
}

fn default_token_expiration() -> i64 {
    600
}

impl AuthMethod {
    /// The Vault auth-method name, as used in mount paths and cache keys
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kubernetes { .. } => "kubernetes",
            Self::Jwt { .. } => "jwt",
            Self::AppRole { .. } => "approle",
            Self::Aws { .. } => "aws",
            Self::Gcp { .. } => "gcp",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let missing = |field| Err(ConfigError::MissingRequired { field });
        match self {
            Self::Kubernetes {
                role,
                service_account,
                ..
            } => {
                if role.is_empty() {
                    return missing("kubernetes.role");
                }
                if service_account.is_empty() {
                    return missing("kubernetes.serviceAccount");
                }
            }
            Self::Jwt {
                role,
                secret_ref,
                service_account,
                ..
            } => {
                if role.is_empty() {
                    return missing("jwt.role");
                }
                if secret_ref.is_none() && service_account.is_none() {
                    return missing("jwt.secretRef");
                }
            }
            Self::AppRole { role_id, secret_ref } => {
                if role_id.is_empty() {
                    return missing("appRole.roleId");
                }
                if secret_ref.is_empty() {
                    return missing("appRole.secretRef");
                }
            }
            Self::Aws { role, .. } => {
                if role.is_empty() {
                    return missing("aws.role");
                }
            }
            Self::Gcp { role, .. } => {
                if role.is_empty() {
                    return missing("gcp.role");
                }
            }
        }
        Ok(())
    }
}

/// Auth descriptor: how to log in and who may use it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthConfig {
    /// Resource name
    pub name: String,
    /// Kubernetes namespace of the resource
    pub namespace: String,
    /// Object UID
    pub uid: String,
    /// Observed generation
    #[serde(default)]
    pub generation: i64,

    /// Name of the VaultConnection to use; `None` selects the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_ref: Option<String>,
    /// Auth mount path (e.g. "kubernetes")
    #[serde(default)]
    pub mount: String,
    /// Login method; may be inherited from the global default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<AuthMethod>,
    /// Extra parameters merged into the login payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Vault namespace override for sessions using this auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_namespace: Option<String>,
    /// Kubernetes namespaces allowed to reference this auth.
    /// `None` restricts use to the auth's own namespace; `"*"` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_namespaces: Option<Vec<String>>,
}

impl VaultAuthConfig {
    /// The effective login method, required after merging
    pub fn auth_method(&self) -> Result<&AuthMethod, ConfigError> {
        self.method
            .as_ref()
            .ok_or(ConfigError::MissingRequired { field: "method" })
    }

    /// Reject descriptors that cannot log in
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mount.is_empty() {
            return Err(ConfigError::MissingRequired { field: "mount" });
        }
        self.auth_method()?.validate()
    }

    /// Whether a CR in `namespace` may reference this auth
    pub fn namespace_allowed(&self, namespace: &str) -> bool {
        if namespace == self.namespace {
            return true;
        }
        match &self.allowed_namespaces {
            None => false,
            Some(list) => list.iter().any(|n| n == "*" || n == namespace),
        }
    }

    /// Error-path variant of [`Self::namespace_allowed`]
    pub fn check_namespace(&self, namespace: &str) -> Result<(), ConfigError> {
        if self.namespace_allowed(namespace) {
            Ok(())
        } else {
            Err(ConfigError::NamespaceNotAllowed {
                auth: format!("{}/{}", self.namespace, self.name),
                namespace: namespace.to_string(),
            })
        }
    }
}

/// How a field family inherits from the global default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Ignore the global value
    #[default]
    None,
    /// Use the local value when set, else the global one
    Replace,
    /// Union both; local entries win on conflict
    Union,
}

/// Operator-wide auth defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalVaultAuthConfig {
    /// Default auth mount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    /// Default login method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<AuthMethod>,
    /// Default login parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Default allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_namespaces: Option<Vec<String>>,
    /// How `params` inherits
    #[serde(default)]
    pub params_merge: MergeStrategy,
}

/// Merge a resolved auth with the global default and validate the result.
///
/// Scalars (mount, method) fall back to the global value when locally
/// unset; `params` follows the global's declared merge strategy; the
/// allow-list falls back wholesale.
pub fn merge_auth(
    local: &VaultAuthConfig,
    global: Option<&GlobalVaultAuthConfig>,
) -> Result<VaultAuthConfig, ConfigError> {
    let mut merged = local.clone();
    if let Some(global) = global {
        if merged.mount.is_empty() {
            if let Some(mount) = &global.mount {
                merged.mount.clone_from(mount);
            }
        }
        if merged.method.is_none() {
            merged.method.clone_from(&global.method);
        }
        merged.params = match global.params_merge {
            MergeStrategy::None => merged.params,
            MergeStrategy::Replace => merged.params.or_else(|| global.params.clone()),
            MergeStrategy::Union => match (global.params.clone(), merged.params) {
                (Some(mut base), Some(local)) => {
                    base.extend(local);
                    Some(base)
                }
                (base, local) => local.or(base),
            },
        };
        if merged.allowed_namespaces.is_none() {
            merged
                .allowed_namespaces
                .clone_from(&global.allowed_namespaces);
        }
    }
    merged.validate()?;
    Ok(merged)
}
