//! Credential providers for the supported login methods.
//!
//! A provider turns an auth descriptor into the parameter map posted to
//! `auth/<mount>/login`, and exposes the UID of the backing Kubernetes
//! object (service account or secret) so the cache key can incorporate the
//! credential identity. The factory only ever sees the tagged
//! [`CredentialProvider`] type.
//!
//! Fetching the actual material — TokenRequest calls, secret reads, cloud
//! signing — happens behind the [`CredentialSource`] seam owned by the
//! operator bootstrap.

use crate::config::AuthMethod;
use crate::core::error::ProviderError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Fetches credential material from the cluster (or signs cloud requests).
///
/// Implementations live with the operator bootstrap; tests use stubs.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// UID of a service account
    async fn service_account_uid(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, ProviderError>;

    /// UID of a secret
    async fn secret_uid(&self, namespace: &str, name: &str) -> Result<String, ProviderError>;

    /// Mint a service-account token via TokenRequest
    async fn service_account_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: &[String],
        expiration_seconds: i64,
    ) -> Result<SecretString, ProviderError>;

    /// Read one field of a secret
    async fn secret_field(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<SecretString, ProviderError>;

    /// Produce the signed `sts:GetCallerIdentity` parameter set for AWS IAM
    /// login. The default refuses; deployments that use the AWS method wire
    /// a signing implementation here.
    async fn sigv4_login_params(
        &self,
        _region: Option<&str>,
        _iam_server_id_header_value: Option<&str>,
    ) -> Result<Map<String, Value>, ProviderError> {
        Err(ProviderError::IncompleteConfig {
            method: "aws",
            field: "credentialSource.sigv4",
        })
    }
}

/// A credential provider for one login method
#[derive(Clone)]
pub enum CredentialProvider {
    /// Kubernetes service-account JWT
    Kubernetes(KubernetesCredentialProvider),
    /// Static or projected JWT
    Jwt(JwtCredentialProvider),
    /// AppRole role id + secret id
    AppRole(AppRoleCredentialProvider),
    /// AWS IAM
    Aws(AwsCredentialProvider),
    /// GCP workload identity
    Gcp(GcpCredentialProvider),
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("method", &self.method())
            .field("uid", &self.uid())
            .finish()
    }
}

impl CredentialProvider {
    /// Build the provider for `method`, resolving the backing object UID.
    ///
    /// `provider_namespace` is where the credential material lives — the
    /// referring CR's namespace for service accounts, the auth resource's
    /// for secret refs.
    pub async fn new(
        method: &AuthMethod,
        provider_namespace: &str,
        source: Arc<dyn CredentialSource>,
    ) -> Result<Self, ProviderError> {
        match method {
            AuthMethod::Kubernetes {
                role,
                service_account,
                audiences,
                token_expiration_seconds,
            } => {
                let uid = source
                    .service_account_uid(provider_namespace, service_account)
                    .await?;
                Ok(Self::Kubernetes(KubernetesCredentialProvider {
                    role: role.clone(),
                    service_account: service_account.clone(),
                    namespace: provider_namespace.to_string(),
                    audiences: audiences.clone(),
                    token_expiration_seconds: *token_expiration_seconds,
                    uid,
                    source,
                }))
            }
            AuthMethod::Jwt {
                role,
                secret_ref,
                service_account,
                audiences,
            } => {
                let (uid, material) = match (secret_ref, service_account) {
                    (Some(secret), _) => (
                        source.secret_uid(provider_namespace, secret).await?,
                        JwtMaterial::SecretRef(secret.clone()),
                    ),
                    (None, Some(sa)) => (
                        source.service_account_uid(provider_namespace, sa).await?,
                        JwtMaterial::ServiceAccount(sa.clone()),
                    ),
                    (None, None) => {
                        return Err(ProviderError::IncompleteConfig {
                            method: "jwt",
                            field: "secretRef",
                        });
                    }
                };
                Ok(Self::Jwt(JwtCredentialProvider {
                    role: role.clone(),
                    material,
                    namespace: provider_namespace.to_string(),
                    audiences: audiences.clone(),
                    uid,
                    source,
                }))
            }
            AuthMethod::AppRole { role_id, secret_ref } => {
                let uid = source.secret_uid(provider_namespace, secret_ref).await?;
                Ok(Self::AppRole(AppRoleCredentialProvider {
                    role_id: role_id.clone(),
                    secret_ref: secret_ref.clone(),
                    namespace: provider_namespace.to_string(),
                    uid,
                    source,
                }))
            }
            AuthMethod::Aws {
                role,
                region,
                irsa_service_account,
                iam_server_id_header_value,
            } => {
                let sa = irsa_service_account
                    .as_ref()
                    .ok_or(ProviderError::IncompleteConfig {
                        method: "aws",
                        field: "irsaServiceAccount",
                    })?;
                let uid = source.service_account_uid(provider_namespace, sa).await?;
                Ok(Self::Aws(AwsCredentialProvider {
                    role: role.clone(),
                    region: region.clone(),
                    iam_server_id_header_value: iam_server_id_header_value.clone(),
                    uid,
                    source,
                }))
            }
            AuthMethod::Gcp {
                role,
                workload_identity_service_account,
                ..
            } => {
                let sa = workload_identity_service_account.as_ref().ok_or(
                    ProviderError::IncompleteConfig {
                        method: "gcp",
                        field: "workloadIdentityServiceAccount",
                    },
                )?;
                let uid = source.service_account_uid(provider_namespace, sa).await?;
                Ok(Self::Gcp(GcpCredentialProvider {
                    role: role.clone(),
                    service_account: sa.clone(),
                    namespace: provider_namespace.to_string(),
                    uid,
                    source,
                }))
            }
        }
    }

    /// The login method name
    pub fn method(&self) -> &'static str {
        match self {
            Self::Kubernetes(_) => "kubernetes",
            Self::Jwt(_) => "jwt",
            Self::AppRole(_) => "approle",
            Self::Aws(_) => "aws",
            Self::Gcp(_) => "gcp",
        }
    }

    /// UID of the backing Kubernetes object
    pub fn uid(&self) -> &str {
        match self {
            Self::Kubernetes(p) => &p.uid,
            Self::Jwt(p) => &p.uid,
            Self::AppRole(p) => &p.uid,
            Self::Aws(p) => &p.uid,
            Self::Gcp(p) => &p.uid,
        }
    }

    /// The parameter map for `auth/<mount>/login`
    pub async fn get_creds(&self) -> Result<Map<String, Value>, ProviderError> {
        match self {
            Self::Kubernetes(p) => p.get_creds().await,
            Self::Jwt(p) => p.get_creds().await,
            Self::AppRole(p) => p.get_creds().await,
            Self::Aws(p) => p.get_creds().await,
            Self::Gcp(p) => p.get_creds().await,
        }
    }
}

#[derive(Clone)]
enum JwtMaterial {
    SecretRef(String),
    ServiceAccount(String),
}

/// Kubernetes service-account JWT provider
#[derive(Clone)]
pub struct KubernetesCredentialProvider {
    role: String,
    service_account: String,
    namespace: String,
    audiences: Vec<String>,
    token_expiration_seconds: i64,
    uid: String,
    source: Arc<dyn CredentialSource>,
}

impl KubernetesCredentialProvider {
    async fn get_creds(&self) -> Result<Map<String, Value>, ProviderError> {
        let jwt = self
            .source
            .service_account_token(
                &self.namespace,
                &self.service_account,
                &self.audiences,
                self.token_expiration_seconds,
            )
            .await?;
        let mut creds = Map::new();
        creds.insert("role".into(), Value::from(self.role.clone()));
        creds.insert("jwt".into(), Value::from(jwt.expose_secret()));
        Ok(creds)
    }
}

/// JWT provider, from a secret ref or a projected service-account token
#[derive(Clone)]
pub struct JwtCredentialProvider {
    role: String,
    material: JwtMaterial,
    namespace: String,
    audiences: Vec<String>,
    uid: String,
    source: Arc<dyn CredentialSource>,
}

/// Data key holding the token in a JWT credential secret
const JWT_SECRET_KEY: &str = "jwt";

impl JwtCredentialProvider {
    async fn get_creds(&self) -> Result<Map<String, Value>, ProviderError> {
        let jwt = match &self.material {
            JwtMaterial::SecretRef(secret) => {
                self.source
                    .secret_field(&self.namespace, secret, JWT_SECRET_KEY)
                    .await?
            }
            JwtMaterial::ServiceAccount(sa) => {
                self.source
                    .service_account_token(&self.namespace, sa, &self.audiences, 600)
                    .await?
            }
        };
        let mut creds = Map::new();
        creds.insert("role".into(), Value::from(self.role.clone()));
        creds.insert("jwt".into(), Value::from(jwt.expose_secret()));
        Ok(creds)
    }
}

/// AppRole provider
#[derive(Clone)]
pub struct AppRoleCredentialProvider {
    role_id: String,
    secret_ref: String,
    namespace: String,
    uid: String,
    source: Arc<dyn CredentialSource>,
}

/// Data key holding the secret id in an AppRole credential secret
const APPROLE_SECRET_KEY: &str = "id";

impl AppRoleCredentialProvider {
    async fn get_creds(&self) -> Result<Map<String, Value>, ProviderError> {
        let secret_id = self
            .source
            .secret_field(&self.namespace, &self.secret_ref, APPROLE_SECRET_KEY)
            .await?;
        let mut creds = Map::new();
        creds.insert("role_id".into(), Value::from(self.role_id.clone()));
        creds.insert("secret_id".into(), Value::from(secret_id.expose_secret()));
        Ok(creds)
    }
}

/// AWS IAM provider; request signing happens behind the source seam
#[derive(Clone)]
pub struct AwsCredentialProvider {
    role: String,
    region: Option<String>,
    iam_server_id_header_value: Option<String>,
    uid: String,
    source: Arc<dyn CredentialSource>,
}

impl AwsCredentialProvider {
    async fn get_creds(&self) -> Result<Map<String, Value>, ProviderError> {
        let mut creds = self
            .source
            .sigv4_login_params(
                self.region.as_deref(),
                self.iam_server_id_header_value.as_deref(),
            )
            .await?;
        creds.insert("role".into(), Value::from(self.role.clone()));
        Ok(creds)
    }
}

/// GCP workload-identity provider
#[derive(Clone)]
pub struct GcpCredentialProvider {
    role: String,
    service_account: String,
    namespace: String,
    uid: String,
    source: Arc<dyn CredentialSource>,
}

impl GcpCredentialProvider {
    async fn get_creds(&self) -> Result<Map<String, Value>, ProviderError> {
        // The audience must match the Vault role for the IAM flow.
        let audiences = vec![format!("vault/{}", self.role)];
        let jwt = self
            .source
            .service_account_token(&self.namespace, &self.service_account, &audiences, 900)
            .await?;
        let mut creds = Map::new();
        creds.insert("role".into(), Value::from(self.role.clone()));
        creds.insert("jwt".into(), Value::from(jwt.expose_secret()));
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SA_UID: &str = "9a8b7c6d-5e4f-4a3b-8c9d-1e2f3a4b5c6d";
    const SECRET_UID: &str = "0f1e2d3c-4b5a-4968-8776-655443322110";

    struct StubSource;

    #[async_trait]
    impl CredentialSource for StubSource {
        async fn service_account_uid(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<String, ProviderError> {
            Ok(SA_UID.to_string())
        }

        async fn secret_uid(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<String, ProviderError> {
            Ok(SECRET_UID.to_string())
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

    fn source() -> Arc<dyn CredentialSource> {
        Arc::new(StubSource)
    }

    #[tokio::test]
    async fn kubernetes_provider_builds_role_and_jwt() {
        let method = AuthMethod::Kubernetes {
            role: "app".into(),
            service_account: "default".into(),
            audiences: vec![],
            token_expiration_seconds: 600,
        };
        let provider = CredentialProvider::new(&method, "tenant", source())
            .await
            .unwrap();
        assert_eq!(provider.method(), "kubernetes");
        assert_eq!(provider.uid(), SA_UID);

        let creds = provider.get_creds().await.unwrap();
        assert_eq!(creds.get("role").unwrap(), "app");
        assert_eq!(creds.get("jwt").unwrap(), "sa-jwt-tenant-default");
    }

    #[tokio::test]
    async fn jwt_provider_prefers_secret_ref() {
        let method = AuthMethod::Jwt {
            role: "app".into(),
            secret_ref: Some("jwt-cred".into()),
            service_account: Some("ignored".into()),
            audiences: vec![],
        };
        let provider = CredentialProvider::new(&method, "tenant", source())
            .await
            .unwrap();
        assert_eq!(provider.uid(), SECRET_UID);
        let creds = provider.get_creds().await.unwrap();
        assert_eq!(creds.get("jwt").unwrap(), "jwt-cred-jwt");
    }

    #[tokio::test]
    async fn jwt_provider_requires_some_material() {
        let method = AuthMethod::Jwt {
            role: "app".into(),
            secret_ref: None,
            service_account: None,
            audiences: vec![],
        };
        let err = CredentialProvider::new(&method, "tenant", source())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::IncompleteConfig {
                method: "jwt",
                field: "secretRef"
            }
        ));
    }

    #[tokio::test]
    async fn approle_provider_reads_secret_id() {
        let method = AuthMethod::AppRole {
            role_id: "r-123".into(),
            secret_ref: "approle-cred".into(),
        };
        let provider = CredentialProvider::new(&method, "tenant", source())
            .await
            .unwrap();
        let creds = provider.get_creds().await.unwrap();
        assert_eq!(creds.get("role_id").unwrap(), "r-123");
        assert_eq!(creds.get("secret_id").unwrap(), "approle-cred-id");
    }

    #[tokio::test]
    async fn aws_provider_without_signer_refuses() {
        let method = AuthMethod::Aws {
            role: "app".into(),
            region: None,
            irsa_service_account: Some("aws-irsa".into()),
            iam_server_id_header_value: None,
        };
        let provider = CredentialProvider::new(&method, "tenant", source())
            .await
            .unwrap();
        let err = provider.get_creds().await.unwrap_err();
        assert!(matches!(err, ProviderError::IncompleteConfig { .. }));
    }

    #[tokio::test]
    async fn gcp_provider_scopes_audience_to_role() {
        struct AudienceCheck;
        #[async_trait]
        impl CredentialSource for AudienceCheck {
            async fn service_account_uid(
                &self,
                _n: &str,
                _s: &str,
            ) -> Result<String, ProviderError> {
                Ok(SA_UID.to_string())
            }
            async fn secret_uid(&self, _n: &str, _s: &str) -> Result<String, ProviderError> {
                unreachable!()
            }
            async fn service_account_token(
                &self,
                _n: &str,
                _s: &str,
                audiences: &[String],
                _e: i64,
            ) -> Result<SecretString, ProviderError> {
                assert_eq!(audiences, ["vault/app"]);
                Ok(SecretString::from("gcp-jwt"))
            }
            async fn secret_field(
                &self,
                _n: &str,
                _s: &str,
                _k: &str,
            ) -> Result<SecretString, ProviderError> {
                unreachable!()
            }
        }

        let method = AuthMethod::Gcp {
            role: "app".into(),
            workload_identity_service_account: Some("gcp-wi".into()),
            region: None,
        };
        let provider = CredentialProvider::new(&method, "tenant", Arc::new(AudienceCheck))
            .await
            .unwrap();
        let creds = provider.get_creds().await.unwrap();
        assert_eq!(creds.get("jwt").unwrap(), "gcp-jwt");
    }
}
