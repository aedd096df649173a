//! The HTTP transport: login, raw read/write, token renew/revoke.
//!
//! The transport is deliberately stateless with respect to authentication:
//! the session token is passed per call by the owning client, which lets a
//! namespace-scoped clone share one transport with its parent. TLS trust,
//! SNI override, and the default Vault namespace are fixed at build time
//! from the connection configuration.

use crate::error::VaultError;
use crate::secret::VaultSecret;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;
use url::Url;

const HEADER_TOKEN: &str = "X-Vault-Token";
const HEADER_NAMESPACE: &str = "X-Vault-Namespace";
const HEADER_REQUEST: &str = "X-Vault-Request";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`VaultTransport`]
#[derive(Debug, Clone)]
pub struct VaultTransportBuilder {
    address: String,
    ca_cert_pem: Option<Vec<u8>>,
    skip_verify: bool,
    tls_server_name: Option<String>,
    timeout: Duration,
    namespace: Option<String>,
}

impl VaultTransportBuilder {
    /// Start a builder for the given Vault address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ca_cert_pem: None,
            skip_verify: false,
            tls_server_name: None,
            timeout: DEFAULT_TIMEOUT,
            namespace: None,
        }
    }

    /// Trust the given PEM-encoded CA bundle in addition to system roots
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Disable TLS verification. Development only.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// Present this server name during the TLS handshake instead of the
    /// address host. Requires the address host to be an IP literal.
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    /// Per-request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default Vault namespace sent with every request
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Build the transport
    pub fn build(self) -> Result<VaultTransport, VaultError> {
        let mut base = Url::parse(&self.address).map_err(|e| VaultError::InvalidAddress {
            address: self.address.clone(),
            reason: e.to_string(),
        })?;
        if base.host_str().is_none() {
            return Err(VaultError::InvalidAddress {
                address: self.address.clone(),
                reason: "address has no host".into(),
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_REQUEST, HeaderValue::from_static("true"));

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(self.skip_verify);

        if let Some(pem) = &self.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| VaultError::InvalidTls(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }

        // SNI override: swap the URL host for the server name and pin the
        // connection to the original IP. Only meaningful for IP addresses;
        // a hostname already controls its own SNI.
        if let Some(server_name) = &self.tls_server_name {
            let host = base.host_str().unwrap_or_default().to_string();
            let ip: IpAddr = host.parse().map_err(|_| VaultError::InvalidAddress {
                address: self.address.clone(),
                reason: format!("tls server name {server_name:?} requires an IP address host"),
            })?;
            let port = base.port_or_known_default().unwrap_or(8200);
            builder = builder.resolve(server_name, SocketAddr::new(ip, port));
            base.set_host(Some(server_name))
                .map_err(|e| VaultError::InvalidAddress {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })?;
        }

        Ok(VaultTransport {
            http: builder.build()?,
            base,
            namespace: self.namespace,
        })
    }
}

/// A connection to one Vault server
#[derive(Debug, Clone)]
pub struct VaultTransport {
    http: reqwest::Client,
    base: Url,
    namespace: Option<String>,
}

/// Vault error response body
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultTransport {
    /// Start building a transport for the given address
    pub fn builder(address: impl Into<String>) -> VaultTransportBuilder {
        VaultTransportBuilder::new(address)
    }

    /// The server address this transport talks to
    pub fn address(&self) -> &Url {
        &self.base
    }

    /// The default namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Log in against an auth mount, returning the auth response
    pub async fn login(
        &self,
        mount: &str,
        params: &Map<String, Value>,
    ) -> Result<VaultSecret, VaultError> {
        let path = format!("auth/{}/login", mount.trim_matches('/'));
        let body = Value::Object(params.clone());
        self.call(reqwest::Method::POST, &path, None, None, Some(&body))
            .await?
            .ok_or(VaultError::EmptyResponse)
    }

    /// Read a secret at the given path
    pub async fn read(
        &self,
        token: &str,
        namespace: Option<&str>,
        path: &str,
    ) -> Result<VaultSecret, VaultError> {
        self.call(reqwest::Method::GET, path, Some(token), namespace, None)
            .await?
            .ok_or(VaultError::EmptyResponse)
    }

    /// Write data to the given path. Some endpoints answer 204 with no body.
    pub async fn write(
        &self,
        token: &str,
        namespace: Option<&str>,
        path: &str,
        data: &Map<String, Value>,
    ) -> Result<Option<VaultSecret>, VaultError> {
        let body = Value::Object(data.clone());
        self.call(
            reqwest::Method::POST,
            path,
            Some(token),
            namespace,
            Some(&body),
        )
        .await
    }

    /// Renew the calling token, optionally requesting an increment (seconds)
    pub async fn renew_self(
        &self,
        token: &str,
        increment: Option<u64>,
    ) -> Result<VaultSecret, VaultError> {
        let mut data = Map::new();
        if let Some(inc) = increment {
            data.insert("increment".into(), Value::from(inc));
        }
        let body = Value::Object(data);
        self.call(
            reqwest::Method::POST,
            "auth/token/renew-self",
            Some(token),
            None,
            Some(&body),
        )
        .await?
        .ok_or(VaultError::EmptyResponse)
    }

    /// Revoke the calling token. 204 on success.
    pub async fn revoke_self(&self, token: &str) -> Result<(), VaultError> {
        self.call(
            reqwest::Method::POST,
            "auth/token/revoke-self",
            Some(token),
            None,
            None,
        )
        .await
        .map(|_| ())
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        token: Option<&str>,
        namespace: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Option<VaultSecret>, VaultError> {
        let url = self
            .base
            .join(&format!("v1/{}", path.trim_start_matches('/')))
            .map_err(|e| VaultError::InvalidAddress {
                address: self.base.to_string(),
                reason: e.to_string(),
            })?;

        let mut req = self.http.request(method.clone(), url);
        if let Some(token) = token {
            req = req.header(HEADER_TOKEN, token);
        }
        // Per-call namespace wins over the transport default.
        if let Some(ns) = namespace.or(self.namespace.as_deref()) {
            if !ns.is_empty() {
                req = req.header(HEADER_NAMESPACE, ns);
            }
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        debug!(%method, path, status = status.as_u16(), "vault api call");

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let errors = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|b| b.errors)
                .unwrap_or_default();
            return Err(VaultError::Api {
                code: status.as_u16(),
                errors,
            });
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
