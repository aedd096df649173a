//! Response views over the Vault envelope.
//!
//! Reconcilers pick a view based on the request they issued: the default
//! view hands back the payload as-is, KV-v1 requires a raw payload to be
//! present, and KV-v2 unwraps the versioned `data.data` nesting. All three
//! project into Kubernetes Secret data the same way.

use crate::error::VaultError;
use crate::secret::VaultSecret;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Reserved key in the K8s data projection holding the JSON-serialized raw
/// payload. Its presence in source data is rejected.
pub const K8S_SECRET_RAW_KEY: &str = "_raw";

/// Which decoder applies to a read response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Payload handed back as-is
    Default,
    /// KV version 1: a raw payload is required
    KvV1,
    /// KV version 2: payload lives under `data.data`
    KvV2,
}

/// A decoded read response
#[derive(Debug, Clone)]
pub struct ReadResponse {
    kind: ResponseKind,
    secret: VaultSecret,
}

impl ReadResponse {
    /// Wrap a Vault response with the decoder for the issuing request
    pub fn new(kind: ResponseKind, secret: VaultSecret) -> Self {
        Self { kind, secret }
    }

    /// The decoder in effect
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// The raw response envelope
    pub fn secret(&self) -> &VaultSecret {
        &self.secret
    }

    /// The view's payload.
    ///
    /// The default view tolerates an absent payload (some endpoints answer
    /// with auth or lease information only); the KV views do not.
    pub fn data(&self) -> Result<Map<String, Value>, VaultError> {
        match self.kind {
            ResponseKind::Default => Ok(self.secret.data.clone().unwrap_or_default()),
            ResponseKind::KvV1 => self
                .secret
                .data
                .clone()
                .ok_or(VaultError::MissingField { field: "data" }),
            ResponseKind::KvV2 => {
                let outer = self
                    .secret
                    .data
                    .as_ref()
                    .ok_or(VaultError::MissingField { field: "data" })?;
                match outer.get("data") {
                    Some(Value::Object(inner)) => Ok(inner.clone()),
                    _ => Err(VaultError::MissingField { field: "data.data" }),
                }
            }
        }
    }

    /// Project the payload into Kubernetes Secret data.
    ///
    /// Strings are emitted verbatim as bytes; numbers, bools, and null as
    /// their JSON text; arrays and objects JSON-encoded. The raw payload is
    /// added under [`K8S_SECRET_RAW_KEY`].
    pub fn secret_k8s_data(&self) -> Result<HashMap<String, Vec<u8>>, VaultError> {
        let data = self.data()?;
        let mut out = HashMap::with_capacity(data.len() + 1);
        for (key, value) in &data {
            if key == K8S_SECRET_RAW_KEY {
                return Err(VaultError::ReservedKeyViolation {
                    key: K8S_SECRET_RAW_KEY,
                });
            }
            out.insert(key.clone(), value_bytes(value)?);
        }
        let raw = self.secret.data.clone().unwrap_or_default();
        out.insert(
            K8S_SECRET_RAW_KEY.to_string(),
            serde_json::to_vec(&Value::Object(raw))?,
        );
        Ok(out)
    }
}

fn value_bytes(value: &Value) -> Result<Vec<u8>, VaultError> {
    match value {
        Value::String(s) => Ok(s.clone().into_bytes()),
        Value::Array(_) | Value::Object(_) => Ok(serde_json::to_vec(value)?),
        other => Ok(other.to_string().into_bytes()),
    }
}
