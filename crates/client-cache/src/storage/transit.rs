//! Encryption of persisted token blobs via Vault's transit engine.
//!
//! The codec drives `<mount>/encrypt/<key>` and `<mount>/decrypt/<key>`
//! through a dedicated client (the factory's storage-encryption
//! singleton). What lands in storage is the JSON-serialized
//! `{context, ciphertext}` pair, so a future key version or derivation
//! context round-trips without schema changes.

use crate::client::{VaultClient, WriteRequest};
use crate::core::error::{ClientError, StorageError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use vault_api::VaultError;

/// What the persistent store keeps for an encrypted record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransitCiphertext {
    /// Optional derivation context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    /// The `vault:vN:...` ciphertext
    ciphertext: String,
}

/// Encrypts and decrypts persisted token blobs
pub struct TransitCodec {
    client: Arc<VaultClient>,
    mount: String,
    key_name: String,
    ref_name: String,
}

impl TransitCodec {
    /// Codec over `client` for the given transit mount and key.
    /// `ref_name` labels persisted records with the transit reference in
    /// use.
    pub fn new(
        client: Arc<VaultClient>,
        mount: impl Into<String>,
        key_name: impl Into<String>,
        ref_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            mount: mount.into(),
            key_name: key_name.into(),
            ref_name: ref_name.into(),
        }
    }

    /// The transit reference recorded on encrypted records
    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    /// The client performing transit calls
    pub fn client(&self) -> &Arc<VaultClient> {
        &self.client
    }

    /// Encrypt `plain`, returning the serialized ciphertext envelope
    pub async fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut data = Map::new();
        data.insert("plaintext".into(), Value::from(BASE64.encode(plain)));
        let resp = self
            .call("encrypt", data)
            .await?;
        let ciphertext = response_field(&resp, "ciphertext")
            .ok_or_else(|| transit_error("encrypt", VaultError::MissingField {
                field: "data.ciphertext",
            }))?;
        Ok(serde_json::to_vec(&TransitCiphertext {
            context: None,
            ciphertext,
        })?)
    }

    /// Decrypt a serialized ciphertext envelope back to the original bytes
    pub async fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, StorageError> {
        let envelope: TransitCiphertext = serde_json::from_slice(blob)
            .map_err(|e| StorageError::TransitDecode(e.to_string()))?;
        let mut data = Map::new();
        data.insert("ciphertext".into(), Value::from(envelope.ciphertext));
        if let Some(context) = envelope.context {
            data.insert("context".into(), Value::from(context));
        }
        let resp = self.call("decrypt", data).await?;
        let plaintext = response_field(&resp, "plaintext")
            .ok_or_else(|| transit_error("decrypt", VaultError::MissingField {
                field: "data.plaintext",
            }))?;
        BASE64
            .decode(plaintext)
            .map_err(|e| StorageError::TransitDecode(e.to_string()))
    }

    async fn call(
        &self,
        operation: &'static str,
        data: Map<String, Value>,
    ) -> Result<vault_api::VaultSecret, StorageError> {
        let path = format!("{}/{}/{}", self.mount, operation, self.key_name);
        let resp = self
            .client
            .write(WriteRequest { path, data })
            .await
            .map_err(|e| StorageError::Transit {
                operation,
                source: Box::new(e),
            })?
            .ok_or_else(|| transit_error(operation, VaultError::EmptyResponse))?;
        Ok(resp.secret().clone())
    }
}

fn response_field(secret: &vault_api::VaultSecret, field: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn transit_error(operation: &'static str, err: VaultError) -> StorageError {
    StorageError::Transit {
        operation,
        source: Box::new(ClientError::Vault(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestContext};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn codec(server: &MockServer) -> TransitCodec {
        let ctx = TestContext::new();
        let client = crate::client::VaultClient::new(ctx.sink.clone(), ctx.metrics.clone());
        client
            .init(
                testing::auth_config(0),
                testing::conn_config(0, &server.uri()),
                "vso",
                testing::StubCredentialSource::new(0),
            )
            .await
            .unwrap();
        client
            .restore(testing::auth_secret("hvs.transit", 3600, false))
            .unwrap();
        TransitCodec::new(client, "transit", "vso-cache", "vso-transit")
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips() {
        let server = MockServer::start().await;
        let plain = br#"{"auth":{"client_token":"hvs.secret"}}"#;
        let encoded = BASE64.encode(plain);

        Mock::given(method("POST"))
            .and(path("/v1/transit/encrypt/vso-cache"))
            .and(body_partial_json(json!({"plaintext": encoded})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"ciphertext": "vault:v1:abc123"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/transit/decrypt/vso-cache"))
            .and(body_partial_json(json!({"ciphertext": "vault:v1:abc123"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"plaintext": encoded}
            })))
            .mount(&server)
            .await;

        let codec = codec(&server).await;
        let blob = codec.encrypt(plain).await.unwrap();
        // The stored blob is the serialized envelope, not raw ciphertext.
        let envelope: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(envelope.get("ciphertext").unwrap(), "vault:v1:abc123");

        let out = codec.decrypt(&blob).await.unwrap();
        assert_eq!(out, plain);
    }

    #[tokio::test]
    async fn missing_ciphertext_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/transit/encrypt/vso-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;

        let codec = codec(&server).await;
        let err = codec.encrypt(b"x").await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Transit {
                operation: "encrypt",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn garbage_blob_fails_decode() {
        let server = MockServer::start().await;
        let codec = codec(&server).await;
        let err = codec.decrypt(b"not-json").await.unwrap_err();
        assert!(matches!(err, StorageError::TransitDecode(_)));
    }
}
