//! The Vault response envelope and its auth section.
//!
//! Every Vault API response shares one envelope shape; the `auth` section is
//! only present on login and token operations. The envelope round-trips
//! through serde unchanged because the operator persists whole auth
//! responses and restores them across restarts.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A Vault API response envelope
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct VaultSecret {
    /// Server-assigned request id
    #[serde(default)]
    pub request_id: String,

    /// Lease id for leased secrets (empty for token auth)
    #[serde(default)]
    pub lease_id: String,

    /// Lease duration in seconds
    #[serde(default)]
    pub lease_duration: u64,

    /// Whether the lease can be renewed
    #[serde(default)]
    pub renewable: bool,

    /// Engine-specific payload
    #[serde(default)]
    pub data: Option<Map<String, Value>>,

    /// Non-fatal warnings from the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,

    /// Auth section, present on login/renew responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthInfo>,
}

impl VaultSecret {
    /// Effective lease duration: the auth section's when present, else the
    /// envelope's.
    pub fn effective_lease_duration(&self) -> u64 {
        self.auth
            .as_ref()
            .map_or(self.lease_duration, |a| a.lease_duration)
    }

    /// Whether this response represents a renewable session
    pub fn is_renewable(&self) -> bool {
        self.auth.as_ref().is_some_and(|a| a.renewable) || self.renewable
    }
}

// Debug must never leak the client token into logs.
impl fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecret")
            .field("request_id", &self.request_id)
            .field("lease_id", &self.lease_id)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("has_data", &self.data.is_some())
            .field("auth", &self.auth)
            .finish()
    }
}

/// The `auth` section of a login or token response
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthInfo {
    /// The session token
    #[serde(default)]
    pub client_token: String,

    /// Token accessor (used for audit, never for auth)
    #[serde(default)]
    pub accessor: String,

    /// Policies attached to the token
    #[serde(default)]
    pub policies: Vec<String>,

    /// Auth-method metadata (role, service account, …)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    /// Token TTL in seconds
    #[serde(default)]
    pub lease_duration: u64,

    /// Whether the token can be renewed; batch tokens report false
    #[serde(default)]
    pub renewable: bool,

    /// Identity entity backing the token
    #[serde(default)]
    pub entity_id: String,

    /// "service" or "batch"
    #[serde(default)]
    pub token_type: String,

    /// Whether the token has no parent
    #[serde(default)]
    pub orphan: bool,

    /// Remaining uses, 0 for unlimited
    #[serde(default)]
    pub num_uses: i64,
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("client_token", &"<redacted>")
            .field("accessor", &self.accessor)
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("token_type", &self.token_type)
            .field("orphan", &self.orphan)
            .field("num_uses", &self.num_uses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn login_body() -> &'static str {
        r#"{
            "request_id": "b1f9a2c3",
            "lease_id": "",
            "renewable": false,
            "lease_duration": 0,
            "data": null,
            "auth": {
                "client_token": "hvs.CAES...",
                "accessor": "acc123",
                "policies": ["default", "reader"],
                "lease_duration": 3600,
                "renewable": true,
                "entity_id": "e-1",
                "token_type": "service",
                "orphan": true,
                "num_uses": 0
            }
        }"#
    }

    #[test]
    fn deserializes_login_response() {
        let secret: VaultSecret = serde_json::from_str(login_body()).unwrap();
        let auth = secret.auth.as_ref().unwrap();
        assert_eq!(auth.client_token, "hvs.CAES...");
        assert_eq!(auth.lease_duration, 3600);
        assert!(secret.is_renewable());
        assert_eq!(secret.effective_lease_duration(), 3600);
    }

    #[test]
    fn round_trips_through_serde() {
        let secret: VaultSecret = serde_json::from_str(login_body()).unwrap();
        let bytes = serde_json::to_vec(&secret).unwrap();
        let again: VaultSecret = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            again.auth.as_ref().unwrap().client_token,
            secret.auth.as_ref().unwrap().client_token
        );
        assert_eq!(again.effective_lease_duration(), 3600);
    }

    #[test]
    fn debug_output_redacts_token() {
        let secret: VaultSecret = serde_json::from_str(login_body()).unwrap();
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hvs.CAES"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn batch_tokens_are_not_renewable() {
        let secret = VaultSecret {
            auth: Some(AuthInfo {
                client_token: "b.token".into(),
                token_type: "batch".into(),
                renewable: false,
                lease_duration: 60,
                ..AuthInfo::default()
            }),
            ..VaultSecret::default()
        };
        assert!(!secret.is_renewable());
    }
}
