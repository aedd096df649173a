//! Thin HTTP transport for the HashiCorp Vault API.
//!
//! This crate covers exactly the surface the operator's client cache needs:
//! login against an auth mount, raw path-level read/write, token
//! renewal/revocation, and the response-view decoders that reconcilers use
//! to turn a Vault response into Kubernetes Secret data. Engine-specific
//! semantics (KV versioning, PKI, transit) live with the callers; this
//! crate only knows how to move JSON in and out of Vault.

/// Error types for Vault API calls
pub mod error;
/// Response-view decoders (default, KV-v1, KV-v2)
pub mod response;
/// The Vault response envelope and auth section
pub mod secret;
/// The HTTP transport itself
pub mod transport;

pub use crate::error::VaultError;
pub use crate::response::{ReadResponse, ResponseKind, K8S_SECRET_RAW_KEY};
pub use crate::secret::{AuthInfo, VaultSecret};
pub use crate::transport::{VaultTransport, VaultTransportBuilder};
