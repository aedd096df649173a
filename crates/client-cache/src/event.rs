//! Kubernetes Event publication seam.
//!
//! Every user-surfaced failure (and a few notable successes) is reported as
//! an Event on the referring custom resource with a stable reason token.
//! The real recorder wraps the controller runtime's event API and lives
//! with the operator bootstrap; [`LogEventRecorder`] is the in-crate
//! fallback used by tests and non-cluster tooling.

use crate::core::obj::ObjectRef;
use tracing::{info, warn};

/// Event severity, mirroring the Kubernetes event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational
    Normal,
    /// Something the user should look at
    Warning,
}

/// Stable reason tokens used by the factory
pub mod reason {
    /// A new client logged in
    pub const CLIENT_LOGIN: &str = "ClientLogin";
    /// Login or credential acquisition failed
    pub const LOGIN_FAILED: &str = "VaultLoginFailed";
    /// Cache key derivation or resolution failed
    pub const INVALID_CLIENT_CONFIG: &str = "InvalidClientConfig";
    /// A persisted record failed verification
    pub const CACHE_RESTORE_FAILED: &str = "CacheRestoreFailed";
    /// A client was evicted from the cache
    pub const CLIENT_EVICTED: &str = "ClientEvicted";
    /// The factory is shut down
    pub const FACTORY_DISABLED: &str = "FactoryDisabled";
}

/// One event to publish
#[derive(Debug, Clone)]
pub struct Event {
    /// Severity
    pub event_type: EventType,
    /// Stable reason token
    pub reason: &'static str,
    /// Human-readable detail
    pub message: String,
}

impl Event {
    /// A Normal event
    pub fn normal(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason,
            message: message.into(),
        }
    }

    /// A Warning event
    pub fn warning(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason,
            message: message.into(),
        }
    }
}

/// Publishes Events against a referring object
pub trait EventRecorder: Send + Sync {
    /// Publish one event. Failures to publish must not fail the caller.
    fn record(&self, object: &ObjectRef, event: Event);
}

/// Recorder that writes events to the tracing log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventRecorder;

impl EventRecorder for LogEventRecorder {
    fn record(&self, object: &ObjectRef, event: Event) {
        match event.event_type {
            EventType::Normal => {
                info!(object = %object, reason = event.reason, "{}", event.message);
            }
            EventType::Warning => {
                warn!(object = %object, reason = event.reason, "{}", event.message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_severity() {
        let e = Event::normal(reason::CLIENT_LOGIN, "logged in");
        assert_eq!(e.event_type, EventType::Normal);
        let e = Event::warning(reason::LOGIN_FAILED, "denied");
        assert_eq!(e.event_type, EventType::Warning);
        assert_eq!(e.reason, "VaultLoginFailed");
    }
}
