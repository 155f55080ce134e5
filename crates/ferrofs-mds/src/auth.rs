//! Authorizer verification for incoming connections.
//!
//! Two registries select a handler by protocol id: the cluster registry
//! covers inter-MDS peers, the service registry everything else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ferrofs_types::{GlobalId, Result, StatusCode, make_error_msg};

/// Shared-key authorizer protocol id.
pub const AUTH_PROTOCOL_SHARED_KEY: u32 = 2;
/// Unauthenticated protocol id, for clusters running with auth off.
pub const AUTH_PROTOCOL_NONE: u32 = 1;

/// Credentials presented by a connecting peer.
#[derive(Debug, Clone)]
pub struct Authorizer {
    pub protocol: u32,
    /// Entity string such as `"client.admin"`.
    pub entity: String,
    pub global_id: GlobalId,
    /// Shared secret checked by the handler.
    pub key: String,
    /// Capability string; `None` for legacy providers.
    pub caps: Option<String>,
    /// Set by providers that grant everything without a cap string.
    pub allow_all: bool,
}

/// What a successful verification yields.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub entity: String,
    pub global_id: GlobalId,
    pub caps: Option<String>,
    pub allow_all: bool,
}

/// Verifies authorizers for one protocol.
pub trait AuthorizeHandler: Send + Sync {
    fn verify(&self, authorizer: &Authorizer) -> Result<AuthIdentity>;
}

/// Handler registry keyed by protocol id.
#[derive(Default)]
pub struct AuthHandlerRegistry {
    handlers: HashMap<u32, Arc<dyn AuthorizeHandler>>,
}

impl AuthHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: u32, handler: Arc<dyn AuthorizeHandler>) {
        self.handlers.insert(protocol, handler);
    }

    pub fn get_handler(&self, protocol: u32) -> Option<Arc<dyn AuthorizeHandler>> {
        self.handlers.get(&protocol).cloned()
    }

    /// Registry with the shared-key handler installed under its
    /// standard protocol id.
    pub fn with_shared_key(keys: impl IntoIterator<Item = String>) -> Self {
        let mut reg = Self::new();
        reg.register(
            AUTH_PROTOCOL_SHARED_KEY,
            Arc::new(SharedKeyAuthHandler::new(keys)),
        );
        reg
    }
}

/// Accepts peers presenting any key from a configured set.
pub struct SharedKeyAuthHandler {
    keys: HashSet<String>,
}

impl SharedKeyAuthHandler {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

impl AuthorizeHandler for SharedKeyAuthHandler {
    fn verify(&self, authorizer: &Authorizer) -> Result<AuthIdentity> {
        if !self.keys.contains(&authorizer.key) {
            return make_error_msg(
                StatusCode::AUTHENTICATION_FAIL,
                format!("bad key for entity {}", authorizer.entity),
            );
        }
        Ok(AuthIdentity {
            entity: authorizer.entity.clone(),
            global_id: authorizer.global_id,
            caps: authorizer.caps.clone(),
            allow_all: authorizer.allow_all,
        })
    }
}

/// Accepts everyone; used when the cluster runs without authentication.
pub struct NoneAuthHandler;

impl AuthorizeHandler for NoneAuthHandler {
    fn verify(&self, authorizer: &Authorizer) -> Result<AuthIdentity> {
        Ok(AuthIdentity {
            entity: authorizer.entity.clone(),
            global_id: authorizer.global_id,
            caps: authorizer.caps.clone(),
            allow_all: authorizer.allow_all,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorizer(key: &str) -> Authorizer {
        Authorizer {
            protocol: AUTH_PROTOCOL_SHARED_KEY,
            entity: "client.admin".into(),
            global_id: GlobalId(77),
            key: key.into(),
            caps: Some("allow *".into()),
            allow_all: false,
        }
    }

    #[test]
    fn test_shared_key_verify() {
        let handler = SharedKeyAuthHandler::new(["sekrit".to_string()]);
        let id = handler.verify(&authorizer("sekrit")).unwrap();
        assert_eq!(id.global_id, GlobalId(77));
        assert_eq!(id.caps.as_deref(), Some("allow *"));

        let err = handler.verify(&authorizer("wrong")).unwrap_err();
        assert_eq!(err.code(), StatusCode::AUTHENTICATION_FAIL);
    }

    #[test]
    fn test_registry_lookup() {
        let reg = AuthHandlerRegistry::with_shared_key(["k".to_string()]);
        assert!(reg.get_handler(AUTH_PROTOCOL_SHARED_KEY).is_some());
        assert!(reg.get_handler(99).is_none());
    }

    #[test]
    fn test_none_handler() {
        let handler = NoneAuthHandler;
        let id = handler.verify(&authorizer("anything")).unwrap();
        assert_eq!(id.entity, "client.admin");
    }
}
