//! Identity collaborator seam
//!
//! Authentication and identity mapping live outside this engine; the
//! engine only needs two questions answered. Production wires a real
//! identity service behind this trait, tests and single-tenant
//! deployments use [`StaticIdentity`].

use market_ledger::UserId;
use std::collections::HashSet;

/// External identity collaborator
pub trait Identity: Send + Sync {
    /// Map an external identity to an internal user id
    fn resolve_user(&self, external_id: &str) -> Option<UserId>;

    /// Whether this user may override the owning admin on any market
    fn is_super_admin(&self, user_id: &UserId) -> bool;
}

/// Static identity table: external ids map straight through, with a
/// fixed super-admin set
#[derive(Debug, Default)]
pub struct StaticIdentity {
    super_admins: HashSet<UserId>,
}

impl StaticIdentity {
    /// Create with no super-admins
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with the given super-admin set
    pub fn with_super_admins(super_admins: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            super_admins: super_admins.into_iter().collect(),
        }
    }
}

impl Identity for StaticIdentity {
    fn resolve_user(&self, external_id: &str) -> Option<UserId> {
        if external_id.is_empty() {
            return None;
        }
        Some(UserId::new(external_id))
    }

    fn is_super_admin(&self, user_id: &UserId) -> bool {
        self.super_admins.contains(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity() {
        let identity = StaticIdentity::with_super_admins([UserId::new("root")]);

        assert_eq!(identity.resolve_user("alice"), Some(UserId::new("alice")));
        assert_eq!(identity.resolve_user(""), None);

        assert!(identity.is_super_admin(&UserId::new("root")));
        assert!(!identity.is_super_admin(&UserId::new("alice")));
    }
}
