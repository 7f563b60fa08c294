//! Tenant scoping for messages and workers.

use serde::{Deserialize, Serialize};

use listingsync_core::TenantId;

/// Marks messages that belong to one tenant, so tenant-pinned consumers can
/// drop the rest.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

/// Which tenants a worker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "tenant_id")]
pub enum TenantScope {
    /// Jobs of every tenant.
    #[default]
    Any,
    /// Jobs of exactly one tenant.
    Tenant(TenantId),
}

impl TenantScope {
    pub fn includes(&self, tenant: TenantId) -> bool {
        match self {
            TenantScope::Any => true,
            TenantScope::Tenant(t) => *t == tenant,
        }
    }

    pub fn accepts<M: TenantScoped>(&self, message: &M) -> bool {
        self.includes(message.tenant_id())
    }

    pub fn tenant(&self) -> Option<TenantId> {
        match self {
            TenantScope::Any => None,
            TenantScope::Tenant(t) => Some(*t),
        }
    }
}

impl core::fmt::Display for TenantScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TenantScope::Any => f.write_str("any"),
            TenantScope::Tenant(t) => core::fmt::Display::fmt(t, f),
        }
    }
}
