//! Explicit type registry: `TypeKey` → (`ApiResource`, scope).
//!
//! Constructed once and shared by reference; entries are filled from discovery
//! or resolved on demand and dropped wholesale by [`TypeRegistry::invalidate`].

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use keel_core::TypeKey;
use kube::{core::ApiResource, discovery, Client};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{Scope, StoreError, StoreResult};

type Entries = FxHashMap<TypeKey, (ApiResource, Scope)>;

#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<Entries>,
}

impl TypeRegistry {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Entries>> {
        self.entries.read().map_err(|_| StoreError::Poisoned("type registry"))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Entries>> {
        self.entries.write().map_err(|_| StoreError::Poisoned("type registry"))
    }

    pub fn register(&self, key: TypeKey, ar: ApiResource, scope: Scope) -> StoreResult<()> {
        self.write()?.insert(key, (ar, scope));
        Ok(())
    }

    pub fn lookup(&self, key: &TypeKey) -> StoreResult<Option<(ApiResource, Scope)>> {
        Ok(self.read()?.get(key).cloned())
    }

    pub fn len(&self) -> StoreResult<usize> { Ok(self.read()?.len()) }

    pub fn is_empty(&self) -> StoreResult<bool> { Ok(self.len()? == 0) }

    /// Drops every entry. A poisoned map is cleared as well, since every
    /// entry can be rediscovered.
    pub fn invalidate(&self) {
        let mut m = match self.entries.write() {
            Ok(m) => m,
            Err(poisoned) => {
                warn!("type registry lock poisoned; clearing");
                self.entries.clear_poison();
                poisoned.into_inner()
            }
        };
        debug!(entries = m.len(), "type registry invalidated");
        m.clear();
    }

    /// Cached lookup, falling back to a pinned discovery call.
    pub async fn resolve(&self, client: &Client, key: &TypeKey) -> StoreResult<(ApiResource, Scope)> {
        if let Some(hit) = self.lookup(key)? {
            return Ok(hit);
        }
        let (ar, caps) = discovery::pinned_kind(client, &key.to_gvk()).await.map_err(|e| match StoreError::from(e) {
            StoreError::NotFound(_) => StoreError::UnknownType(key.to_string()),
            other => other,
        })?;
        let scope = match caps.scope {
            discovery::Scope::Namespaced => Scope::Namespaced,
            discovery::Scope::Cluster => Scope::Cluster,
        };
        self.register(key.clone(), ar.clone(), scope)?;
        Ok((ar, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployments() -> (TypeKey, ApiResource) {
        let key = TypeKey::new("apps", "v1", "Deployment");
        let ar = ApiResource::from_gvk_with_plural(&key.to_gvk(), "deployments");
        (key, ar)
    }

    #[test]
    fn register_lookup_invalidate() {
        let reg = TypeRegistry::new();
        let (key, ar) = deployments();
        reg.register(key.clone(), ar, Scope::Namespaced).unwrap();
        let (ar, scope) = reg.lookup(&key).unwrap().unwrap();
        assert_eq!(ar.plural, "deployments");
        assert_eq!(scope, Scope::Namespaced);
        reg.invalidate();
        assert!(reg.lookup(&key).unwrap().is_none());
        assert!(reg.is_empty().unwrap());
    }

    #[test]
    fn poisoned_registry_reports_until_invalidated() {
        let reg = TypeRegistry::new();
        let (key, ar) = deployments();
        reg.register(key.clone(), ar.clone(), Scope::Namespaced).unwrap();
        std::thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _guard = reg.entries.write().unwrap();
                    panic!("writer died");
                })
                .join();
        });

        assert!(matches!(reg.lookup(&key), Err(StoreError::Poisoned(_))));
        assert!(matches!(reg.register(key.clone(), ar.clone(), Scope::Namespaced), Err(StoreError::Poisoned(_))));

        reg.invalidate();
        assert!(reg.is_empty().unwrap());
        reg.register(key.clone(), ar, Scope::Namespaced).unwrap();
        assert!(reg.lookup(&key).unwrap().is_some());
    }
}
