// SPDX-License-Identifier: Apache-2.0

//! LRU cache of prepared plans, scoped by determinism.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::SessionId;

use super::determinism::Determinism;

/// Who may reuse a cached plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Global,
    User(String),
    Session(SessionId),
}

impl CacheScope {
    /// The narrowest scope a plan of `determinism` must be confined to.
    /// `None` when it must not be cached at all.
    pub fn for_determinism(
        determinism: Determinism,
        user: &str,
        session: SessionId,
    ) -> Option<Self> {
        match determinism {
            Determinism::Deterministic => Some(Self::Global),
            Determinism::UserDeterministic => Some(Self::User(user.to_string())),
            Determinism::SessionDeterministic => Some(Self::Session(session)),
            Determinism::CommandDeterministic | Determinism::Nondeterministic => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub sql: String,
    pub vdb_name: String,
    pub vdb_version: String,
    pub scope: CacheScope,
}

pub struct PlanCache<P> {
    entries: Mutex<LruCache<PlanCacheKey, Arc<P>>>,
}

impl<P> PlanCache<P> {
    pub fn new(capacity: usize) -> EngineResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            EngineError::configuration("plan cache capacity must be greater than zero")
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn get(&self, key: &PlanCacheKey) -> Option<Arc<P>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: PlanCacheKey, plan: Arc<P>) {
        self.entries.lock().put(key, plan);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sql: &str, scope: CacheScope) -> PlanCacheKey {
        PlanCacheKey {
            sql: sql.to_string(),
            vdb_name: "vdb".to_string(),
            vdb_version: "1".to_string(),
            scope,
        }
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = PlanCache::new(2).unwrap();
        cache.put(key("a", CacheScope::Global), Arc::new(1));
        cache.put(key("b", CacheScope::Global), Arc::new(2));
        assert!(cache.get(&key("a", CacheScope::Global)).is_some());
        cache.put(key("c", CacheScope::Global), Arc::new(3));

        assert!(cache.get(&key("b", CacheScope::Global)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn scopes_do_not_collide() {
        let cache = PlanCache::new(4).unwrap();
        cache.put(key("q", CacheScope::User("alice".into())), Arc::new("plan"));
        assert!(cache.get(&key("q", CacheScope::User("bob".into()))).is_none());
        assert!(cache.get(&key("q", CacheScope::Global)).is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(PlanCache::<u8>::new(0).is_err());
    }

    #[test]
    fn scope_follows_determinism() {
        let session = SessionId::new();
        assert_eq!(
            CacheScope::for_determinism(Determinism::Deterministic, "u", session),
            Some(CacheScope::Global)
        );
        assert_eq!(
            CacheScope::for_determinism(Determinism::SessionDeterministic, "u", session),
            Some(CacheScope::Session(session))
        );
        assert!(CacheScope::for_determinism(Determinism::CommandDeterministic, "u", session).is_none());
    }
}
