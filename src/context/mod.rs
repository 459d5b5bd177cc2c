// SPDX-License-Identifier: Apache-2.0

//! Per-request execution context.
//!
//! Split in two regions:
//! - `SharedContext`: created once per top-level request and referenced by
//!   every nested clone (identity, caches, buffers, determinism, random source,
//!   cancellation).
//! - `LocalContext`: copied on every clone so nested evaluation can never
//!   corrupt the caller's bindings or recursion stack.

mod buffer;
mod determinism;
mod plan_cache;
mod temp_tables;
mod variables;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{RequestId, SessionId};
use crate::federation::planner::FederatedPlan;

pub use buffer::{BufferManager, BufferReservation};
pub use determinism::{Determinism, DeterminismTracker};
pub use plan_cache::{CacheScope, PlanCache, PlanCacheKey};
pub use temp_tables::{TempTable, TempTableStore};
pub use variables::VariableContext;

const DEFAULT_PLAN_CACHE_CAPACITY: usize = 256;
const DEFAULT_BUFFER_MAX_ROWS: u64 = 5_000_000;

/// State shared by every clone of one request's context.
pub struct SharedContext {
    processor_id: String,
    request_id: RequestId,
    session_id: SessionId,
    user: String,
    vdb_name: String,
    vdb_version: String,
    environment: HashMap<String, String>,
    plan_cache: Arc<PlanCache<FederatedPlan>>,
    global_temp_tables: Arc<TempTableStore>,
    buffer_manager: Arc<BufferManager>,
    determinism: DeterminismTracker,
    random: Mutex<Option<StdRng>>,
    cancellation: CancellationToken,
}

/// State owned by one clone.
#[derive(Debug, Clone, Default)]
pub struct LocalContext {
    variables: VariableContext,
    temp_tables: TempTableStore,
    recursion_stack: Vec<String>,
    non_blocking: bool,
}

#[derive(Clone)]
pub struct ExecutionContext {
    shared: Arc<SharedContext>,
    local: LocalContext,
}

impl ExecutionContext {
    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::default()
    }

    /// A context for nested evaluation: same shared region, independent copy
    /// of the local region.
    pub fn clone_for_nested(&self) -> Self {
        self.clone()
    }

    /// True when both contexts belong to the same top-level request.
    pub fn shares_region_with(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // --- Identity ---

    pub fn processor_id(&self) -> &str {
        &self.shared.processor_id
    }

    pub fn request_id(&self) -> RequestId {
        self.shared.request_id
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    pub fn user(&self) -> &str {
        &self.shared.user
    }

    pub fn vdb_name(&self) -> &str {
        &self.shared.vdb_name
    }

    pub fn vdb_version(&self) -> &str {
        &self.shared.vdb_version
    }

    pub fn environment_property(&self, key: &str) -> Option<&str> {
        self.shared.environment.get(key).map(String::as_str)
    }

    // --- Shared resources ---

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.shared.buffer_manager
    }

    pub fn global_temp_tables(&self) -> &TempTableStore {
        &self.shared.global_temp_tables
    }

    pub fn plan_cache(&self) -> &PlanCache<FederatedPlan> {
        &self.shared.plan_cache
    }

    // --- Local region ---

    pub fn variables(&self) -> &VariableContext {
        &self.local.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableContext {
        &mut self.local.variables
    }

    /// Opens a nested variable scope.
    pub fn push_scope(&mut self) {
        let enclosing = std::mem::take(&mut self.local.variables);
        self.local.variables = VariableContext::nested(enclosing);
    }

    /// Closes the innermost variable scope. The outermost scope is never removed.
    pub fn pop_scope(&mut self) {
        let current = std::mem::take(&mut self.local.variables);
        self.local.variables = if current.parent().is_some() {
            current.into_parent().unwrap_or_default()
        } else {
            current
        };
    }

    pub fn local_temp_tables(&self) -> &TempTableStore {
        &self.local.temp_tables
    }

    pub fn is_non_blocking(&self) -> bool {
        self.local.non_blocking
    }

    pub fn set_non_blocking(&mut self, non_blocking: bool) {
        self.local.non_blocking = non_blocking;
    }

    // --- Recursion guard ---

    /// Records an in-flight call. Fails if the same signature is already active.
    pub fn push_call(&mut self, signature: &str) -> EngineResult<()> {
        if self
            .local
            .recursion_stack
            .iter()
            .any(|active| active.eq_ignore_ascii_case(signature))
        {
            return Err(EngineError::recursive_invocation(signature));
        }
        self.local.recursion_stack.push(signature.to_string());
        Ok(())
    }

    pub fn pop_call(&mut self) -> Option<String> {
        self.local.recursion_stack.pop()
    }

    pub fn call_depth(&self) -> usize {
        self.local.recursion_stack.len()
    }

    // --- Determinism and plan caching ---

    pub fn determinism(&self) -> Determinism {
        self.shared.determinism.get()
    }

    /// Raises the determinism level if `level` is stricter; otherwise a no-op.
    pub fn set_determinism(&self, level: Determinism) -> Determinism {
        self.shared.determinism.raise(level)
    }

    fn cache_key(&self, sql: &str, scope: CacheScope) -> PlanCacheKey {
        PlanCacheKey {
            sql: sql.trim().to_string(),
            vdb_name: self.shared.vdb_name.clone(),
            vdb_version: self.shared.vdb_version.clone(),
            scope,
        }
    }

    /// Looks `sql` up in every scope this context may read, narrowest first.
    pub fn cached_plan(&self, sql: &str) -> Option<Arc<FederatedPlan>> {
        let scopes = [
            CacheScope::Session(self.shared.session_id),
            CacheScope::User(self.shared.user.clone()),
            CacheScope::Global,
        ];
        scopes
            .into_iter()
            .find_map(|scope| self.shared.plan_cache.get(&self.cache_key(sql, scope)))
    }

    /// Caches `plan` under the scope its determinism requires.
    /// Returns false when the plan may not be cached.
    pub fn cache_plan(&self, sql: &str, plan: Arc<FederatedPlan>, determinism: Determinism) -> bool {
        let Some(scope) =
            CacheScope::for_determinism(determinism, &self.shared.user, self.shared.session_id)
        else {
            debug!(?determinism, "Plan not cacheable");
            return false;
        };
        self.shared.plan_cache.put(self.cache_key(sql, scope), plan);
        true
    }

    // --- Random source ---

    /// Next value in [0, 1) from the request-wide random source.
    pub fn next_random(&self) -> f64 {
        let mut random = self.shared.random.lock();
        random.get_or_insert_with(StdRng::from_entropy).gen()
    }

    /// Replaces the random source with one seeded by `seed`.
    pub fn reseed_random(&self, seed: u64) {
        *self.shared.random.lock() = Some(StdRng::seed_from_u64(seed));
    }

    // --- Cancellation ---

    pub fn cancel(&self) {
        self.shared.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancellation
    }
}

#[derive(Default)]
pub struct ExecutionContextBuilder {
    processor_id: Option<String>,
    request_id: Option<RequestId>,
    session_id: Option<SessionId>,
    user: Option<String>,
    vdb_name: Option<String>,
    vdb_version: Option<String>,
    environment: HashMap<String, String>,
    plan_cache: Option<Arc<PlanCache<FederatedPlan>>>,
    global_temp_tables: Option<Arc<TempTableStore>>,
    buffer_manager: Option<Arc<BufferManager>>,
    cancellation: Option<CancellationToken>,
    non_blocking: bool,
}

impl ExecutionContextBuilder {
    pub fn processor_id(mut self, processor_id: impl Into<String>) -> Self {
        self.processor_id = Some(processor_id.into());
        self
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn vdb(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.vdb_name = Some(name.into());
        self.vdb_version = Some(version.into());
        self
    }

    pub fn environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn plan_cache(mut self, cache: Arc<PlanCache<FederatedPlan>>) -> Self {
        self.plan_cache = Some(cache);
        self
    }

    pub fn global_temp_tables(mut self, store: Arc<TempTableStore>) -> Self {
        self.global_temp_tables = Some(store);
        self
    }

    pub fn buffer_manager(mut self, manager: Arc<BufferManager>) -> Self {
        self.buffer_manager = Some(manager);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn non_blocking(mut self, non_blocking: bool) -> Self {
        self.non_blocking = non_blocking;
        self
    }

    /// Builds the context. Session, user and VDB identity are required.
    pub fn build(self) -> EngineResult<ExecutionContext> {
        let session_id = self.session_id.ok_or_else(|| {
            EngineError::validation("ExecutionContext requires a session id")
        })?;
        let user = self
            .user
            .ok_or_else(|| EngineError::validation("ExecutionContext requires a user"))?;
        let vdb_name = self
            .vdb_name
            .ok_or_else(|| EngineError::validation("ExecutionContext requires a VDB name"))?;

        let plan_cache = match self.plan_cache {
            Some(cache) => cache,
            None => Arc::new(PlanCache::new(DEFAULT_PLAN_CACHE_CAPACITY)?),
        };

        let shared = SharedContext {
            processor_id: self.processor_id.unwrap_or_else(|| "qorefed".to_string()),
            request_id: self.request_id.unwrap_or_default(),
            session_id,
            user,
            vdb_name,
            vdb_version: self.vdb_version.unwrap_or_else(|| "1".to_string()),
            environment: self.environment,
            plan_cache,
            global_temp_tables: self.global_temp_tables.unwrap_or_default(),
            buffer_manager: self
                .buffer_manager
                .unwrap_or_else(|| Arc::new(BufferManager::new(DEFAULT_BUFFER_MAX_ROWS))),
            determinism: DeterminismTracker::default(),
            random: Mutex::new(None),
            cancellation: self.cancellation.unwrap_or_default(),
        };

        Ok(ExecutionContext {
            shared: Arc::new(shared),
            local: LocalContext {
                non_blocking: self.non_blocking,
                ..LocalContext::default()
            },
        })
    }
}
