// SPDX-License-Identifier: Apache-2.0

//! Fan-out execution manager.
//!
//! Orchestrates the full pipeline for one command:
//! parse → plan (or reuse a cached plan) → run one connector loop per
//! instance → merge → return results with per-source metadata.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlparser::ast::Statement;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::{BufferManager, ExecutionContext, ExecutionContextBuilder, PlanCache, TempTableStore};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::ConnectorRegistry;
use crate::engine::traits::{SourceConnector, SourceRequest};
use crate::engine::types::{ColumnInfo, QueryResult, Row};
use crate::metrics;

use super::bindings::SourceBindingRegistry;
use super::capabilities::{CapabilityLookup, CapabilityOverride};
use super::config::FederationConfig;
use super::connector::{ConnectorExecutionLoop, InstanceOutput, RetryPolicy};
use super::merge::sum_update_counts;
use super::metadata::{MetadataLookup, SourceIdentityMetadata};
use super::planner::{FederatedPlan, PlanExpander};
use super::rewriter::{parse_batch, parse_command, QueryRewriter};
use super::types::{CommandKind, FailurePolicy, FederatedResult, FederationMetadata, SourceFetchResult};

/// Entry point of the engine: owns the binding registry, the planner and the
/// connectors, and runs commands against them.
pub struct FederationManager {
    config: FederationConfig,
    bindings: Arc<SourceBindingRegistry>,
    metadata: Arc<SourceIdentityMetadata>,
    expander: PlanExpander,
    connectors: Arc<ConnectorRegistry>,
    plan_cache: Arc<PlanCache<FederatedPlan>>,
    buffer_manager: Arc<BufferManager>,
    global_temp_tables: Arc<TempTableStore>,
}

impl FederationManager {
    pub fn new(
        config: FederationConfig,
        bindings: SourceBindingRegistry,
        metadata: Arc<dyn MetadataLookup>,
        capabilities: Arc<dyn CapabilityLookup>,
        connectors: ConnectorRegistry,
    ) -> EngineResult<Self> {
        config.validate()?;

        let bindings = Arc::new(bindings);
        let metadata = Arc::new(SourceIdentityMetadata::new(
            metadata,
            Arc::clone(&bindings),
            config.source_column_name.clone(),
        ));
        let capabilities: Arc<dyn CapabilityLookup> =
            Arc::new(CapabilityOverride::new(capabilities, Arc::clone(&bindings)));
        let rewriter = Arc::new(QueryRewriter::new(Arc::clone(&metadata)));
        let expander = PlanExpander::new(rewriter, capabilities, config.collation);

        info!(
            models = bindings.models().len(),
            connectors = connectors.len(),
            "Federation manager ready"
        );

        Ok(Self {
            plan_cache: Arc::new(PlanCache::new(config.plan_cache_capacity)?),
            buffer_manager: Arc::new(BufferManager::new(config.buffer_max_rows)),
            global_temp_tables: Arc::new(TempTableStore::default()),
            config,
            bindings,
            metadata,
            expander,
            connectors: Arc::new(connectors),
        })
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn bindings(&self) -> &SourceBindingRegistry {
        &self.bindings
    }

    pub fn metadata(&self) -> &SourceIdentityMetadata {
        &self.metadata
    }

    pub fn expander(&self) -> &PlanExpander {
        &self.expander
    }

    /// Context builder pre-wired with this manager's shared resources.
    pub fn context_builder(&self) -> ExecutionContextBuilder {
        ExecutionContext::builder()
            .plan_cache(Arc::clone(&self.plan_cache))
            .buffer_manager(Arc::clone(&self.buffer_manager))
            .global_temp_tables(Arc::clone(&self.global_temp_tables))
    }

    /// Plans `sql`, reusing a cached plan when the context may read one.
    pub fn prepare(&self, sql: &str, ctx: &ExecutionContext) -> EngineResult<Arc<FederatedPlan>> {
        if let Some(plan) = ctx.cached_plan(sql) {
            metrics::record_plan_cache_hit();
            ctx.set_determinism(plan.determinism);
            debug!(model = %plan.model, "Plan cache hit");
            return Ok(plan);
        }

        let statement = parse_command(sql)?;
        let plan = Arc::new(self.expander.plan(&statement)?);
        ctx.set_determinism(plan.determinism);
        ctx.cache_plan(sql, Arc::clone(&plan), plan.determinism);
        Ok(plan)
    }

    /// Parses, plans and runs one command.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id(), query_len = sql.len()))]
    pub async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> EngineResult<FederatedResult> {
        let started = Instant::now();
        let result = match self.prepare(sql, ctx) {
            Ok(plan) => self.run_plan(&plan, ctx).await,
            Err(e) => Err(e),
        };
        self.finish(result, started)
    }

    /// Runs an already parsed command. Plans built here bypass the cache.
    #[instrument(skip_all, fields(request_id = %ctx.request_id()))]
    pub async fn execute_statement(
        &self,
        statement: &Statement,
        ctx: &ExecutionContext,
    ) -> EngineResult<FederatedResult> {
        let started = Instant::now();
        let result = match self.expander.plan(statement) {
            Ok(plan) => {
                ctx.set_determinism(plan.determinism);
                self.run_plan(&plan, ctx).await
            }
            Err(e) => Err(e),
        };
        self.finish(result, started)
    }

    /// Runs a batch of update-class statements in submission order. Each
    /// statement's count is the sum over its instances; the first failure
    /// stops the batch.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id()))]
    pub async fn execute_batch(&self, sql: &str, ctx: &ExecutionContext) -> EngineResult<Vec<u64>> {
        let started = Instant::now();
        let counts = self.run_batch(sql, ctx).await;
        metrics::record_request(started.elapsed().as_secs_f64() * 1000.0, counts.is_ok());
        counts
    }

    async fn run_batch(&self, sql: &str, ctx: &ExecutionContext) -> EngineResult<Vec<u64>> {
        let statements = parse_batch(sql)?;
        let plans = self.expander.plan_batch(&statements)?;

        let mut counts = Vec::with_capacity(plans.len());
        for plan in &plans {
            ctx.set_determinism(plan.determinism);
            let federated = self.run_plan(plan, ctx).await?;
            counts.push(federated.result.affected_rows.unwrap_or(0));
        }
        Ok(counts)
    }

    fn finish(
        &self,
        result: EngineResult<FederatedResult>,
        started: Instant,
    ) -> EngineResult<FederatedResult> {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::record_request(elapsed_ms, result.is_ok());
        result.map(|mut federated| {
            federated.metadata.total_time_ms = elapsed_ms;
            federated.result.execution_time_ms = elapsed_ms;
            federated
        })
    }

    async fn run_plan(&self, plan: &FederatedPlan, ctx: &ExecutionContext) -> EngineResult<FederatedResult> {
        if ctx.is_cancelled() {
            metrics::record_cancel();
            return Err(EngineError::Cancelled);
        }
        if plan.instances.is_empty() {
            debug!(model = %plan.model, "No instance matched, empty result");
            return Ok(empty_result(plan));
        }

        let token = ctx.cancellation_token().child_token();
        let jobs = self.jobs(plan, ctx, &token)?;
        metrics::record_instances(jobs.len());

        // Instance tasks and the watchdog outlive this future; if it is
        // dropped mid-flight they all observe the cancelled token.
        let _cancel_on_drop = token.clone().drop_guard();

        let expired = Arc::new(AtomicBool::new(false));
        let timeout_ms = self.config.request_timeout_ms;
        {
            let token = token.clone();
            let expired = Arc::clone(&expired);
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                        expired.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            });
        }

        let outcomes = if self.config.max_concurrency <= 1 {
            self.run_sequential(jobs, &token).await
        } else {
            self.run_concurrent(jobs, &token).await
        };

        if expired.load(Ordering::SeqCst) {
            metrics::record_timeout();
            warn!(timeout_ms, "Request timed out");
            return Err(EngineError::Timeout { timeout_ms });
        }
        if ctx.is_cancelled() {
            metrics::record_cancel();
            return Err(EngineError::Cancelled);
        }

        self.merge(plan, ctx, outcomes?)
    }

    fn jobs(
        &self,
        plan: &FederatedPlan,
        ctx: &ExecutionContext,
        token: &CancellationToken,
    ) -> EngineResult<Vec<InstanceJob>> {
        let policy = RetryPolicy {
            max_retries: self.config.max_retries,
            max_delay: Duration::from_millis(self.config.max_retry_delay_ms),
        };

        plan.instances
            .iter()
            .enumerate()
            .map(|(index, instance)| {
                let source_id = instance.binding.source_id.clone();
                let connector = self.connectors.require(&source_id)?;
                Ok(InstanceJob {
                    index,
                    request: SourceRequest {
                        request_id: ctx.request_id(),
                        part_id: format!("{}.{}", ctx.request_id(), index),
                        user: ctx.user().to_string(),
                        vdb_name: ctx.vdb_name().to_string(),
                        vdb_version: ctx.vdb_version().to_string(),
                        connection_id: source_id.clone(),
                        command: instance.statement.clone(),
                    },
                    source_id,
                    connector,
                    token: token.clone(),
                    policy,
                    collect_update_counts: plan.kind.is_update(),
                })
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        jobs: Vec<InstanceJob>,
        token: &CancellationToken,
    ) -> EngineResult<Vec<InstanceOutcome>> {
        let source_ids = jobs.iter().map(|job| job.source_id.clone()).collect();
        let mut tracker = OutcomeTracker::new(source_ids, self.config.failure_policy);
        for job in jobs {
            if token.is_cancelled() {
                break;
            }
            let (index, result) = tokio::spawn(job.run(None))
                .await
                .map_err(|e| EngineError::internal(format!("Instance task panicked: {e}")))?;
            if tracker.record(index, result) {
                token.cancel();
                break;
            }
        }
        tracker.finish()
    }

    async fn run_concurrent(
        &self,
        jobs: Vec<InstanceJob>,
        token: &CancellationToken,
    ) -> EngineResult<Vec<InstanceOutcome>> {
        let source_ids = jobs.iter().map(|job| job.source_id.clone()).collect();
        let mut tracker = OutcomeTracker::new(source_ids, self.config.failure_policy);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = DetachedTasks(JoinSet::new());

        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            tasks.0.spawn(async move { job.run(Some(semaphore)).await });
        }

        while let Some(joined) = tasks.0.join_next().await {
            let (index, result) = joined
                .map_err(|e| EngineError::internal(format!("Instance task panicked: {e}")))?;
            if tracker.record(index, result) {
                token.cancel();
            }
        }
        tracker.finish()
    }

    fn merge(
        &self,
        plan: &FederatedPlan,
        ctx: &ExecutionContext,
        outcomes: Vec<InstanceOutcome>,
    ) -> EngineResult<FederatedResult> {
        let merge_start = Instant::now();

        let mut source_results = Vec::with_capacity(outcomes.len());
        let mut warnings = Vec::new();
        let mut outputs = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                Ok(output) => {
                    source_results.push(SourceFetchResult {
                        source_id: outcome.source_id,
                        row_count: output.rows.len() as u64,
                        update_count: sum_update_counts(output.update_counts.iter().copied()),
                        fetch_time_ms: output.fetch_time_ms,
                        retries: output.retries,
                        error: None,
                    });
                    outputs.push(output);
                }
                Err(e) => {
                    warnings.push(format!("Source '{}' skipped: {}", outcome.source_id, e));
                    source_results.push(SourceFetchResult {
                        source_id: outcome.source_id,
                        row_count: 0,
                        update_count: 0,
                        fetch_time_ms: 0.0,
                        retries: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let result = if plan.kind.is_update() {
            let affected = sum_update_counts(
                outputs
                    .iter()
                    .flat_map(|output| output.update_counts.iter().copied()),
            );
            QueryResult::with_affected_rows(affected, 0.0)
        } else {
            let columns = result_columns(plan, &outputs);
            let rows: Vec<Row> = outputs.into_iter().flat_map(|output| output.rows).collect();
            let _reservation = ctx.buffer_manager().reserve(rows.len() as u64)?;
            let rows = plan.merge.apply(rows);
            QueryResult {
                columns,
                rows,
                affected_rows: None,
                execution_time_ms: 0.0,
            }
        };

        Ok(FederatedResult {
            result,
            metadata: FederationMetadata {
                source_results,
                merge_time_ms: merge_start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: 0.0,
                warnings,
            },
        })
    }
}

/// Detaches instead of aborting on drop, so a loop that is still running
/// gets to cancel and close its source.
struct DetachedTasks(JoinSet<(usize, EngineResult<InstanceOutput>)>);

impl Drop for DetachedTasks {
    fn drop(&mut self) {
        self.0.detach_all();
    }
}

struct InstanceJob {
    index: usize,
    source_id: String,
    connector: Arc<dyn SourceConnector>,
    request: SourceRequest,
    token: CancellationToken,
    policy: RetryPolicy,
    collect_update_counts: bool,
}

impl InstanceJob {
    async fn run(self, semaphore: Option<Arc<Semaphore>>) -> (usize, EngineResult<InstanceOutput>) {
        let index = self.index;
        (index, self.execute(semaphore).await)
    }

    async fn execute(self, semaphore: Option<Arc<Semaphore>>) -> EngineResult<InstanceOutput> {
        let _permit = match semaphore {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => None,
                    permit = semaphore.acquire_owned() => Some(permit),
                };
                let permit = acquired
                    .ok_or(EngineError::Cancelled)?
                    .map_err(|_| EngineError::internal("Instance semaphore closed"))?;
                Some(permit)
            }
            None => None,
        };

        let created = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            execution = self.connector.create_execution(self.request) => Some(execution),
        };
        let execution = created
            .ok_or(EngineError::Cancelled)?
            .map_err(|e| e.attribute_to(&self.source_id))?;

        ConnectorExecutionLoop::new(self.source_id, execution, self.token, self.policy)
            .run(self.collect_update_counts)
            .await
    }
}

struct InstanceOutcome {
    source_id: String,
    result: EngineResult<InstanceOutput>,
}

/// Collects instance results in binding order and applies the failure policy.
struct OutcomeTracker {
    source_ids: Vec<String>,
    slots: Vec<Option<EngineResult<InstanceOutput>>>,
    policy: FailurePolicy,
    first_failure: Option<usize>,
}

impl OutcomeTracker {
    fn new(source_ids: Vec<String>, policy: FailurePolicy) -> Self {
        Self {
            slots: source_ids.iter().map(|_| None).collect(),
            source_ids,
            policy,
            first_failure: None,
        }
    }

    /// Stores one result. Returns true when the remaining instances must be
    /// cancelled.
    fn record(&mut self, index: usize, result: EngineResult<InstanceOutput>) -> bool {
        let mut stop = false;
        if let Err(e) = &result {
            if !matches!(e, EngineError::Cancelled) {
                metrics::record_instance_failure();
                warn!(source = %self.source_ids[index], error = %e, "Instance failed");
                if self.first_failure.is_none() {
                    self.first_failure = Some(index);
                    stop = self.policy == FailurePolicy::FailFast;
                }
            }
        }
        self.slots[index] = Some(result);
        stop
    }

    fn finish(mut self) -> EngineResult<Vec<InstanceOutcome>> {
        if let Some(index) = self.first_failure {
            let any_success = self.slots.iter().any(|slot| matches!(slot, Some(Ok(_))));
            if self.policy == FailurePolicy::FailFast || !any_success {
                if let Some(Err(e)) = self.slots[index].take() {
                    return Err(e);
                }
            }
        }

        Ok(self
            .source_ids
            .into_iter()
            .zip(self.slots)
            .filter_map(|(source_id, slot)| slot.map(|result| InstanceOutcome { source_id, result }))
            .collect())
    }
}

fn empty_result(plan: &FederatedPlan) -> FederatedResult {
    let result = if plan.kind.is_update() {
        QueryResult::with_affected_rows(0, 0.0)
    } else {
        QueryResult {
            columns: result_columns(plan, &[]),
            ..QueryResult::empty()
        }
    };
    FederatedResult {
        result,
        metadata: FederationMetadata::empty(),
    }
}

/// Output columns: plan names, typed from what the sources reported.
fn result_columns(plan: &FederatedPlan, outputs: &[InstanceOutput]) -> Vec<ColumnInfo> {
    let reported = outputs
        .iter()
        .map(|output| &output.columns)
        .find(|columns| !columns.is_empty());

    let named = !plan.columns.is_empty() && plan.columns.iter().all(|name| !name.ends_with('*'));
    if !named || plan.kind == CommandKind::Procedure {
        let mut columns = reported.cloned().unwrap_or_default();
        if let Some(visible) = plan.merge.visible_columns {
            columns.truncate(visible);
        }
        return columns;
    }

    plan.columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            reported
                .and_then(|columns| {
                    columns
                        .iter()
                        .find(|c| c.name.eq_ignore_ascii_case(name))
                        .or_else(|| plan.merge.aggregate.is_none().then(|| columns.get(i)).flatten())
                })
                .map(|c| ColumnInfo::new(name.clone(), c.data_type.clone(), c.nullable))
                .unwrap_or_else(|| ColumnInfo::new(name.clone(), "unknown", true))
        })
        .collect()
}
