//! Scripted in-memory sources for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qorefed::engine::{
    ColumnInfo, ConnectorRegistry, EngineError, EngineResult, Row, SessionId, SourceConnector,
    SourceExecution, SourcePoll, SourceRequest,
};
use qorefed::federation::{
    FederationConfig, FederationManager, InMemoryMetadata, SourceBindingRegistry,
    StaticCapabilities,
};
use qorefed::ExecutionContext;

/// One scripted answer to `next()`.
#[derive(Debug, Clone)]
pub enum Step {
    Row(Row),
    Retry(u64),
    Fail(String),
    /// Never answers; only cancellation gets the loop out.
    Hang,
}

pub fn rows<const N: usize>(values: &[[&str; N]]) -> Vec<Step> {
    values.iter().map(|row| Step::Row(Row::from(*row))).collect()
}

/// What every source saw, shared across its executions.
#[derive(Debug, Default)]
pub struct SourceLog {
    pub commands: Mutex<Vec<String>>,
    pub closed: Mutex<u32>,
    pub cancelled: Mutex<u32>,
}

/// Executions open at once, across every source sharing the gauge.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnector {
    id: String,
    steps: Vec<Step>,
    update_count: u64,
    fail_on_create: Option<String>,
    in_flight: Option<Arc<InFlight>>,
    pub log: Arc<SourceLog>,
}

impl ScriptedConnector {
    pub fn new(id: &str, steps: Vec<Step>) -> Self {
        Self {
            id: id.to_string(),
            steps,
            update_count: 1,
            fail_on_create: None,
            in_flight: None,
            log: Arc::new(SourceLog::default()),
        }
    }

    pub fn tracked(mut self, in_flight: &Arc<InFlight>) -> Self {
        self.in_flight = Some(Arc::clone(in_flight));
        self
    }

    pub fn failing(id: &str, message: &str) -> Self {
        Self {
            fail_on_create: Some(message.to_string()),
            ..Self::new(id, Vec::new())
        }
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn create_execution(
        &self,
        request: SourceRequest,
    ) -> EngineResult<Box<dyn SourceExecution>> {
        if let Some(message) = &self.fail_on_create {
            return Err(EngineError::connection_failed(message.clone()));
        }
        self.log.commands.lock().push(request.sql());
        Ok(Box::new(ScriptedExecution {
            steps: self.steps.clone().into(),
            update_count: self.update_count,
            in_flight: self.in_flight.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

struct ScriptedExecution {
    steps: VecDeque<Step>,
    update_count: u64,
    in_flight: Option<Arc<InFlight>>,
    log: Arc<SourceLog>,
}

#[async_trait]
impl SourceExecution for ScriptedExecution {
    async fn execute(&mut self) -> EngineResult<()> {
        if let Some(in_flight) = &self.in_flight {
            in_flight.enter();
        }
        Ok(())
    }

    async fn next(&mut self) -> EngineResult<SourcePoll> {
        match self.steps.pop_front() {
            Some(Step::Row(row)) => Ok(SourcePoll::Row(row)),
            Some(Step::Retry(delay_ms)) => Ok(SourcePoll::Retry { delay_ms }),
            Some(Step::Fail(message)) => Err(EngineError::execution_error(message)),
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                Ok(SourcePoll::EndOfData)
            }
            None => Ok(SourcePoll::EndOfData),
        }
    }

    fn columns(&self) -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("col1", "string", true),
            ColumnInfo::new("col2", "string", true),
        ]
    }

    async fn update_counts(&mut self) -> EngineResult<Vec<u64>> {
        Ok(vec![self.update_count])
    }

    async fn close(&mut self) -> EngineResult<()> {
        if let Some(in_flight) = &self.in_flight {
            in_flight.leave();
        }
        *self.log.closed.lock() += 1;
        Ok(())
    }

    async fn cancel(&mut self) -> EngineResult<()> {
        *self.log.cancelled.lock() += 1;
        Ok(())
    }
}

/// Manager over model `multi` (table `T(col1, col2)`) bound to `connectors`
/// in the given order, plus the logs of every source.
pub fn manager(
    config: FederationConfig,
    connectors: Vec<ScriptedConnector>,
) -> (FederationManager, Vec<Arc<SourceLog>>) {
    manager_with(config, connectors, StaticCapabilities::full())
}

/// Same as [`manager`], with the given source capabilities.
pub fn manager_with(
    config: FederationConfig,
    connectors: Vec<ScriptedConnector>,
    capabilities: StaticCapabilities,
) -> (FederationManager, Vec<Arc<SourceLog>>) {
    let mut bindings = SourceBindingRegistry::new();
    bindings
        .register_multi_source("multi", connectors.iter().map(|c| c.id.clone()))
        .unwrap();

    let metadata = InMemoryMetadata::new();
    metadata.add_table("multi", "T", &[("col1", "string", true), ("col2", "string", true)]);

    let logs = connectors.iter().map(|c| Arc::clone(&c.log)).collect();
    let mut registry = ConnectorRegistry::new();
    for connector in connectors {
        registry.register(Arc::new(connector));
    }

    let manager = FederationManager::new(
        config,
        bindings,
        Arc::new(metadata),
        Arc::new(capabilities),
        registry,
    )
    .unwrap();
    (manager, logs)
}

/// The two-source data set: `a` holds y/x, `b` holds e/f.
pub fn two_sources() -> Vec<ScriptedConnector> {
    vec![
        ScriptedConnector::new("a", rows(&[["y", "z", "a"], ["x", "z", "a"]])),
        ScriptedConnector::new("b", rows(&[["e", "z", "b"], ["f", "z", "b"]])),
    ]
}

pub fn context(manager: &FederationManager) -> ExecutionContext {
    manager
        .context_builder()
        .session(SessionId::new())
        .user("tester")
        .vdb("vdb", "1")
        .build()
        .unwrap()
}

pub fn text_rows(rows: &[Row]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| {
            row.values
                .iter()
                .map(|value| match value {
                    qorefed::engine::Value::Text(s) => s.clone(),
                    other => format!("{other:?}"),
                })
                .collect()
        })
        .collect()
}

pub fn short_timeout(ms: u64) -> FederationConfig {
    FederationConfig {
        request_timeout_ms: ms,
        ..FederationConfig::default()
    }
}

pub const FIFTY_MS: Duration = Duration::from_millis(50);
