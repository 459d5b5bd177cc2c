// SPDX-License-Identifier: Apache-2.0

//! Source connector trait definitions
//!
//! This is the narrow interface every physical source implements. The engine
//! never talks to a database directly; it asks a `SourceConnector` for a
//! `SourceExecution` bound to one rewritten command and pulls from it.

use async_trait::async_trait;
use sqlparser::ast::Statement;

use crate::engine::error::EngineResult;
use crate::engine::types::{ColumnInfo, RequestId, Row};

/// Execution context fields passed to every source call.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub request_id: RequestId,
    /// Sub-request (partition) identifier, unique per instance within a request.
    pub part_id: String,
    pub user: String,
    pub vdb_name: String,
    pub vdb_version: String,
    /// Source id of the binding this request is dispatched to.
    pub connection_id: String,
    /// Source-bound command. Every pseudo-column reference is already a literal.
    pub command: Statement,
}

impl SourceRequest {
    pub fn sql(&self) -> String {
        self.command.to_string()
    }
}

/// Outcome of one pull against a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    Row(Row),
    /// No data yet; ask again after `delay_ms`.
    Retry { delay_ms: u64 },
    EndOfData,
}

/// Factory for executions against one physical source
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Returns the source id this connector serves
    fn source_id(&self) -> &str;

    /// Creates an execution object for one source-bound command.
    ///
    /// May fail immediately with a translation or connection error.
    async fn create_execution(&self, request: SourceRequest)
        -> EngineResult<Box<dyn SourceExecution>>;
}

/// One in-flight command against one physical source
#[async_trait]
pub trait SourceExecution: Send {
    /// Begins execution of the command
    async fn execute(&mut self) -> EngineResult<()>;

    /// Returns the next row, a retry signal, or end-of-data
    async fn next(&mut self) -> EngineResult<SourcePoll>;

    /// Column descriptors of the result, known once `execute()` returned
    fn columns(&self) -> Vec<ColumnInfo> {
        Vec::new()
    }

    /// Per-statement affected-row counts for update-class commands
    async fn update_counts(&mut self) -> EngineResult<Vec<u64>>;

    /// Releases source-held resources. Must be idempotent.
    async fn close(&mut self) -> EngineResult<()>;

    /// Aborts the command. The engine calls this after abandoning any
    /// in-flight `next()`, and always follows it with `close()`.
    async fn cancel(&mut self) -> EngineResult<()>;
}
