// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the fan-out engine
//!
//! Connector-specific failures are mapped to these unified error types so the
//! merge stage can reason about them without knowing which source failed how.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all planning and execution operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Query syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Query execution error: {message}")]
    ExecutionError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connector not found: {source_id}")]
    ConnectorNotFound { source_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Recursive invocation of {signature}")]
    RecursiveInvocation { signature: String },

    #[error("Source '{source_id}' failed: {message}")]
    SourceFailed { source_id: String, message: String },

    #[error("Source '{source_id}' still unavailable after {retries} retries")]
    RetryExhausted { source_id: String, retries: u32 },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn syntax_error(msg: impl Into<String>) -> Self {
        Self::SyntaxError { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn connector_not_found(id: impl Into<String>) -> Self {
        Self::ConnectorNotFound { source_id: id.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError { message: msg.into() }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn recursive_invocation(signature: impl Into<String>) -> Self {
        Self::RecursiveInvocation {
            signature: signature.into(),
        }
    }

    pub fn source_failed(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceFailed {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    /// Wraps an error raised by one physical source so the caller can see
    /// which binding produced it. Already-attributed errors pass through.
    pub fn attribute_to(self, source_id: &str) -> Self {
        match self {
            err @ (Self::SourceFailed { .. }
            | Self::RetryExhausted { .. }
            | Self::Cancelled
            | Self::Timeout { .. }) => err,
            other => Self::source_failed(source_id, other.to_string()),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
