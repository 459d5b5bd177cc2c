// qorefed - multi-source query fan-out engine
// Core library

pub mod context;
pub mod engine;
pub mod federation;
pub mod metrics;
pub mod observability;

pub use context::{Determinism, ExecutionContext, ExecutionContextBuilder};
pub use engine::{EngineError, EngineResult};
pub use federation::{FederationConfig, FederationManager};
