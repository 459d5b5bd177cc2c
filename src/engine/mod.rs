// Data Engine Module
// Connector abstraction and normalized types shared by every source

pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{EngineError, EngineResult};
pub use registry::ConnectorRegistry;
pub use traits::{SourceConnector, SourceExecution, SourcePoll, SourceRequest};
pub use types::*;
