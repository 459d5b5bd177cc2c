// SPDX-License-Identifier: Apache-2.0

//! Multi-source fan-out engine
//!
//! A logical model bound to several physical sources is queried as one
//! table. Commands are rewritten per source with the source-identity
//! pseudo-column resolved to a literal, dispatched concurrently, and merged
//! back into a single result.

pub mod bindings;
pub mod capabilities;
pub mod config;
pub mod connector;
pub mod manager;
pub mod merge;
pub mod metadata;
pub mod planner;
pub mod rewriter;
pub mod types;

pub use bindings::SourceBindingRegistry;
pub use capabilities::{Capability, CapabilityLookup, CapabilityOverride, StaticCapabilities};
pub use config::FederationConfig;
pub use connector::{ConnectorExecutionLoop, InstanceOutput, LoopState, RetryPolicy};
pub use manager::FederationManager;
pub use merge::MergeSpec;
pub use metadata::{InMemoryMetadata, MetadataLookup, SourceIdentityMetadata};
pub use planner::{FederatedPlan, PlanExpander};
pub use rewriter::{CommandScope, CriteriaDesc, Expansion, InstanceCommand, QueryRewriter};
pub use types::*;
