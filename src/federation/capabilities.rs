// SPDX-License-Identifier: Apache-2.0

//! Capability lookup and the multi-source override.
//!
//! The planner asks "may I push this operation to the source of model X?".
//! For multi-source models a fixed set of operations is never pushed, since
//! each of them needs the full merged row set to be correct.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bindings::SourceBindingRegistry;

/// Operations a source may or may not be able to execute itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Union,
    OrderBy,
    SelectDistinct,
    AggregatesAvg,
    AggregatesSum,
    AggregatesCount,
    AggregatesMinMax,
    RowLimit,
    RowOffset,
    BatchedUpdates,
    ProcedureCalls,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::Union,
        Capability::OrderBy,
        Capability::SelectDistinct,
        Capability::AggregatesAvg,
        Capability::AggregatesSum,
        Capability::AggregatesCount,
        Capability::AggregatesMinMax,
        Capability::RowLimit,
        Capability::RowOffset,
        Capability::BatchedUpdates,
        Capability::ProcedureCalls,
    ];
}

/// Capabilities forced off for every multi-source model.
pub const MULTI_SOURCE_UNSUPPORTED: [Capability; 4] = [
    Capability::Union,
    Capability::OrderBy,
    Capability::SelectDistinct,
    Capability::AggregatesAvg,
];

pub trait CapabilityLookup: Send + Sync {
    fn supports(&self, model: &str, capability: Capability) -> bool;
}

/// Table-driven capability lookup: a default set plus per-model overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    defaults: HashSet<Capability>,
    per_model: HashMap<String, HashSet<Capability>>,
}

impl StaticCapabilities {
    /// A lookup where every model supports every capability.
    pub fn full() -> Self {
        Self {
            defaults: Capability::ALL.into_iter().collect(),
            per_model: HashMap::new(),
        }
    }

    pub fn with_model<I>(mut self, model: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.per_model
            .insert(model.to_lowercase(), capabilities.into_iter().collect());
        self
    }
}

impl CapabilityLookup for StaticCapabilities {
    fn supports(&self, model: &str, capability: Capability) -> bool {
        self.per_model
            .get(&model.to_lowercase())
            .unwrap_or(&self.defaults)
            .contains(&capability)
    }
}

/// Decorator that hides unsafe pushdowns for multi-source models.
pub struct CapabilityOverride {
    delegate: Arc<dyn CapabilityLookup>,
    registry: Arc<SourceBindingRegistry>,
    forced_off: &'static [Capability],
}

impl CapabilityOverride {
    pub fn new(delegate: Arc<dyn CapabilityLookup>, registry: Arc<SourceBindingRegistry>) -> Self {
        Self {
            delegate,
            registry,
            forced_off: &MULTI_SOURCE_UNSUPPORTED,
        }
    }
}

impl CapabilityLookup for CapabilityOverride {
    fn supports(&self, model: &str, capability: Capability) -> bool {
        if self.registry.is_multi_source(model) && self.forced_off.contains(&capability) {
            return false;
        }
        self.delegate.supports(model, capability)
    }
}
