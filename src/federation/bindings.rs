// SPDX-License-Identifier: Apache-2.0

//! Source binding registry.
//!
//! Maps a logical model name to the ordered set of physical sources backing it.

use std::collections::{HashMap, HashSet};

use crate::engine::error::{EngineError, EngineResult};

use super::types::SourceBinding;

#[derive(Debug, Clone)]
struct ModelEntry {
    multi_source: bool,
    bindings: Vec<SourceBinding>,
}

/// Lookup table from model name to its source bindings.
///
/// Model names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct SourceBindingRegistry {
    models: HashMap<String, ModelEntry>,
}

impl SourceBindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model backed by several sources. Ordinals follow `source_ids` order.
    pub fn register_multi_source<I, S>(&mut self, model: &str, source_ids: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source_ids: Vec<String> = source_ids.into_iter().map(Into::into).collect();
        if source_ids.is_empty() {
            return Err(EngineError::configuration(format!(
                "Multi-source model '{model}' needs at least one source"
            )));
        }

        let mut seen = HashSet::new();
        for id in &source_ids {
            if !seen.insert(id.as_str()) {
                return Err(EngineError::configuration(format!(
                    "Source '{id}' is bound twice to model '{model}'"
                )));
            }
        }

        let bindings = source_ids
            .into_iter()
            .enumerate()
            .map(|(ordinal, source_id)| SourceBinding {
                model: model.to_string(),
                ordinal,
                source_id,
            })
            .collect();

        self.models.insert(
            model.to_lowercase(),
            ModelEntry {
                multi_source: true,
                bindings,
            },
        );
        Ok(())
    }

    /// Registers an ordinary model backed by exactly one source.
    pub fn register_single_source(&mut self, model: &str, source_id: impl Into<String>) {
        self.models.insert(
            model.to_lowercase(),
            ModelEntry {
                multi_source: false,
                bindings: vec![SourceBinding {
                    model: model.to_string(),
                    ordinal: 0,
                    source_id: source_id.into(),
                }],
            },
        );
    }

    pub fn bindings(&self, model: &str) -> Option<&[SourceBinding]> {
        self.models
            .get(&model.to_lowercase())
            .map(|entry| entry.bindings.as_slice())
    }

    pub fn is_multi_source(&self, model: &str) -> bool {
        self.models
            .get(&model.to_lowercase())
            .map(|entry| entry.multi_source)
            .unwrap_or(false)
    }

    /// Finds the binding whose pseudo-column literal equals `literal`.
    pub fn binding_for(&self, model: &str, literal: &str) -> Option<&SourceBinding> {
        self.bindings(model)?
            .iter()
            .find(|binding| binding.literal() == literal)
    }

    /// Registered model names, sorted
    pub fn models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .models
            .values()
            .filter_map(|entry| entry.bindings.first().map(|b| b.model.as_str()))
            .collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_registration_order() {
        let mut registry = SourceBindingRegistry::new();
        registry.register_multi_source("MultiModel", ["a", "b", "c"]).unwrap();

        let bindings = registry.bindings("multimodel").unwrap();
        let ids: Vec<(usize, &str)> = bindings
            .iter()
            .map(|b| (b.ordinal, b.source_id.as_str()))
            .collect();
        assert_eq!(ids, vec![(0, "a"), (1, "b"), (2, "c")]);
        assert!(registry.is_multi_source("MULTIMODEL"));
    }

    #[test]
    fn single_source_models_are_not_multi_source() {
        let mut registry = SourceBindingRegistry::new();
        registry.register_single_source("pg", "pg-main");

        assert!(!registry.is_multi_source("pg"));
        assert_eq!(registry.bindings("pg").unwrap().len(), 1);
        assert!(!registry.is_multi_source("unknown"));
    }

    #[test]
    fn binding_lookup_by_literal() {
        let mut registry = SourceBindingRegistry::new();
        registry.register_multi_source("m", ["a", "b"]).unwrap();

        assert_eq!(registry.binding_for("m", "b").unwrap().ordinal, 1);
        assert!(registry.binding_for("m", "z").is_none());
    }

    #[test]
    fn rejects_empty_and_duplicate_sources() {
        let mut registry = SourceBindingRegistry::new();
        assert!(registry
            .register_multi_source("m", Vec::<String>::new())
            .is_err());
        assert!(registry.register_multi_source("m", ["a", "a"]).is_err());
    }
}
