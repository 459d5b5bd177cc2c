// SPDX-License-Identifier: Apache-2.0

//! Parent-linked variable bindings.

use std::collections::HashMap;

use crate::engine::types::Value;

/// One scope of variable bindings, optionally nested inside an enclosing one.
///
/// A nested scope shadows names of its parents without touching them.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    values: HashMap<String, Value>,
    parent: Option<Box<VariableContext>>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps `parent` in a fresh, empty scope.
    pub fn nested(parent: VariableContext) -> Self {
        Self {
            values: HashMap::new(),
            parent: Some(Box::new(parent)),
        }
    }

    /// Detaches the innermost scope, returning the enclosing one.
    pub fn into_parent(self) -> Option<VariableContext> {
        self.parent.map(|parent| *parent)
    }

    pub fn parent(&self) -> Option<&VariableContext> {
        self.parent.as_deref()
    }

    /// Binds `name` in this scope, shadowing any outer binding.
    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_lowercase(), value);
    }

    /// Updates the nearest scope that binds `name`, or binds it here.
    pub fn assign(&mut self, name: &str, value: Value) {
        let key = name.to_lowercase();
        match self.binding_mut(&key) {
            Some(slot) => *slot = value,
            None => {
                self.values.insert(key, value);
            }
        }
    }

    fn binding_mut(&mut self, key: &str) -> Option<&mut Value> {
        if self.values.contains_key(key) {
            return self.values.get_mut(key);
        }
        self.parent.as_deref_mut()?.binding_mut(key)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let key = name.to_lowercase();
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(value) = current.values.get(&key) {
                return Some(value);
            }
            scope = current.parent.as_deref();
        }
        None
    }

    /// Number of scopes in the chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map(|p| p.depth()).unwrap_or(0)
    }
}
