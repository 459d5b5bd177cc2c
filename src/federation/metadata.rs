// SPDX-License-Identifier: Apache-2.0

//! Schema metadata and the source-identity wrapper.
//!
//! `SourceIdentityMetadata` makes every table of a multi-source model look as
//! if it had one more column, the source-identity pseudo-column, so the rest
//! of planning can treat it like any other column.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::bindings::SourceBindingRegistry;
use super::types::SOURCE_COLUMN_LENGTH;

/// Model name assigned to tables created at runtime.
pub const TEMP_MODEL: &str = "__temp__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
    pub length: Option<u32>,
    pub nullable: bool,
    /// 1-based position within the owning table
    pub position: usize,
    /// Fully qualified name of the owning table (`model.table`)
    pub table: String,
    /// True for the synthesized source-identity column
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub model: String,
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
    pub temporary: bool,
}

impl TableMetadata {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.model, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Table and column resolution, consumed from the surrounding planner.
pub trait MetadataLookup: Send + Sync {
    /// Resolves `table` or `model.table`.
    fn table(&self, name: &str) -> Option<TableMetadata>;

    fn columns(&self, table: &str) -> Option<Vec<ColumnMetadata>> {
        self.table(table).map(|t| t.columns)
    }

    fn column(&self, table: &str, column: &str) -> Option<ColumnMetadata> {
        self.table(table)?.column(column).cloned()
    }

    /// Parent lookup: the table a column belongs to.
    fn group_of(&self, column: &ColumnMetadata) -> Option<TableMetadata> {
        self.table(&column.table)
    }
}

/// Simple schema store keyed by model and table name.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    tables: RwLock<HashMap<String, TableMetadata>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table; columns are `(name, data_type, nullable)` in order.
    pub fn add_table(&self, model: &str, name: &str, columns: &[(&str, &str, bool)]) {
        let table = build_table(model, name, columns, false);
        self.tables.write().insert(table.full_name().to_lowercase(), table);
    }

    /// Creates a runtime temp table. It never carries the source-identity column.
    pub fn create_temp_table(&self, name: &str, columns: &[(&str, &str, bool)]) -> TableMetadata {
        let table = build_table(TEMP_MODEL, name, columns, true);
        self.tables
            .write()
            .insert(table.full_name().to_lowercase(), table.clone());
        table
    }
}

fn build_table(model: &str, name: &str, columns: &[(&str, &str, bool)], temporary: bool) -> TableMetadata {
    let full_name = format!("{model}.{name}");
    TableMetadata {
        model: model.to_string(),
        name: name.to_string(),
        columns: columns
            .iter()
            .enumerate()
            .map(|(i, (col, data_type, nullable))| ColumnMetadata {
                name: col.to_string(),
                data_type: data_type.to_string(),
                length: None,
                nullable: *nullable,
                position: i + 1,
                table: full_name.clone(),
                synthetic: false,
            })
            .collect(),
        temporary,
    }
}

impl MetadataLookup for InMemoryMetadata {
    fn table(&self, name: &str) -> Option<TableMetadata> {
        let tables = self.tables.read();
        let key = name.to_lowercase();
        if let Some(table) = tables.get(&key) {
            return Some(table.clone());
        }
        if key.contains('.') {
            return None;
        }
        // Unqualified: accept only an unambiguous match.
        let mut matches = tables.values().filter(|t| t.name.eq_ignore_ascii_case(name));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.clone())
    }
}

/// Metadata wrapper exposing the source-identity pseudo-column.
pub struct SourceIdentityMetadata {
    inner: Arc<dyn MetadataLookup>,
    registry: Arc<SourceBindingRegistry>,
    column_name: String,
}

impl SourceIdentityMetadata {
    pub fn new(
        inner: Arc<dyn MetadataLookup>,
        registry: Arc<SourceBindingRegistry>,
        column_name: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            registry,
            column_name: column_name.into(),
        }
    }

    pub fn source_column_name(&self) -> &str {
        &self.column_name
    }

    pub fn registry(&self) -> &SourceBindingRegistry {
        &self.registry
    }

    pub fn is_source_column_name(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.column_name)
    }

    /// True when the table belongs to a multi-source model (temp tables never do).
    pub fn is_multi_source_table(&self, table: &TableMetadata) -> bool {
        !table.temporary && self.registry.is_multi_source(&table.model)
    }

    fn pseudo_column(&self, table: &TableMetadata) -> ColumnMetadata {
        ColumnMetadata {
            name: self.column_name.clone(),
            data_type: "string".to_string(),
            length: Some(SOURCE_COLUMN_LENGTH),
            nullable: false,
            position: table.columns.len() + 1,
            table: table.full_name(),
            synthetic: true,
        }
    }
}

impl MetadataLookup for SourceIdentityMetadata {
    fn table(&self, name: &str) -> Option<TableMetadata> {
        let mut table = self.inner.table(name)?;
        if self.is_multi_source_table(&table) && table.column(&self.column_name).is_none() {
            let pseudo = self.pseudo_column(&table);
            table.columns.push(pseudo);
        }
        Some(table)
    }

    fn column(&self, table: &str, column: &str) -> Option<ColumnMetadata> {
        let resolved = self.table(table)?;
        resolved.column(column).cloned()
    }

    fn group_of(&self, column: &ColumnMetadata) -> Option<TableMetadata> {
        let table = self.table(&column.table)?;
        if column.synthetic && !self.is_multi_source_table(&table) {
            return None;
        }
        Some(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<InMemoryMetadata>, SourceIdentityMetadata) {
        let inner = Arc::new(InMemoryMetadata::new());
        inner.add_table("multi", "t", &[("col1", "string", true), ("col2", "string", true)]);
        inner.add_table("plain", "p", &[("id", "integer", false)]);

        let mut registry = SourceBindingRegistry::new();
        registry.register_multi_source("multi", ["a", "b"]).unwrap();
        registry.register_single_source("plain", "p1");

        let wrapped = SourceIdentityMetadata::new(inner.clone(), Arc::new(registry), "SOURCE_NAME");
        (inner, wrapped)
    }

    #[test]
    fn pseudo_column_is_appended_last() {
        let (_, metadata) = setup();
        let table = metadata.table("multi.t").unwrap();

        assert_eq!(table.columns.len(), 3);
        let pseudo = &table.columns[2];
        assert_eq!(pseudo.name, "SOURCE_NAME");
        assert_eq!(pseudo.data_type, "string");
        assert_eq!(pseudo.length, Some(255));
        assert!(!pseudo.nullable);
        assert_eq!(pseudo.position, 3);
        assert!(pseudo.synthetic);
    }

    #[test]
    fn pseudo_column_resolves_like_a_real_column() {
        let (_, metadata) = setup();
        let column = metadata.column("t", "source_name").unwrap();
        assert_eq!(column.table, "multi.t");

        let group = metadata.group_of(&column).unwrap();
        assert_eq!(group.name, "t");
    }

    #[test]
    fn plain_and_temp_tables_have_no_pseudo_column() {
        let (inner, metadata) = setup();
        assert!(metadata.column("plain.p", "SOURCE_NAME").is_none());

        inner.create_temp_table("#tmp", &[("col1", "string", true)]);
        let temp = metadata.table("#tmp").unwrap();
        assert!(temp.temporary);
        assert_eq!(temp.columns.len(), 1);
        assert!(metadata.column("#tmp", "SOURCE_NAME").is_none());
    }

    #[test]
    fn ambiguous_unqualified_names_do_not_resolve() {
        let (inner, metadata) = setup();
        inner.add_table("plain", "t", &[("x", "string", true)]);
        assert!(metadata.table("t").is_none());
        assert!(metadata.table("multi.t").is_some());
    }
}
