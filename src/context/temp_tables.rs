// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{ColumnInfo, Row};

#[derive(Debug, Clone)]
pub struct TempTable {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

/// Named temp tables. Used both as the request-wide store and as the
/// per-clone local store.
#[derive(Debug, Default)]
pub struct TempTableStore {
    tables: RwLock<HashMap<String, TempTable>>,
}

impl Clone for TempTableStore {
    fn clone(&self) -> Self {
        Self {
            tables: RwLock::new(self.tables.read().clone()),
        }
    }
}

impl TempTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, columns: Vec<ColumnInfo>) -> EngineResult<()> {
        let key = name.to_lowercase();
        let mut tables = self.tables.write();
        if tables.contains_key(&key) {
            return Err(EngineError::validation(format!(
                "Temp table '{name}' already exists"
            )));
        }
        tables.insert(
            key,
            TempTable {
                name: name.to_string(),
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn insert(&self, name: &str, rows: Vec<Row>) -> EngineResult<u64> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| EngineError::validation(format!("Unknown temp table '{name}'")))?;

        for row in &rows {
            if row.values.len() != table.columns.len() {
                return Err(EngineError::validation(format!(
                    "Temp table '{name}' expects {} values, got {}",
                    table.columns.len(),
                    row.values.len()
                )));
            }
        }
        let count = rows.len() as u64;
        table.rows.extend(rows);
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<TempTable> {
        self.tables.read().get(&name.to_lowercase()).cloned()
    }

    pub fn drop_table(&self, name: &str) -> bool {
        self.tables.write().remove(&name.to_lowercase()).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().values().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }
}
