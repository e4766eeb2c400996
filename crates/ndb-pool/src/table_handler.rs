//! Field-to-column bindings for one table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};
use crate::metadata::{Column, TableMetadata};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub column: String,
}

/// How application fields map onto table columns.
///
/// An empty mapping maps every column to a field of the same name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
}

impl TableMapping {
    /// Builder method: bind `field` to `column`.
    pub fn map(mut self, field: &str, column: &str) -> Self {
        self.fields.push(FieldMapping {
            field: field.to_string(),
            column: column.to_string(),
        });
        self
    }

    pub fn is_default(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Resolved mapping between fields and the columns of a table.
#[derive(Debug, Clone)]
pub struct TableHandler {
    table: Arc<TableMetadata>,
    /// Field name → index into `table.columns`.
    by_field: HashMap<String, usize>,
    /// Column index → field name.
    by_column: HashMap<usize, String>,
    default_mapping: bool,
}

impl TableHandler {
    pub fn new(table: Arc<TableMetadata>, mapping: &TableMapping) -> PoolResult<Self> {
        let pairs: Vec<(String, String)> = if mapping.is_default() {
            table
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.name.clone()))
                .collect()
        } else {
            mapping
                .fields
                .iter()
                .map(|m| (m.field.clone(), m.column.clone()))
                .collect()
        };

        let mut by_field = HashMap::new();
        let mut by_column = HashMap::new();
        let mut seen = HashSet::new();
        for (field, column) in pairs {
            let Some(index) = table.columns.iter().position(|c| c.name == column) else {
                return Err(PoolError::Mapping(format!(
                    "field {field} maps to unknown column {column} of {}",
                    table.qualified_name()
                )));
            };
            if !seen.insert(field.clone()) {
                return Err(PoolError::Mapping(format!("field {field} is mapped twice")));
            }
            if by_column.contains_key(&index) {
                return Err(PoolError::Mapping(format!("column {column} is mapped by more than one field")));
            }
            by_column.insert(index, field.clone());
            by_field.insert(field, index);
        }

        Ok(Self {
            table,
            by_field,
            by_column,
            default_mapping: mapping.is_default(),
        })
    }

    pub fn table(&self) -> &Arc<TableMetadata> {
        &self.table
    }

    pub fn is_default_mapping(&self) -> bool {
        self.default_mapping
    }

    pub fn column_for_field(&self, field: &str) -> Option<&Column> {
        self.by_field.get(field).map(|&i| &self.table.columns[i])
    }

    /// Field bound to `column`, `None` for unmapped columns.
    pub fn field_for_column(&self, column: &str) -> Option<&str> {
        let index = self.table.columns.iter().position(|c| c.name == column)?;
        self.by_column.get(&index).map(String::as_str)
    }

    /// Mapped field names in column order.
    pub fn fields(&self) -> Vec<&str> {
        let mut indexed: Vec<(usize, &str)> = self
            .by_column
            .iter()
            .map(|(&i, field)| (i, field.as_str()))
            .collect();
        indexed.sort_unstable_by_key(|&(i, _)| i);
        indexed.into_iter().map(|(_, field)| field).collect()
    }

    pub fn primary_key(&self) -> Vec<&Column> {
        self.table.columns.iter().filter(|c| c.primary_key).collect()
    }
}
