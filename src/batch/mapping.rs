use crate::core::{DataType, MigrateError, Result, Row, TableSchema, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One source column copied into one target column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

/// A target column filled with a fixed value (e.g. a migration tag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantColumn {
    pub column: String,
    pub value: Value,
}

/// Typed description of how rows of `source_table` become rows of
/// `target_table`. Target columns that are neither mapped nor constant are
/// written as NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub source_table: String,
    pub target_table: String,
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub constants: Vec<ConstantColumn>,
}

impl SchemaMapping {
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            columns: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// Maps every column the two schemas share by name.
    pub fn by_name(source: &TableSchema, target: &TableSchema) -> Self {
        let mut mapping = Self::new(source.name(), target.name());
        for column in source.columns() {
            if target.find_column_index(&column.name).is_some() {
                mapping = mapping.map(&column.name, &column.name);
            }
        }
        mapping
    }

    pub fn map(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.columns.push(ColumnMapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn with_constant(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let column = column.into();
        self.constants.retain(|c| c.column != column);
        self.constants.push(ConstantColumn {
            column,
            value: value.into(),
        });
        self
    }

    /// Same column layout, different relations (e.g. legacy -> archive).
    pub fn retarget(&self, source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            columns: self.columns.clone(),
            constants: self.constants.clone(),
        }
    }

    /// Resolves column positions against concrete schemas.
    ///
    /// Rejects unknown columns, duplicate targets, non-castable types,
    /// uncovered NOT NULL target columns and a target key that does not come
    /// from the source key.
    pub fn compile(&self, source: &TableSchema, target: &TableSchema) -> Result<RowMapper> {
        let mut slots = vec![Slot::Null; target.columns().len()];
        let mut assigned = HashSet::new();

        for mapping in &self.columns {
            let source_idx = source.column_index(&mapping.source)?;
            let target_idx = target.column_index(&mapping.target)?;
            if !assigned.insert(target_idx) {
                return Err(MigrateError::Validation(format!(
                    "Target column '{}' is mapped more than once",
                    mapping.target
                )));
            }
            let source_type = &source.columns()[source_idx].data_type;
            let target_type = &target.columns()[target_idx].data_type;
            if !source_type.can_cast_to(target_type) {
                return Err(MigrateError::TypeMismatch(format!(
                    "Cannot copy {}.{} ({}) into {}.{} ({})",
                    source.name(),
                    mapping.source,
                    source_type,
                    target.name(),
                    mapping.target,
                    target_type
                )));
            }
            slots[target_idx] = Slot::Source(source_idx, target_type.clone());
        }

        for constant in &self.constants {
            let target_idx = target.column_index(&constant.column)?;
            if !assigned.insert(target_idx) {
                return Err(MigrateError::Validation(format!(
                    "Target column '{}' is both mapped and constant",
                    constant.column
                )));
            }
            target.columns()[target_idx].validate(&constant.value)?;
            slots[target_idx] = Slot::Constant(constant.value.clone());
        }

        let key_idx = target.key_index();
        match &slots[key_idx] {
            Slot::Source(idx, _) if *idx == source.key_index() => {}
            _ => {
                return Err(MigrateError::Validation(format!(
                    "Primary key '{}' of '{}' must be mapped from source key '{}'",
                    target.primary_key(),
                    target.name(),
                    source.primary_key()
                )));
            }
        }

        for (idx, column) in target.columns().iter().enumerate() {
            if !column.nullable && matches!(slots[idx], Slot::Null) {
                return Err(MigrateError::Validation(format!(
                    "NOT NULL column '{}.{}' is not covered by the mapping",
                    target.name(),
                    column.name
                )));
            }
        }

        Ok(RowMapper {
            target: target.name().to_string(),
            target_columns: target.columns().iter().map(|c| c.name.clone()).collect(),
            slots,
            source_width: source.columns().len(),
        })
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Source(usize, DataType),
    Constant(Value),
    Null,
}

/// A compiled `SchemaMapping`: converts source rows into target rows.
#[derive(Debug, Clone)]
pub struct RowMapper {
    target: String,
    target_columns: Vec<String>,
    slots: Vec<Slot>,
    source_width: usize,
}

impl RowMapper {
    pub fn map_row(&self, row: &Row) -> Result<Row> {
        self.map_row_with(row, &[])
    }

    /// Maps a row, then overwrites the given target positions.
    pub fn map_row_with(&self, row: &Row, overrides: &[(usize, Value)]) -> Result<Row> {
        if row.len() != self.source_width {
            return Err(MigrateError::Validation(format!(
                "Source row has {} values, mapping into '{}' expects {}",
                row.len(),
                self.target,
                self.source_width
            )));
        }
        let mut out = Vec::with_capacity(self.slots.len());
        for (idx, slot) in self.slots.iter().enumerate() {
            let value = match slot {
                Slot::Source(source_idx, data_type) => {
                    let value = row[*source_idx].clone();
                    data_type.cast(value.clone()).ok_or_else(|| {
                        MigrateError::TypeMismatch(format!(
                            "Value {} does not fit {}.{} ({})",
                            value, self.target, self.target_columns[idx], data_type
                        ))
                    })?
                }
                Slot::Constant(value) => value.clone(),
                Slot::Null => Value::Null,
            };
            out.push(value);
        }
        for (idx, value) in overrides {
            if let Some(slot) = out.get_mut(*idx) {
                *slot = value.clone();
            }
        }
        Ok(out)
    }

    pub fn target_index(&self, column: &str) -> Option<usize> {
        self.target_columns.iter().position(|c| c == column)
    }

    /// Target key value for a source row (the key is always a direct copy).
    pub fn target_key(&self, row: &Row, target_key_index: usize) -> Result<Value> {
        match self.slots.get(target_key_index) {
            Some(Slot::Source(idx, data_type)) => {
                let value = row.get(*idx).cloned().unwrap_or(Value::Null);
                data_type.cast(value).ok_or_else(|| {
                    MigrateError::TypeMismatch(format!("Key does not fit '{}'", self.target))
                })
            }
            _ => Err(MigrateError::Validation(format!(
                "Key of '{}' is not mapped from the source",
                self.target
            ))),
        }
    }
}
