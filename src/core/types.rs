use super::{DataType, MigrateError, Result, Value};
use serde::{Deserialize, Serialize};

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if matches!(value, Value::Null) {
            if !self.nullable {
                return Err(MigrateError::ConstraintViolation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(MigrateError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// Name, columns and primary key of one relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<Column>,
    primary_key: String,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let primary_key = primary_key.into();
        if !columns.iter().any(|c| c.name == primary_key) {
            return Err(MigrateError::ColumnNotFound(primary_key, name));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(MigrateError::Validation(format!(
                    "Duplicate column '{}' in table '{}'",
                    column.name, name
                )));
            }
        }
        Ok(Self {
            name,
            columns,
            primary_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.find_column_index(name).map(|idx| &self.columns[idx])
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.find_column_index(name)
            .ok_or_else(|| MigrateError::ColumnNotFound(name.to_string(), self.name.clone()))
    }

    pub fn key_index(&self) -> usize {
        self.find_column_index(&self.primary_key).unwrap_or(0)
    }

    /// Same columns and key under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: self.columns.clone(),
            primary_key: self.primary_key.clone(),
        }
    }

    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(MigrateError::Validation(format!(
                "Table '{}' expects {} columns, got {}",
                self.name,
                self.columns.len(),
                row.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(row.iter()) {
            column.validate(value)?;
        }
        if row[self.key_index()].is_null() {
            return Err(MigrateError::ConstraintViolation(format!(
                "Primary key '{}' of '{}' cannot be NULL",
                self.primary_key, self.name
            )));
        }
        Ok(())
    }
}

/// A foreign-key constraint: `table(columns)` references
/// `referenced_table(referenced_columns)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: vec![column.into()],
            referenced_table: referenced_table.into(),
            referenced_columns: vec![referenced_column.into()],
        }
    }

    pub fn pointing_at(&self, referenced_table: impl Into<String>) -> Self {
        Self {
            referenced_table: referenced_table.into(),
            ..self.clone()
        }
    }
}

/// Row filter applied by keyset scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowPredicate {
    All,
    /// `column < value`: rows older than the cutoff.
    Before { column: String, value: Value },
    /// `column >= value`: rows at or newer than the cutoff.
    AtOrAfter { column: String, value: Value },
    /// `column = value`, e.g. a migration tag.
    Equals { column: String, value: Value },
}

impl RowPredicate {
    pub fn matches(&self, schema: &TableSchema, row: &Row) -> Result<bool> {
        match self {
            Self::All => Ok(true),
            Self::Before { column, value } => {
                let idx = schema.column_index(column)?;
                Ok(!row[idx].is_null() && row[idx] < *value)
            }
            Self::AtOrAfter { column, value } => {
                let idx = schema.column_index(column)?;
                Ok(!row[idx].is_null() && row[idx] >= *value)
            }
            Self::Equals { column, value } => {
                let idx = schema.column_index(column)?;
                Ok(row[idx] == *value)
            }
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Before { column, .. }
            | Self::AtOrAfter { column, .. }
            | Self::Equals { column, .. } => Some(column),
        }
    }
}

/// What an upsert does when the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConflictPolicy {
    /// Insert with conflict-ignore.
    #[default]
    Ignore,
    /// Update-by-key.
    Update,
}

/// Kind of a captured row-level write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level write, tagged with the site it originated on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub table: String,
    pub old: Option<Row>,
    pub new: Option<Row>,
    pub origin_site: String,
}

impl RowChange {
    pub fn insert(table: impl Into<String>, row: Row, origin_site: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.into(),
            old: None,
            new: Some(row),
            origin_site: origin_site.into(),
        }
    }

    pub fn update(
        table: impl Into<String>,
        old: Row,
        new: Row,
        origin_site: impl Into<String>,
    ) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.into(),
            old: Some(old),
            new: Some(new),
            origin_site: origin_site.into(),
        }
    }

    pub fn delete(table: impl Into<String>, row: Row, origin_site: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.into(),
            old: Some(row),
            new: None,
            origin_site: origin_site.into(),
        }
    }

    /// The row image that identifies the affected key.
    pub fn key_row(&self) -> Option<&Row> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref(),
            _ => self.new.as_ref(),
        }
    }
}
