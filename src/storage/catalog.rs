use crate::core::{ForeignKey, MigrateError, Result, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Catalog holds only metadata: table schemas and foreign keys.
///
/// Immutable once built; every change returns a new `Catalog` (copy-on-write),
/// so a DDL unit can keep the previous value as its rollback image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    tables: Arc<HashMap<String, TableSchema>>,
    foreign_keys: Arc<Vec<ForeignKey>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(HashMap::new()),
            foreign_keys: Arc::new(Vec::new()),
        }
    }

    pub fn with_table(self, schema: TableSchema) -> Result<Self> {
        let name = schema.name().to_string();
        if self.tables.contains_key(&name) {
            return Err(MigrateError::TableExists(name));
        }

        let mut new_tables = (*self.tables).clone();
        new_tables.insert(name, schema);

        Ok(Self {
            tables: Arc::new(new_tables),
            foreign_keys: self.foreign_keys,
        })
    }

    /// Removes a table and the constraints it owns.
    ///
    /// Fails while another table still references it.
    pub fn without_table(self, name: &str) -> Result<Self> {
        if !self.tables.contains_key(name) {
            return Err(MigrateError::TableNotFound(name.to_string()));
        }
        if let Some(fk) = self
            .foreign_keys
            .iter()
            .find(|fk| fk.referenced_table == name && fk.table != name)
        {
            return Err(MigrateError::ConstraintViolation(format!(
                "Cannot drop '{}': constraint '{}' on '{}' depends on it",
                name, fk.name, fk.table
            )));
        }

        let mut new_tables = (*self.tables).clone();
        new_tables.remove(name);
        let new_fks = self
            .foreign_keys
            .iter()
            .filter(|fk| fk.table != name)
            .cloned()
            .collect();

        Ok(Self {
            tables: Arc::new(new_tables),
            foreign_keys: Arc::new(new_fks),
        })
    }

    /// Renames a table. Constraints follow the relation, not the name:
    /// both owned and referencing foreign keys are rewritten to `to`.
    pub fn renamed(self, from: &str, to: &str) -> Result<Self> {
        if self.tables.contains_key(to) {
            return Err(MigrateError::TableExists(to.to_string()));
        }
        let mut new_tables = (*self.tables).clone();
        let schema = new_tables
            .remove(from)
            .ok_or_else(|| MigrateError::TableNotFound(from.to_string()))?;
        new_tables.insert(to.to_string(), schema.renamed(to));

        let new_fks = self
            .foreign_keys
            .iter()
            .map(|fk| {
                let mut fk = fk.clone();
                if fk.table == from {
                    fk.table = to.to_string();
                }
                if fk.referenced_table == from {
                    fk.referenced_table = to.to_string();
                }
                fk
            })
            .collect();

        Ok(Self {
            tables: Arc::new(new_tables),
            foreign_keys: Arc::new(new_fks),
        })
    }

    pub fn with_foreign_key(self, fk: ForeignKey) -> Result<Self> {
        let owner = self.get_table(&fk.table)?;
        for column in &fk.columns {
            owner.column_index(column)?;
        }
        let target = self.get_table(&fk.referenced_table)?;
        for column in &fk.referenced_columns {
            target.column_index(column)?;
        }
        if self
            .foreign_keys
            .iter()
            .any(|existing| existing.table == fk.table && existing.name == fk.name)
        {
            return Err(MigrateError::ConstraintViolation(format!(
                "Constraint '{}' already exists on '{}'",
                fk.name, fk.table
            )));
        }

        let mut new_fks = (*self.foreign_keys).clone();
        new_fks.push(fk);
        Ok(Self {
            tables: self.tables,
            foreign_keys: Arc::new(new_fks),
        })
    }

    pub fn without_foreign_key(self, table: &str, name: &str) -> Result<Self> {
        let before = self.foreign_keys.len();
        let new_fks: Vec<ForeignKey> = self
            .foreign_keys
            .iter()
            .filter(|fk| !(fk.table == table && fk.name == name))
            .cloned()
            .collect();
        if new_fks.len() == before {
            return Err(MigrateError::Storage(format!(
                "Constraint '{}' not found on '{}'",
                name, table
            )));
        }
        Ok(Self {
            tables: self.tables,
            foreign_keys: Arc::new(new_fks),
        })
    }

    pub fn get_table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn list_tables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType};

    fn table(name: &str) -> TableSchema {
        TableSchema::new(
            name,
            vec![
                Column::new("id", DataType::Integer),
                Column::new("parent_id", DataType::Integer),
            ],
            "id",
        )
        .unwrap()
    }

    #[test]
    fn test_rename_carries_foreign_keys() {
        let catalog = Catalog::new()
            .with_table(table("users"))
            .unwrap()
            .with_table(table("posts"))
            .unwrap()
            .with_foreign_key(ForeignKey::new("fk_posts_user", "posts", "parent_id", "users", "id"))
            .unwrap();

        let catalog = catalog.renamed("users", "users_backup").unwrap();
        assert!(!catalog.table_exists("users"));
        assert_eq!(catalog.get_table("users_backup").unwrap().name(), "users_backup");
        assert_eq!(catalog.foreign_keys()[0].referenced_table, "users_backup");
    }

    #[test]
    fn test_drop_refuses_referenced_table() {
        let catalog = Catalog::new()
            .with_table(table("users"))
            .unwrap()
            .with_table(table("posts"))
            .unwrap()
            .with_foreign_key(ForeignKey::new("fk", "posts", "parent_id", "users", "id"))
            .unwrap();

        assert!(matches!(
            catalog.clone().without_table("users"),
            Err(MigrateError::ConstraintViolation(_))
        ));
        let catalog = catalog.without_table("posts").unwrap();
        assert!(catalog.foreign_keys().is_empty());
        assert!(catalog.without_table("users").is_ok());
    }

    #[test]
    fn test_copy_on_write_keeps_previous_image() {
        let before = Catalog::new().with_table(table("a")).unwrap();
        let after = before.clone().renamed("a", "b").unwrap();
        assert!(before.table_exists("a"));
        assert!(after.table_exists("b"));
    }
}
