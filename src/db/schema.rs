use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::formats::{RowBatch, Value};

/// SQL data type of a destination column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    BigInt,
    DoublePrecision,
    Text,
    Timestamp,
}

impl SqlType {
    /// Type a single value; nulls carry no type information
    pub fn of(value: &Value) -> Option<SqlType> {
        match value {
            Value::Null => None,
            Value::Integer(_) => Some(SqlType::BigInt),
            Value::Float(_) => Some(SqlType::DoublePrecision),
            Value::Text(_) => Some(SqlType::Text),
            Value::Timestamp(_) => Some(SqlType::Timestamp),
        }
    }

    /// Find the most specific common type that accommodates both types
    pub fn common_type(&self, other: &SqlType) -> SqlType {
        use SqlType::*;
        match (self, other) {
            (a, b) if a == b => *a,
            (BigInt, DoublePrecision) | (DoublePrecision, BigInt) => DoublePrecision,
            // Everything else only fits in text
            _ => Text,
        }
    }
}

/// SQL dialect of the destination engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    #[cfg(test)]
    Sqlite,
}

impl Dialect {
    pub fn type_name(&self, sql_type: SqlType) -> &'static str {
        match self {
            Dialect::Postgres => match sql_type {
                SqlType::BigInt => "BIGINT",
                SqlType::DoublePrecision => "DOUBLE PRECISION",
                SqlType::Text => "TEXT",
                SqlType::Timestamp => "TIMESTAMP",
            },
            #[cfg(test)]
            Dialect::Sqlite => match sql_type {
                SqlType::BigInt => "INTEGER",
                SqlType::DoublePrecision => "REAL",
                SqlType::Text => "TEXT",
                SqlType::Timestamp => "TIMESTAMP",
            },
        }
    }

    /// Maximum bind parameters accepted in one statement
    pub fn max_bind_params(&self) -> usize {
        match self {
            Dialect::Postgres => crate::config::PG_MAX_BIND_PARAMS,
            #[cfg(test)]
            Dialect::Sqlite => crate::config::SQLITE_MAX_BIND_PARAMS,
        }
    }

    /// Bind placeholder for the 1-based parameter `n`
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            #[cfg(test)]
            Dialect::Sqlite => format!("?{}", n),
        }
    }
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A destination table, optionally schema-qualified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn in_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Quoted (and qualified, when a schema is set) name for use in SQL
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A column in a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
}

/// Ordered column layout of the destination table, fixed after the first batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub columns: Vec<Column>,
}

impl ColumnSchema {
    /// Derive the layout from a normalized batch
    ///
    /// Each column takes the common type of its non-null values; a column with
    /// only nulls becomes TEXT.
    pub fn from_batch(batch: &RowBatch) -> Self {
        let columns = batch
            .columns()
            .iter()
            .enumerate()
            .map(|(col_idx, name)| {
                let sql_type = batch
                    .rows()
                    .iter()
                    .filter_map(|row| row.get(col_idx).and_then(SqlType::of))
                    .reduce(|acc, t| acc.common_type(&t))
                    .unwrap_or(SqlType::Text);
                Column {
                    name: name.clone(),
                    sql_type,
                }
            })
            .collect();

        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Fail unless `batch` presents exactly these columns in this order
    pub fn check(&self, batch: &RowBatch) -> Result<()> {
        let matches = batch.columns().len() == self.columns.len()
            && batch
                .columns()
                .iter()
                .zip(&self.columns)
                .all(|(found, expected)| *found == expected.name);

        if matches {
            Ok(())
        } else {
            Err(IngestError::SchemaMismatch {
                batch_index: batch.index,
                expected: self.names(),
                found: batch.columns().to_vec(),
            })
        }
    }

    /// Generate DDL statement for creating the table
    pub fn create_table_sql(&self, dialect: Dialect, table: &TableRef) -> String {
        let mut ddl = format!("CREATE TABLE {} (\n", table.qualified());

        let column_defs: Vec<String> = self
            .columns
            .iter()
            .map(|col| {
                format!(
                    "  {} {}",
                    quote_ident(&col.name),
                    dialect.type_name(col.sql_type)
                )
            })
            .collect();

        ddl.push_str(&column_defs.join(",\n"));
        ddl.push_str("\n)");

        ddl
    }
}

pub fn drop_table_sql(table: &TableRef) -> String {
    format!("DROP TABLE IF EXISTS {}", table.qualified())
}
