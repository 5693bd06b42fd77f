//! The destination connection: table bootstrap and batch appends.
use chrono::NaiveDateTime;
use derive_builder::Builder;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection as _};
use std::future::Future;
use std::ops::Range;
use std::time::{Duration, Instant};

use super::schema::{ColumnSchema, Dialect, SqlType, TableRef, drop_table_sql};
use crate::config::{CONNECT_TIMEOUT, DEFAULT_PG_PORT, QUERY_TIMEOUT};
use crate::error::{IngestError, LoadFailure, Result};
use crate::formats::{RowBatch, Value};

/// Connection parameters for a Postgres destination
#[derive(Debug, Clone, Builder)]
pub struct ConnectArgs {
    #[builder(setter(into))]
    host: String,
    #[builder(default = "DEFAULT_PG_PORT")]
    port: u16,
    #[builder(setter(into))]
    username: String,
    #[builder(setter(into, strip_option), default)]
    password: Option<String>,
    #[builder(setter(into))]
    database: String,
}

impl ConnectArgs {
    fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.database);
        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

/// Connection that can be either Postgres or SQLite
enum Connection {
    Postgres(PgConnection),
    #[cfg(test)]
    Sqlite(sqlx::SqliteConnection),
}

/// A value coerced to its column's type, ready to bind
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    BigInt(Option<i64>),
    Double(Option<f64>),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
}

/// One INSERT covering a contiguous row range of a batch
#[derive(Debug, Clone, PartialEq)]
struct InsertStatement {
    rows: Range<usize>,
    sql: String,
}

/// Exclusive connection to the destination database
pub struct Destination {
    conn: Connection,
}

impl Destination {
    /// Open a single connection to a Postgres destination
    pub async fn connect(args: &ConnectArgs) -> Result<Self> {
        tracing::info!(
            host = %args.host,
            port = args.port,
            database = %args.database,
            "connecting to destination"
        );

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, args.connect_options().connect())
            .await
            .map_err(|_| IngestError::DestinationUnavailable(sqlx::Error::PoolTimedOut))?
            .map_err(IngestError::DestinationUnavailable)?;

        Ok(Self {
            conn: Connection::Postgres(conn),
        })
    }

    /// Open (creating if needed) a SQLite database file for testing
    #[cfg(test)]
    pub async fn sqlite(path: &std::path::Path) -> Result<Self> {
        let conn = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await
            .map_err(IngestError::DestinationUnavailable)?;

        Ok(Self {
            conn: Connection::Sqlite(conn),
        })
    }

    pub fn dialect(&self) -> Dialect {
        match &self.conn {
            Connection::Postgres(_) => Dialect::Postgres,
            #[cfg(test)]
            Connection::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Drop `table` if it exists and recreate it empty with `schema`
    ///
    /// Both statements run in one transaction where the engine allows it.
    pub async fn replace_table(&mut self, table: &TableRef, schema: &ColumnSchema) -> Result<()> {
        let drop_sql = drop_table_sql(table);
        let create_sql = schema.create_table_sql(self.dialect(), table);
        tracing::debug!(%table, ddl = %create_sql, "replacing table");

        let result = match &mut self.conn {
            Connection::Postgres(conn) => replace_postgres(conn, &drop_sql, &create_sql).await,
            #[cfg(test)]
            Connection::Sqlite(conn) => replace_sqlite(conn, &drop_sql, &create_sql).await,
        };

        result.map_err(|source| IngestError::Schema {
            table: table.to_string(),
            source,
        })
    }

    /// Append every row of `batch` in order, all-or-nothing
    ///
    /// Returns the wall-clock time spent writing the batch.
    pub async fn append(
        &mut self,
        table: &TableRef,
        schema: &ColumnSchema,
        batch: &RowBatch,
    ) -> Result<Duration> {
        let start = Instant::now();
        let plan = plan_inserts(self.dialect(), table, schema, batch.len());
        tracing::debug!(
            batch_index = batch.index,
            statements = plan.len(),
            "appending batch"
        );

        let result = match &mut self.conn {
            Connection::Postgres(conn) => append_postgres(conn, &plan, schema, batch).await,
            #[cfg(test)]
            Connection::Sqlite(conn) => append_sqlite(conn, &plan, schema, batch).await,
        };

        result.map_err(|source| IngestError::Load {
            batch_index: batch.index,
            first_row: batch.first_row,
            source,
        })?;

        Ok(start.elapsed())
    }

    /// Close the connection, telling the server we are leaving
    pub async fn close(self) {
        let result = match self.conn {
            Connection::Postgres(conn) => conn.close().await,
            #[cfg(test)]
            Connection::Sqlite(conn) => conn.close().await,
        };
        if let Err(e) = result {
            tracing::warn!("Failed to close destination connection cleanly: {}", e);
        }
    }
}

async fn replace_postgres(
    conn: &mut PgConnection,
    drop_sql: &str,
    create_sql: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    sqlx::query(drop_sql).execute(&mut *tx).await?;
    sqlx::query(create_sql).execute(&mut *tx).await?;
    tx.commit().await
}

#[cfg(test)]
async fn replace_sqlite(
    conn: &mut sqlx::SqliteConnection,
    drop_sql: &str,
    create_sql: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    sqlx::query(drop_sql).execute(&mut *tx).await?;
    sqlx::query(create_sql).execute(&mut *tx).await?;
    tx.commit().await
}

/// Split `row_count` rows into INSERT statements that respect the dialect's
/// bind-parameter limit
fn plan_inserts(
    dialect: Dialect,
    table: &TableRef,
    schema: &ColumnSchema,
    row_count: usize,
) -> Vec<InsertStatement> {
    let num_columns = schema.len().max(1);
    let rows_per_statement = (dialect.max_bind_params() / num_columns).max(1);

    let column_list: Vec<String> = schema
        .columns
        .iter()
        .map(|c| super::schema::quote_ident(&c.name))
        .collect();
    let column_list = column_list.join(", ");

    let mut statements = Vec::new();
    let mut start = 0;
    while start < row_count {
        let end = (start + rows_per_statement).min(row_count);

        // INSERT INTO table (col1, col2) VALUES ($1, $2), ($3, $4), ...
        let mut param_idx = 1;
        let value_groups: Vec<String> = (start..end)
            .map(|_| {
                let placeholders: Vec<String> = (0..schema.len())
                    .map(|_| {
                        let placeholder = dialect.placeholder(param_idx);
                        param_idx += 1;
                        placeholder
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        statements.push(InsertStatement {
            rows: start..end,
            sql: format!(
                "INSERT INTO {} ({}) VALUES {}",
                table.qualified(),
                column_list,
                value_groups.join(", ")
            ),
        });
        start = end;
    }

    statements
}

/// Coerce one value to the type of its destination column
fn coerce(
    value: &Value,
    sql_type: SqlType,
    row: usize,
    column: &str,
) -> Result<SqlValue, LoadFailure> {
    let mismatch = || LoadFailure::Coercion {
        row,
        column: column.to_string(),
        expected: sql_type,
        found: value.type_name(),
    };

    Ok(match (sql_type, value) {
        (SqlType::BigInt, Value::Null) => SqlValue::BigInt(None),
        (SqlType::BigInt, Value::Integer(v)) => SqlValue::BigInt(Some(*v)),
        // Assignment cast, as Postgres does for float8 -> int8: round half to even
        (SqlType::BigInt, Value::Float(v))
            if v.is_finite() && *v >= i64::MIN as f64 && *v < i64::MAX as f64 =>
        {
            SqlValue::BigInt(Some(v.round_ties_even() as i64))
        }
        (SqlType::DoublePrecision, Value::Null) => SqlValue::Double(None),
        (SqlType::DoublePrecision, Value::Integer(v)) => SqlValue::Double(Some(*v as f64)),
        (SqlType::DoublePrecision, Value::Float(v)) => SqlValue::Double(Some(*v)),
        (SqlType::Timestamp, Value::Null) => SqlValue::Timestamp(None),
        (SqlType::Timestamp, Value::Timestamp(v)) => SqlValue::Timestamp(Some(*v)),
        (SqlType::Text, Value::Null) => SqlValue::Text(None),
        (SqlType::Text, Value::Text(v)) => SqlValue::Text(Some(v.clone())),
        (SqlType::Text, other) => SqlValue::Text(Some(other.to_string())),
        _ => return Err(mismatch()),
    })
}

/// Coerce the rows of one statement, row indexes relative to the batch
fn coerce_rows(
    schema: &ColumnSchema,
    batch: &RowBatch,
    rows: Range<usize>,
) -> Result<Vec<SqlValue>, LoadFailure> {
    let mut values = Vec::with_capacity(rows.len() * schema.len());
    for row_idx in rows {
        let row = &batch.rows()[row_idx];
        for (col_idx, column) in schema.columns.iter().enumerate() {
            let value = row.get(col_idx).unwrap_or(&Value::Null);
            values.push(coerce(value, column.sql_type, row_idx, &column.name)?);
        }
    }
    Ok(values)
}

async fn with_timeout<T>(
    fut: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, LoadFailure> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result.map_err(LoadFailure::from),
        Err(_) => Err(LoadFailure::Timeout(QUERY_TIMEOUT)),
    }
}

async fn append_postgres(
    conn: &mut PgConnection,
    plan: &[InsertStatement],
    schema: &ColumnSchema,
    batch: &RowBatch,
) -> Result<(), LoadFailure> {
    // Dropping the transaction on an early return rolls the batch back
    let mut tx = conn.begin().await?;
    for statement in plan {
        let values = coerce_rows(schema, batch, statement.rows.clone())?;
        let mut query = sqlx::query(&statement.sql);
        for value in values {
            query = match value {
                SqlValue::BigInt(v) => query.bind(v),
                SqlValue::Double(v) => query.bind(v),
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Timestamp(v) => query.bind(v),
            };
        }
        with_timeout(query.execute(&mut *tx)).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
async fn append_sqlite(
    conn: &mut sqlx::SqliteConnection,
    plan: &[InsertStatement],
    schema: &ColumnSchema,
    batch: &RowBatch,
) -> Result<(), LoadFailure> {
    let mut tx = conn.begin().await?;
    for statement in plan {
        let values = coerce_rows(schema, batch, statement.rows.clone())?;
        let mut query = sqlx::query(&statement.sql);
        for value in values {
            query = match value {
                SqlValue::BigInt(v) => query.bind(v),
                SqlValue::Double(v) => query.bind(v),
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Timestamp(v) => query.bind(v),
            };
        }
        with_timeout(query.execute(&mut *tx)).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::Column;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn schema(cols: &[(&str, SqlType)]) -> ColumnSchema {
        ColumnSchema {
            columns: cols
                .iter()
                .map(|(name, sql_type)| Column {
                    name: name.to_string(),
                    sql_type: *sql_type,
                })
                .collect(),
        }
    }

    fn batch(index: usize, columns: &[&str], rows: Vec<Vec<Value>>) -> RowBatch {
        let columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
        RowBatch::new(index, 0, columns, rows)
    }

    async fn count_rows(path: &std::path::Path, table: &str) -> i64 {
        let mut conn = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .connect()
            .await
            .unwrap();
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", table);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&mut conn).await.unwrap();
        count
    }

    #[test]
    fn test_plan_respects_bind_limit() {
        let s = schema(&[
            ("a", SqlType::BigInt),
            ("b", SqlType::Text),
            ("c", SqlType::Text),
        ]);
        let plan = plan_inserts(Dialect::Postgres, &TableRef::new("t"), &s, 50_000);

        // 65535 / 3 = 21845 rows per statement
        let ranges: Vec<Range<usize>> = plan.iter().map(|p| p.rows.clone()).collect();
        assert_eq!(ranges, vec![0..21_845, 21_845..43_690, 43_690..50_000]);
        assert!(plan[0].sql.starts_with("INSERT INTO \"t\" (\"a\", \"b\", \"c\") VALUES ($1, $2, $3), ($4, $5, $6)"));
        assert!(plan[2].sql.ends_with(&format!("(${}, ${}, ${})", 18_928, 18_929, 18_930)));
    }

    #[test]
    fn test_plan_for_empty_batch() {
        let s = schema(&[("a", SqlType::BigInt)]);
        assert!(plan_inserts(Dialect::Postgres, &TableRef::new("t"), &s, 0).is_empty());
    }

    #[test]
    fn test_coercion_rules() {
        assert_eq!(
            coerce(&Value::Integer(3), SqlType::DoublePrecision, 0, "x").unwrap(),
            SqlValue::Double(Some(3.0))
        );
        assert_eq!(
            coerce(&Value::Float(4.0), SqlType::BigInt, 0, "x").unwrap(),
            SqlValue::BigInt(Some(4))
        );
        assert_eq!(
            coerce(&Value::Integer(7), SqlType::Text, 0, "x").unwrap(),
            SqlValue::Text(Some("7".to_string()))
        );
        assert_eq!(
            coerce(&Value::Null, SqlType::Timestamp, 0, "x").unwrap(),
            SqlValue::Timestamp(None)
        );

        let err = coerce(&Value::Text("N".to_string()), SqlType::BigInt, 9, "VendorID").unwrap_err();
        match err {
            LoadFailure::Coercion {
                row,
                column,
                expected,
                found,
            } => {
                assert_eq!(row, 9);
                assert_eq!(column, "VendorID");
                assert_eq!(expected, SqlType::BigInt);
                assert_eq!(found, "text");
            }
            other => panic!("unexpected failure: {other}"),
        }
        assert_eq!(
            coerce(&Value::Float(6.12), SqlType::BigInt, 0, "x").unwrap(),
            SqlValue::BigInt(Some(6))
        );
        assert_eq!(
            coerce(&Value::Float(4.5), SqlType::BigInt, 0, "x").unwrap(),
            SqlValue::BigInt(Some(4))
        );
        assert!(coerce(&Value::Float(f64::NAN), SqlType::BigInt, 0, "x").is_err());
        assert!(coerce(&Value::Float(1e20), SqlType::BigInt, 0, "x").is_err());
    }

    #[tokio::test]
    async fn test_replace_then_append_sqlite() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("dest.db");
        let table = TableRef::new("trips");
        let s = schema(&[("id", SqlType::BigInt), ("flag", SqlType::Text)]);

        let mut dest = Destination::sqlite(&db_path).await.unwrap();
        dest.replace_table(&table, &s).await.unwrap();
        let b = batch(
            0,
            &["id", "flag"],
            vec![
                vec![Value::Integer(1), Value::Text("N".to_string())],
                vec![Value::Integer(2), Value::Null],
            ],
        );
        dest.append(&table, &s, &b).await.unwrap();
        dest.append(&table, &s, &b).await.unwrap();

        // Replacing drops the previous rows
        dest.replace_table(&table, &s).await.unwrap();
        dest.append(&table, &s, &b).await.unwrap();
        dest.close().await;

        assert_eq!(count_rows(&db_path, "trips").await, 2);
    }

    #[tokio::test]
    async fn test_failed_append_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("dest.db");
        let table = TableRef::new("trips");
        let s = schema(&[("id", SqlType::BigInt)]);

        let mut dest = Destination::sqlite(&db_path).await.unwrap();
        dest.replace_table(&table, &s).await.unwrap();

        // The bad value sits in the last row, after valid rows
        let b = batch(
            3,
            &["id"],
            vec![
                vec![Value::Integer(1)],
                vec![Value::Integer(2)],
                vec![Value::Text("oops".to_string())],
            ],
        );
        let err = dest.append(&table, &s, &b).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Load);
        assert_eq!(err.batch_index(), Some(3));
        dest.close().await;

        assert_eq!(count_rows(&db_path, "trips").await, 0);
    }

    #[tokio::test]
    async fn test_invalid_table_is_schema_error() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("dest.db");
        let s = schema(&[("id", SqlType::BigInt)]);

        let mut dest = Destination::sqlite(&db_path).await.unwrap();
        let err = dest
            .replace_table(&TableRef::in_schema("no_such_schema", "trips"), &s)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
        dest.close().await;
    }

    #[test]
    fn test_connect_args_builder_defaults() {
        let args = ConnectArgsBuilder::default()
            .host("localhost")
            .username("root")
            .database("ny_taxi")
            .build()
            .unwrap();
        assert_eq!(args.port, 5432);
        assert!(args.password.is_none());
    }
}
