//! Schema introspection.
//!
//! Table existence checks and table metadata (column and index listings)
//! for MySQL, PostgreSQL and SQLite, issued over an acquired connection.
//! SQL queries are organized in the `queries` submodule with constants per
//! database type.

use crate::db::connection::DbConnection;
use crate::error::{DbError, DbResult};

/// Table metadata returned by [`table_info`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct TableInfo {
    pub table: String,
    pub columns: Vec<String>,
    pub indexes: Vec<String>,
}

mod queries {
    pub mod postgres {
        pub const TABLE_EXISTS: &str = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT column_name FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#;

        pub const LIST_INDEXES: &str = r#"
            SELECT indexname FROM pg_indexes
            WHERE schemaname = current_schema() AND tablename = $1
            ORDER BY indexname
            "#;
    }

    pub mod mysql {
        pub const TABLE_EXISTS: &str = r#"
            SELECT COUNT(*) FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT COLUMN_NAME FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#;

        pub const LIST_INDEXES: &str = r#"
            SELECT DISTINCT INDEX_NAME FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY INDEX_NAME
            "#;
    }

    pub mod sqlite {
        pub const TABLE_EXISTS: &str = r#"
            SELECT COUNT(*) FROM sqlite_master
            WHERE type = 'table' AND name = ?
            "#;

        pub const LIST_COLUMNS: &str = "SELECT name FROM pragma_table_info(?)";

        pub const LIST_INDEXES: &str = "SELECT name FROM pragma_index_list(?)";
    }
}

/// Check whether a table exists in the connected database.
pub async fn table_exists(conn: &mut DbConnection, table: &str) -> DbResult<bool> {
    let exists = match conn {
        DbConnection::Postgres(conn) => {
            sqlx::query_scalar::<_, bool>(queries::postgres::TABLE_EXISTS)
                .bind(table)
                .fetch_one(&mut **conn)
                .await
                .map_err(|e| DbError::schema("failed to check table existence", table, e))?
        }
        DbConnection::MySql(conn) => {
            sqlx::query_scalar::<_, i64>(queries::mysql::TABLE_EXISTS)
                .bind(table)
                .fetch_one(&mut **conn)
                .await
                .map_err(|e| DbError::schema("failed to check table existence", table, e))?
                > 0
        }
        DbConnection::Sqlite(conn) => {
            sqlx::query_scalar::<_, i64>(queries::sqlite::TABLE_EXISTS)
                .bind(table)
                .fetch_one(&mut **conn)
                .await
                .map_err(|e| DbError::schema("failed to check table existence", table, e))?
                > 0
        }
    };
    Ok(exists)
}

/// Fetch column and index listings for a table.
///
/// Fails with a schema error when the table does not exist or when either
/// catalog lookup fails.
pub async fn table_info(conn: &mut DbConnection, table: &str) -> DbResult<TableInfo> {
    if !table_exists(conn, table).await? {
        return Err(DbError::Schema {
            message: "table does not exist".to_string(),
            object: table.to_string(),
            source: None,
        });
    }

    let columns = list_strings(
        conn,
        table,
        queries::postgres::LIST_COLUMNS,
        queries::mysql::LIST_COLUMNS,
        queries::sqlite::LIST_COLUMNS,
        "failed to read columns",
    )
    .await?;
    let indexes = list_strings(
        conn,
        table,
        queries::postgres::LIST_INDEXES,
        queries::mysql::LIST_INDEXES,
        queries::sqlite::LIST_INDEXES,
        "failed to read indexes",
    )
    .await?;

    Ok(TableInfo {
        table: table.to_string(),
        columns,
        indexes,
    })
}

async fn list_strings(
    conn: &mut DbConnection,
    table: &str,
    pg_sql: &str,
    mysql_sql: &str,
    sqlite_sql: &str,
    context: &str,
) -> DbResult<Vec<String>> {
    let rows = match conn {
        DbConnection::Postgres(conn) => {
            sqlx::query_scalar::<_, String>(pg_sql)
                .bind(table)
                .fetch_all(&mut **conn)
                .await
        }
        DbConnection::MySql(conn) => {
            sqlx::query_scalar::<_, String>(mysql_sql)
                .bind(table)
                .fetch_all(&mut **conn)
                .await
        }
        DbConnection::Sqlite(conn) => {
            sqlx::query_scalar::<_, String>(sqlite_sql)
                .bind(table)
                .fetch_all(&mut **conn)
                .await
        }
    };
    rows.map_err(|e| DbError::schema(context, table, e))
}
