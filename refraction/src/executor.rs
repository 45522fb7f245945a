use async_trait::async_trait;
use log::debug;
use sea_orm::sea_query::{DeleteStatement, InsertStatement, SelectStatement, UpdateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, FromQueryResult, JsonValue, Statement};
use serde::Deserialize;

use crate::Record;

/// Any statement the engine hands to a [`StatementExecutor`].
#[derive(Debug, Clone)]
pub enum SqlStatement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl SqlStatement {
    pub fn build(&self, backend: DatabaseBackend) -> Statement {
        match self {
            SqlStatement::Select(stmt) => backend.build(stmt),
            SqlStatement::Insert(stmt) => backend.build(stmt),
            SqlStatement::Update(stmt) => backend.build(stmt),
            SqlStatement::Delete(stmt) => backend.build(stmt),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            SqlStatement::Select(_) => "select",
            SqlStatement::Insert(_) => "insert",
            SqlStatement::Update(_) => "update",
            SqlStatement::Delete(_) => "delete",
        }
    }
}

/// Dialect features that change the shape of generated statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DialectCapabilities {
    /// The dialect accepts `UPDATE t ... WHERE x IN (SELECT ... t ...)`
    /// through a join table. Without it, many-to-many writes go through
    /// `rowid`.
    pub subquery_on_target_table: bool,
    /// `INSERT ... RETURNING *` is available.
    pub returning: bool,
}

impl DialectCapabilities {
    pub fn for_backend(backend: DatabaseBackend) -> Self {
        match backend {
            DatabaseBackend::Postgres => Self {
                subquery_on_target_table: true,
                returning: true,
            },
            DatabaseBackend::Sqlite => Self {
                subquery_on_target_table: false,
                returning: false,
            },
            DatabaseBackend::MySql => Self {
                subquery_on_target_table: true,
                returning: false,
            },
        }
    }
}

/// Result of a single INSERT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    /// Rows produced by `RETURNING`, keyed by column name.
    pub rows: Vec<Record>,
    /// Driver-reported identity when `RETURNING` was not used.
    pub last_insert_id: Option<u64>,
}

/// Runs statements and decodes rows into column-keyed records.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    fn backend(&self) -> DatabaseBackend;

    async fn fetch(&self, stmt: SelectStatement) -> Result<Vec<Record>, DbErr>;

    async fn insert(&self, stmt: InsertStatement, returning: bool) -> Result<InsertOutcome, DbErr>;

    /// Returns the number of affected rows.
    async fn execute(&self, stmt: SqlStatement) -> Result<u64, DbErr>;
}

#[async_trait]
impl<C> StatementExecutor for C
where
    C: ConnectionTrait + Send + Sync,
{
    fn backend(&self) -> DatabaseBackend {
        self.get_database_backend()
    }

    async fn fetch(&self, stmt: SelectStatement) -> Result<Vec<Record>, DbErr> {
        let statement = SqlStatement::Select(stmt).build(self.get_database_backend());
        debug!("select: {}", statement.sql);
        let rows = JsonValue::find_by_statement(statement).all(self).await?;
        rows.into_iter().map(into_record).collect()
    }

    async fn insert(
        &self,
        mut stmt: InsertStatement,
        returning: bool,
    ) -> Result<InsertOutcome, DbErr> {
        if returning {
            stmt.returning_all();
            let statement = SqlStatement::Insert(stmt).build(self.get_database_backend());
            debug!("insert: {}", statement.sql);
            let rows = JsonValue::find_by_statement(statement).all(self).await?;
            return Ok(InsertOutcome {
                rows: rows.into_iter().map(into_record).collect::<Result<_, _>>()?,
                last_insert_id: None,
            });
        }

        let statement = SqlStatement::Insert(stmt).build(self.get_database_backend());
        debug!("insert: {}", statement.sql);
        let result = ConnectionTrait::execute(self, statement).await?;
        Ok(InsertOutcome {
            rows: Vec::new(),
            last_insert_id: Some(result.last_insert_id()),
        })
    }

    async fn execute(&self, stmt: SqlStatement) -> Result<u64, DbErr> {
        let verb = stmt.verb();
        let statement = stmt.build(self.get_database_backend());
        debug!("{}: {}", verb, statement.sql);
        let result = ConnectionTrait::execute(self, statement).await?;
        Ok(result.rows_affected())
    }
}

fn into_record(row: JsonValue) -> Result<Record, DbErr> {
    match row {
        JsonValue::Object(record) => Ok(record),
        other => Err(DbErr::Type(format!("expected a row object, got {}", other))),
    }
}
