//! Statement helpers shared by every write path, and the plain-table
//! insert, update/patch and delete operations.

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Condition, DeleteStatement, InsertStatement, Query, UpdateStatement};
use serde_json::Value;

use crate::error::{RelationError, Result};
use crate::executor::{SqlStatement, StatementExecutor};
use crate::key::json_to_expr;
use crate::query::operation::{OperationInput, QueryContext, QueryOperation, QueryOutput};
use crate::schema::EntitySchema;
use crate::validation::ValidationMode;
use crate::Record;

pub(crate) fn insert_statement(table: &str, columns: &[(String, Value)]) -> Result<InsertStatement> {
    let mut stmt = Query::insert();
    stmt.into_table(Alias::new(table));
    if columns.is_empty() {
        stmt.or_default_values();
        return Ok(stmt);
    }
    stmt.columns(columns.iter().map(|(col, _)| Alias::new(col)));
    stmt.values(columns.iter().map(|(_, value)| json_to_expr(value)))
        .map_err(|e| RelationError::invalid_operation("insert", e.to_string()))?;
    Ok(stmt)
}

pub(crate) fn update_statement(
    table: &str,
    columns: &[(String, Value)],
    condition: Option<Condition>,
) -> UpdateStatement {
    let mut stmt = Query::update();
    stmt.table(Alias::new(table)).values(
        columns
            .iter()
            .map(|(col, value)| (Alias::new(col), json_to_expr(value))),
    );
    if let Some(condition) = condition {
        stmt.cond_where(condition);
    }
    stmt
}

pub(crate) fn delete_statement(table: &str, condition: Option<Condition>) -> DeleteStatement {
    let mut stmt = Query::delete();
    stmt.from_table(Alias::new(table));
    if let Some(condition) = condition {
        stmt.cond_where(condition);
    }
    stmt
}

/// Inserts one record and returns it merged with what the database
/// assigned (returned row, or the driver's last insert id).
pub(crate) async fn insert_record(
    ctx: &QueryContext,
    executor: &dyn StatementExecutor,
    entity: &EntitySchema,
    record: Record,
) -> Result<Record> {
    let columns = entity.to_columns(&record);
    let stmt = insert_statement(entity.table(), &columns)?;
    let returning = ctx.capabilities(executor).returning;
    let outcome = executor.insert(stmt, returning).await?;

    let mut inserted = record;
    if let Some(row) = outcome.rows.into_iter().next() {
        for (prop, value) in entity.from_row(row) {
            inserted.insert(prop, value);
        }
    } else if let (Some(id), [id_prop]) = (outcome.last_insert_id, entity.id_props()) {
        if inserted.get(id_prop).map_or(true, Value::is_null) {
            inserted.insert(id_prop.clone(), Value::from(id));
        }
    }
    Ok(inserted)
}

/// Inserts column-keyed rows into a table without an entity schema.
pub(crate) async fn insert_rows(
    executor: &dyn StatementExecutor,
    table: &str,
    rows: Vec<Record>,
) -> Result<u64> {
    let mut affected = 0;
    for row in rows {
        let columns: Vec<(String, Value)> = row.into_iter().collect();
        let stmt = insert_statement(table, &columns)?;
        affected += executor.execute(SqlStatement::Insert(stmt)).await?;
    }
    Ok(affected)
}

/// `UPDATE table SET ... WHERE condition`, skipping the statement when
/// there is nothing to set.
pub(crate) async fn update_rows(
    executor: &dyn StatementExecutor,
    table: &str,
    columns: &[(String, Value)],
    condition: Option<Condition>,
) -> Result<u64> {
    if columns.is_empty() {
        return Ok(0);
    }
    let stmt = update_statement(table, columns, condition);
    Ok(executor.execute(SqlStatement::Update(stmt)).await?)
}

pub(crate) fn records_from_value(operation: &str, value: Value) -> Result<Vec<Record>> {
    match value {
        Value::Object(record) => Ok(vec![record]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                other => Err(RelationError::invalid_operation(
                    operation,
                    format!("expected an object, got {}", other),
                )),
            })
            .collect(),
        other => Err(RelationError::invalid_operation(
            operation,
            format!("expected an object or an array of objects, got {}", other),
        )),
    }
}

pub(crate) fn unexpected_input(operation: &str, input: &OperationInput) -> RelationError {
    RelationError::invalid_operation(operation, format!("unexpected input {:?}", input))
}

#[derive(Debug, Default)]
pub struct InsertOperation {
    rows: Vec<Record>,
}

impl InsertOperation {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueryOperation for InsertOperation {
    fn name(&self) -> &str {
        "insert"
    }

    fn is_write(&self) -> bool {
        true
    }

    fn call(&mut self, ctx: &QueryContext, input: OperationInput) -> Result<bool> {
        let rows = match input {
            OperationInput::Rows(rows) => rows,
            other => return Err(unexpected_input(self.name(), &other)),
        };
        self.rows = rows
            .into_iter()
            .map(|row| ctx.validate(ctx.entity(), row, ValidationMode::Insert))
            .collect::<Result<_>>()?;
        Ok(!self.rows.is_empty())
    }

    fn vetoed_output(&self) -> QueryOutput {
        QueryOutput::Rows(Vec::new())
    }

    async fn execute(
        &mut self,
        ctx: &QueryContext,
        executor: &dyn StatementExecutor,
    ) -> Result<QueryOutput> {
        let mut inserted = Vec::with_capacity(self.rows.len());
        for row in std::mem::take(&mut self.rows) {
            inserted.push(insert_record(ctx, executor, ctx.entity(), row).await?);
        }
        Ok(QueryOutput::Rows(inserted))
    }
}

/// `update` validates a full record, `patch` only the supplied properties.
#[derive(Debug)]
pub struct UpdateOperation {
    mode: ValidationMode,
    patch: Record,
}

impl UpdateOperation {
    pub fn update() -> Self {
        Self {
            mode: ValidationMode::Insert,
            patch: Record::new(),
        }
    }

    pub fn patch() -> Self {
        Self {
            mode: ValidationMode::Patch,
            patch: Record::new(),
        }
    }
}

#[async_trait]
impl QueryOperation for UpdateOperation {
    fn name(&self) -> &str {
        match self.mode {
            ValidationMode::Insert => "update",
            ValidationMode::Patch => "patch",
        }
    }

    fn is_write(&self) -> bool {
        true
    }

    fn call(&mut self, ctx: &QueryContext, input: OperationInput) -> Result<bool> {
        let patch = match input {
            OperationInput::Patch(patch) => patch,
            other => return Err(unexpected_input(self.name(), &other)),
        };
        self.patch = ctx.validate(ctx.entity(), patch, self.mode)?;
        Ok(!ctx.entity().to_columns(&self.patch).is_empty())
    }

    async fn execute(
        &mut self,
        ctx: &QueryContext,
        executor: &dyn StatementExecutor,
    ) -> Result<QueryOutput> {
        let columns = ctx.entity().to_columns(&self.patch);
        let affected =
            update_rows(executor, ctx.entity().table(), &columns, ctx.condition()).await?;
        Ok(QueryOutput::Affected(affected))
    }
}

#[derive(Debug, Default)]
pub struct DeleteOperation;

#[async_trait]
impl QueryOperation for DeleteOperation {
    fn name(&self) -> &str {
        "delete"
    }

    fn is_write(&self) -> bool {
        true
    }

    fn call(&mut self, _ctx: &QueryContext, _input: OperationInput) -> Result<bool> {
        Ok(true)
    }

    async fn execute(
        &mut self,
        ctx: &QueryContext,
        executor: &dyn StatementExecutor,
    ) -> Result<QueryOutput> {
        let stmt = delete_statement(ctx.entity().table(), ctx.condition());
        let affected = executor.execute(SqlStatement::Delete(stmt)).await?;
        Ok(QueryOutput::Affected(affected))
    }
}
