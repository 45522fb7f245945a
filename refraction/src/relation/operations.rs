//! Find, insert, relate, unrelate, update/patch and delete through a
//! relation. Each operation matches on [`RelationKind`] where the SQL shape
//! differs between kinds.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Condition, Expr, JoinType, Query, SelectStatement, SimpleExpr};
use serde_json::Value;

use super::{Relation, RelationKind};
use crate::error::{RelationError, Result};
use crate::executor::{DialectCapabilities, SqlStatement, StatementExecutor};
use crate::key::{
    column, normalize_ids, unique_keys, where_composite, where_in_composite, CompositeKey,
};
use crate::query::operation::{OperationInput, QueryContext, QueryOperation, QueryOutput};
use crate::query::write::{
    delete_statement, insert_record, insert_rows, unexpected_input, update_rows,
};
use crate::validation::ValidationMode;
use crate::Record;

const ROWID: &str = "rowid";

impl Relation {
    pub fn find(self: &Arc<Self>, owners: Vec<Record>) -> FindOperation {
        FindOperation::new(self.clone(), owners)
    }

    pub fn insert(self: &Arc<Self>, owner: Record) -> RelatedInsertOperation {
        RelatedInsertOperation {
            relation: self.clone(),
            owner,
            rows: Vec::new(),
        }
    }

    pub fn relate(self: &Arc<Self>, owner: Record) -> RelateOperation {
        RelateOperation {
            relation: self.clone(),
            owner,
            ids: Vec::new(),
            input: Value::Null,
        }
    }

    pub fn unrelate(self: &Arc<Self>, owner: Record) -> UnrelateOperation {
        UnrelateOperation {
            relation: self.clone(),
            owner,
        }
    }

    pub fn update(self: &Arc<Self>, owner: Record) -> RelatedUpdateOperation {
        RelatedUpdateOperation {
            relation: self.clone(),
            owner,
            mode: ValidationMode::Insert,
            patch: Record::new(),
        }
    }

    pub fn patch(self: &Arc<Self>, owner: Record) -> RelatedUpdateOperation {
        RelatedUpdateOperation {
            relation: self.clone(),
            owner,
            mode: ValidationMode::Patch,
            patch: Record::new(),
        }
    }

    pub fn delete(self: &Arc<Self>, owner: Record) -> RelatedDeleteOperation {
        RelatedDeleteOperation {
            relation: self.clone(),
            owner,
        }
    }

    /// Selects the related rows of `owner`, for update and delete.
    fn related_rows_condition(&self, owner: &Record, caps: DialectCapabilities) -> Condition {
        let owner_key = self.owner_key(owner);
        match &self.kind {
            RelationKind::BelongsToOne | RelationKind::HasMany => {
                where_composite(self.related_table(), self.related_columns(), &owner_key)
            }
            RelationKind::ManyToMany(join_table) => {
                if caps.subquery_on_target_table {
                    let mut sub = Query::select();
                    for col in join_table.related_columns() {
                        sub.column((Alias::new(join_table.table()), Alias::new(col)));
                    }
                    sub.from(Alias::new(join_table.table())).cond_where(where_composite(
                        join_table.table(),
                        join_table.owner_columns(),
                        &owner_key,
                    ));
                    Condition::all().add(tuple_in_subquery(
                        self.related_table(),
                        self.related_columns(),
                        sub,
                    ))
                } else {
                    let target = format!("{}_{}", self.related_table(), ROWID);
                    let mut sub = Query::select();
                    sub.column((Alias::new(&target), Alias::new(ROWID)))
                        .from(Alias::new(join_table.table()))
                        .join_as(
                            JoinType::InnerJoin,
                            Alias::new(self.related_table()),
                            Alias::new(&target),
                            join_on(
                                join_table.table(),
                                join_table.related_columns(),
                                &target,
                                self.related_columns(),
                            ),
                        )
                        .cond_where(where_composite(
                            join_table.table(),
                            join_table.owner_columns(),
                            &owner_key,
                        ));
                    Condition::all().add(column(self.related_table(), ROWID).in_subquery(sub))
                }
            }
        }
    }
}

fn join_on(left: &str, left_columns: &[String], right: &str, right_columns: &[String]) -> Condition {
    left_columns
        .iter()
        .zip(right_columns)
        .fold(Condition::all(), |cond, (l, r)| {
            cond.add(
                column(left, l).equals((Alias::new(right), Alias::new(r))),
            )
        })
}

fn tuple_in_subquery(table: &str, columns: &[String], sub: SelectStatement) -> SimpleExpr {
    if let [single] = columns {
        return column(table, single).in_subquery(sub);
    }
    Expr::tuple(columns.iter().map(|col| column(table, col).into())).in_subquery(sub)
}

fn and_query_condition(ctx: &QueryContext, condition: Condition) -> Condition {
    match ctx.condition() {
        Some(extra) => Condition::all().add(condition).add(extra),
        None => condition,
    }
}

/// Fetches the related rows of a set of owners in one statement.
pub struct FindOperation {
    relation: Arc<Relation>,
    owners: Vec<Record>,
    keys: Vec<CompositeKey>,
    keep_owner_keys: bool,
}

impl FindOperation {
    pub fn new(relation: Arc<Relation>, owners: Vec<Record>) -> Self {
        Self {
            relation,
            owners,
            keys: Vec::new(),
            keep_owner_keys: false,
        }
    }

    /// Leaves the join-table owner columns on many-to-many rows so the
    /// caller can attach them to owners.
    pub(crate) fn keeping_owner_keys(mut self) -> Self {
        self.keep_owner_keys = true;
        self
    }

    pub fn owner_keys(&self) -> &[CompositeKey] {
        &self.keys
    }
}

#[async_trait]
impl QueryOperation for FindOperation {
    fn name(&self) -> &str {
        "find"
    }

    fn call(&mut self, _ctx: &QueryContext, _input: OperationInput) -> Result<bool> {
        let relation = &self.relation;
        self.keys = unique_keys(
            self.owners
                .iter()
                .map(|owner| relation.owner_key(owner))
                .filter(|key| !key.has_null()),
        );
        Ok(true)
    }

    fn on_before(&self, _ctx: &QueryContext) -> Option<QueryOutput> {
        if self.keys.is_empty() {
            Some(QueryOutput::Rows(Vec::new()))
        } else {
            None
        }
    }

    fn on_build(&self, _ctx: &QueryContext, select: &mut SelectStatement) -> Result<()> {
        let relation = &self.relation;
        match relation.kind() {
            RelationKind::BelongsToOne | RelationKind::HasMany => {
                select.cond_where(where_in_composite(
                    relation.related_table(),
                    relation.related_columns(),
                    &self.keys,
                ));
            }
            RelationKind::ManyToMany(join_table) => {
                let alias = relation.join_table_alias().unwrap_or(join_table.table());
                select.join_as(
                    JoinType::InnerJoin,
                    Alias::new(join_table.table()),
                    Alias::new(alias),
                    join_on(
                        alias,
                        join_table.related_columns(),
                        relation.related_table(),
                        relation.related_columns(),
                    ),
                );
                select.cond_where(where_in_composite(
                    alias,
                    join_table.owner_columns(),
                    &self.keys,
                ));
                for (col, key_alias) in join_table
                    .owner_columns()
                    .iter()
                    .zip(relation.owner_key_aliases())
                {
                    select.expr_as(column(alias, col), Alias::new(key_alias));
                }
                for extra in join_table.extra_columns() {
                    select.expr_as(column(alias, extra), Alias::new(extra));
                }
            }
        }
        if let Some(modifier) = relation.modifier() {
            modifier(select);
        }
        Ok(())
    }

    async fn on_after(
        &mut self,
        _ctx: &QueryContext,
        _executor: &dyn StatementExecutor,
        output: QueryOutput,
    ) -> Result<QueryOutput> {
        if self.keep_owner_keys {
            return Ok(output);
        }
        match output {
            QueryOutput::Rows(rows) => {
                let aliases = self.relation.owner_key_aliases();
                Ok(QueryOutput::Rows(
                    rows.into_iter()
                        .map(|mut row| {
                            for alias in aliases {
                                row.remove(alias);
                            }
                            row
                        })
                        .collect(),
                ))
            }
            other => Ok(other),
        }
    }
}

/// Inserts new related rows and connects them to the owner.
pub struct RelatedInsertOperation {
    relation: Arc<Relation>,
    owner: Record,
    rows: Vec<Record>,
}

#[async_trait]
impl QueryOperation for RelatedInsertOperation {
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
        if rows.is_empty() {
            return Ok(false);
        }
        if self.relation.is_one_to_one() && rows.len() > 1 {
            return Err(RelationError::cardinality(
                self.relation.name(),
                "can only insert one model to a BelongsToOneRelation",
            ));
        }

        let owner_key = self.relation.owner_key(&self.owner);
        let mut validated = Vec::with_capacity(rows.len());
        for mut row in rows {
            if let RelationKind::HasMany = self.relation.kind() {
                owner_key.assign(&mut row, self.relation.related_props());
            }
            validated.push(ctx.validate(ctx.entity(), row, ValidationMode::Insert)?);
        }
        self.rows = validated;
        Ok(true)
    }

    fn vetoed_output(&self) -> QueryOutput {
        QueryOutput::Rows(Vec::new())
    }

    async fn execute(
        &mut self,
        ctx: &QueryContext,
        executor: &dyn StatementExecutor,
    ) -> Result<QueryOutput> {
        let relation = self.relation.clone();
        let rows = std::mem::take(&mut self.rows);
        let mut inserted = Vec::with_capacity(rows.len());

        match relation.kind() {
            RelationKind::BelongsToOne => {
                for row in rows {
                    let row = insert_record(ctx, executor, ctx.entity(), row).await?;
                    let key = relation.related_key(&row);
                    let patch: Vec<(String, Value)> = relation
                        .owner_columns()
                        .iter()
                        .cloned()
                        .zip(key.values().iter().cloned())
                        .collect();
                    update_rows(
                        executor,
                        relation.owner_table(),
                        &patch,
                        Some(where_composite(
                            relation.owner_table(),
                            relation.owner_id_columns(),
                            &relation.owner_id(&self.owner),
                        )),
                    )
                    .await?;
                    key.assign(&mut self.owner, relation.owner_props());
                    inserted.push(row);
                }
            }
            RelationKind::HasMany => {
                for row in rows {
                    inserted.push(insert_record(ctx, executor, ctx.entity(), row).await?);
                }
            }
            RelationKind::ManyToMany(join_table) => {
                let naming = relation.naming();
                for row in rows {
                    let stored = join_table.omit_extras(&row, naming);
                    let mut merged = insert_record(ctx, executor, ctx.entity(), stored).await?;
                    for (prop, value) in row {
                        merged.entry(prop).or_insert(value);
                    }
                    inserted.push(merged);
                }
                let join_rows = join_table.create_join_rows(
                    &relation.owner_key(&self.owner),
                    &inserted,
                    relation.related_props(),
                    naming,
                );
                insert_rows(executor, join_table.table(), join_rows).await?;
            }
        }

        Ok(QueryOutput::Rows(inserted))
    }
}

/// Connects existing rows to the owner without inserting them.
pub struct RelateOperation {
    relation: Arc<Relation>,
    owner: Record,
    ids: Vec<CompositeKey>,
    input: Value,
}

impl RelateOperation {
    pub fn ids(&self) -> &[CompositeKey] {
        &self.ids
    }
}

#[async_trait]
impl QueryOperation for RelateOperation {
    fn name(&self) -> &str {
        "relate"
    }

    fn is_write(&self) -> bool {
        true
    }

    fn call(&mut self, _ctx: &QueryContext, input: OperationInput) -> Result<bool> {
        let input = match input {
            OperationInput::Ids(input) => input,
            other => return Err(unexpected_input(self.name(), &other)),
        };
        let props = match self.relation.kind() {
            RelationKind::BelongsToOne | RelationKind::ManyToMany(_) => {
                self.relation.related_props()
            }
            RelationKind::HasMany => self.relation.related_id_props(),
        };
        self.ids = normalize_ids(&input, props)?;
        if self.ids.is_empty() {
            return Ok(false);
        }
        if self.relation.is_one_to_one() && self.ids.len() > 1 {
            return Err(RelationError::cardinality(
                self.relation.name(),
                "can only relate one model to a BelongsToOneRelation",
            ));
        }
        self.input = input;
        Ok(true)
    }

    async fn execute(
        &mut self,
        ctx: &QueryContext,
        executor: &dyn StatementExecutor,
    ) -> Result<QueryOutput> {
        let relation = self.relation.clone();
        let affected = match relation.kind() {
            RelationKind::BelongsToOne => {
                let patch: Vec<(String, Value)> = relation
                    .owner_columns()
                    .iter()
                    .cloned()
                    .zip(self.ids[0].values().iter().cloned())
                    .collect();
                let affected = update_rows(
                    executor,
                    relation.owner_table(),
                    &patch,
                    Some(where_composite(
                        relation.owner_table(),
                        relation.owner_id_columns(),
                        &relation.owner_id(&self.owner),
                    )),
                )
                .await?;
                self.ids[0].assign(&mut self.owner, relation.owner_props());
                affected
            }
            RelationKind::HasMany => {
                let owner_key = relation.owner_key(&self.owner);
                let patch: Vec<(String, Value)> = relation
                    .related_columns()
                    .iter()
                    .cloned()
                    .zip(owner_key.values().iter().cloned())
                    .collect();
                let condition = and_query_condition(
                    ctx,
                    where_in_composite(
                        relation.related_table(),
                        relation.related_id_columns(),
                        &self.ids,
                    ),
                );
                update_rows(executor, relation.related_table(), &patch, Some(condition)).await?
            }
            RelationKind::ManyToMany(join_table) => {
                let related: Vec<Record> = match &self.input {
                    Value::Object(record) => vec![record.clone()],
                    Value::Array(items) if items.iter().all(Value::is_object) => items
                        .iter()
                        .filter_map(Value::as_object)
                        .cloned()
                        .collect(),
                    _ => self
                        .ids
                        .iter()
                        .map(|id| id.to_record(relation.related_props()))
                        .collect(),
                };
                let join_rows = join_table.create_join_rows(
                    &relation.owner_key(&self.owner),
                    &related,
                    relation.related_props(),
                    relation.naming(),
                );
                insert_rows(executor, join_table.table(), join_rows).await?
            }
        };
        Ok(QueryOutput::Affected(affected))
    }

    async fn on_after(
        &mut self,
        _ctx: &QueryContext,
        _executor: &dyn StatementExecutor,
        _output: QueryOutput,
    ) -> Result<QueryOutput> {
        Ok(QueryOutput::Value(self.input.clone()))
    }
}

/// Disconnects related rows from the owner without deleting them.
pub struct UnrelateOperation {
    relation: Arc<Relation>,
    owner: Record,
}

#[async_trait]
impl QueryOperation for UnrelateOperation {
    fn name(&self) -> &str {
        "unrelate"
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
        let relation = self.relation.clone();
        let owner_key = relation.owner_key(&self.owner);
        let affected = match relation.kind() {
            RelationKind::BelongsToOne => {
                let patch: Vec<(String, Value)> = relation
                    .owner_columns()
                    .iter()
                    .map(|col| (col.clone(), Value::Null))
                    .collect();
                let affected = update_rows(
                    executor,
                    relation.owner_table(),
                    &patch,
                    Some(where_composite(
                        relation.owner_table(),
                        relation.owner_id_columns(),
                        &relation.owner_id(&self.owner),
                    )),
                )
                .await?;
                for prop in relation.owner_props() {
                    self.owner.insert(prop.clone(), Value::Null);
                }
                affected
            }
            RelationKind::HasMany => {
                let patch: Vec<(String, Value)> = relation
                    .related_columns()
                    .iter()
                    .map(|col| (col.clone(), Value::Null))
                    .collect();
                let condition = and_query_condition(
                    ctx,
                    where_composite(relation.related_table(), relation.related_columns(), &owner_key),
                );
                update_rows(executor, relation.related_table(), &patch, Some(condition)).await?
            }
            RelationKind::ManyToMany(join_table) => {
                let mut condition =
                    where_composite(join_table.table(), join_table.owner_columns(), &owner_key);
                if let Some(related_filter) = ctx.condition() {
                    let caps = ctx.capabilities(executor);
                    let restriction = if caps.subquery_on_target_table {
                        let mut sub = Query::select();
                        for col in relation.related_columns() {
                            sub.column((Alias::new(relation.related_table()), Alias::new(col)));
                        }
                        sub.from(Alias::new(relation.related_table()))
                            .cond_where(related_filter);
                        tuple_in_subquery(join_table.table(), join_table.related_columns(), sub)
                    } else {
                        let inner = format!("{}_{}", join_table.table(), ROWID);
                        let mut sub = Query::select();
                        sub.column((Alias::new(&inner), Alias::new(ROWID)))
                            .from_as(Alias::new(join_table.table()), Alias::new(&inner))
                            .join(
                                JoinType::InnerJoin,
                                Alias::new(relation.related_table()),
                                join_on(
                                    &inner,
                                    join_table.related_columns(),
                                    relation.related_table(),
                                    relation.related_columns(),
                                ),
                            )
                            .cond_where(
                                Condition::all()
                                    .add(where_composite(
                                        &inner,
                                        join_table.owner_columns(),
                                        &owner_key,
                                    ))
                                    .add(related_filter),
                            );
                        column(join_table.table(), ROWID).in_subquery(sub)
                    };
                    condition = condition.add(restriction);
                }
                let stmt = delete_statement(join_table.table(), Some(condition));
                executor.execute(SqlStatement::Delete(stmt)).await?
            }
        };
        Ok(QueryOutput::Affected(affected))
    }
}

/// Updates (full validation) or patches (partial validation) the related
/// rows of the owner.
pub struct RelatedUpdateOperation {
    relation: Arc<Relation>,
    owner: Record,
    mode: ValidationMode,
    patch: Record,
}

#[async_trait]
impl QueryOperation for RelatedUpdateOperation {
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
        let caps = ctx.capabilities(executor);
        let condition =
            and_query_condition(ctx, self.relation.related_rows_condition(&self.owner, caps));
        let columns = ctx.entity().to_columns(&self.patch);
        let affected =
            update_rows(executor, self.relation.related_table(), &columns, Some(condition))
                .await?;
        Ok(QueryOutput::Affected(affected))
    }
}

/// Deletes the related rows of the owner.
pub struct RelatedDeleteOperation {
    relation: Arc<Relation>,
    owner: Record,
}

#[async_trait]
impl QueryOperation for RelatedDeleteOperation {
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
        let caps = ctx.capabilities(executor);
        let condition =
            and_query_condition(ctx, self.relation.related_rows_condition(&self.owner, caps));
        let stmt = delete_statement(self.relation.related_table(), Some(condition));
        let affected = executor.execute(SqlStatement::Delete(stmt)).await?;
        Ok(QueryOutput::Affected(affected))
    }
}
