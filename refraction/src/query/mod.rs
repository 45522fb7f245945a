//! Query builder over one entity table, with an ordered pipeline of
//! operations run at a single execution point.

mod eager;
pub mod operation;
pub(crate) mod write;

use std::sync::Arc;

use futures::future::BoxFuture;
use log::{trace, warn};
use sea_orm::sea_query::SelectStatement;
use sea_orm::TransactionTrait;
use serde_json::Value;

pub use eager::EagerFetchOperation;
pub use operation::{OperationInput, OperationState, QueryContext, QueryOperation, QueryOutput};
pub use write::{DeleteOperation, InsertOperation, UpdateOperation};

use crate::error::{RelationError, Result};
use crate::executor::StatementExecutor;
use crate::expression::RelationExpression;
use crate::filters::{filter, FilterFn, FilterRegistry, PathFilter};
use crate::graph::InsertGraphOperation;
use crate::key::{normalize_ids, where_composite, where_in_composite, CompositeKey};
use crate::relation::Relation;
use crate::schema::{EntitySchema, Schema};
use crate::Record;

struct AttachedOperation {
    op: Box<dyn QueryOperation>,
    state: OperationState,
}

impl AttachedOperation {
    fn transition(&mut self, entity: &str, state: OperationState) {
        trace!("{}.{}: {:?} -> {:?}", entity, self.op.name(), self.state, state);
        self.state = state;
    }
}

/// A query against one entity, optionally bound to the rows related to a
/// set of owners.
pub struct EntityQuery {
    ctx: QueryContext,
    binding: Option<(Arc<Relation>, Vec<Record>)>,
    operations: Vec<AttachedOperation>,
    vetoed: Option<QueryOutput>,
}

impl EntityQuery {
    pub(crate) fn new(schema: Arc<Schema>, entity: Arc<EntitySchema>) -> Self {
        Self {
            ctx: QueryContext::new(schema, entity),
            binding: None,
            operations: Vec::new(),
            vetoed: None,
        }
    }

    pub(crate) fn bind_relation(mut self, relation: Arc<Relation>, owners: Vec<Record>) -> Self {
        self.binding = Some((relation, owners));
        self
    }

    pub(crate) fn child_of(parent: &QueryContext, entity: Arc<EntitySchema>) -> Self {
        Self {
            ctx: parent.child(entity),
            binding: None,
            operations: Vec::new(),
            vetoed: None,
        }
    }

    pub fn entity(&self) -> &Arc<EntitySchema> {
        self.ctx.entity()
    }

    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    /// Name and state of every operation still in the pipeline.
    pub fn operation_states(&self) -> Vec<(&str, OperationState)> {
        self.operations
            .iter()
            .map(|attached| (attached.op.name(), attached.state))
            .collect()
    }

    pub fn where_eq(mut self, prop: &str, value: impl Into<Value>) -> Self {
        let entity = self.ctx.entity().clone();
        let column = entity.naming().to_column(prop);
        self.ctx.conditions.push(where_composite(
            entity.table(),
            &[column],
            &CompositeKey::new(vec![value.into()]),
        ));
        self
    }

    pub fn where_composite(mut self, props: &[&str], key: &CompositeKey) -> Self {
        let entity = self.ctx.entity().clone();
        let columns = to_columns(&entity, props);
        self.ctx
            .conditions
            .push(where_composite(entity.table(), &columns, key));
        self
    }

    pub fn where_in_composite(mut self, props: &[&str], keys: &[CompositeKey]) -> Self {
        let entity = self.ctx.entity().clone();
        let columns = to_columns(&entity, props);
        self.ctx
            .conditions
            .push(where_in_composite(entity.table(), &columns, keys));
        self
    }

    /// Restricts the query to the row with identifier `id`.
    pub fn find_by_id(mut self, id: impl Into<Value>) -> Result<Self> {
        let entity = self.ctx.entity().clone();
        let keys = normalize_ids(&id.into(), entity.id_props())?;
        match keys.as_slice() {
            [key] => {
                self.ctx
                    .conditions
                    .push(where_composite(entity.table(), entity.id_columns(), key));
                Ok(self)
            }
            _ => Err(RelationError::invalid_ids(format!(
                "find_by_id expects exactly one id, got {}",
                keys.len()
            ))),
        }
    }

    pub fn modify<F>(self, f: F) -> Self
    where
        F: Fn(&mut SelectStatement) + Send + Sync + 'static,
    {
        self.modify_with(filter(f))
    }

    pub(crate) fn modify_with(mut self, f: FilterFn) -> Self {
        self.ctx.modifiers.push(f);
        self
    }

    /// Named filters available to eager expressions of this query and of
    /// every query it spawns.
    pub fn filters(mut self, registry: FilterRegistry) -> Self {
        self.ctx.filters.extend(&registry);
        self
    }

    pub fn eager(self, expression: &str) -> Result<Self> {
        let expression = RelationExpression::parse(expression)?;
        self.eager_expression(expression, Vec::new())
    }

    pub fn eager_expression(
        self,
        expression: RelationExpression,
        filters: Vec<PathFilter>,
    ) -> Result<Self> {
        self.attach(
            Box::new(EagerFetchOperation::new()),
            OperationInput::Eager {
                expression,
                filters,
            },
        )
    }

    /// Inserts one object or an array of objects. Through a relation
    /// binding the rows are also connected to the single owner.
    pub fn insert(self, rows: Value) -> Result<Self> {
        let rows = write::records_from_value("insert", rows)?;
        let op: Box<dyn QueryOperation> = match &self.binding {
            Some((relation, _)) => Box::new(relation.insert(self.single_owner("insert")?)),
            None => Box::new(InsertOperation::new()),
        };
        self.attach(op, OperationInput::Rows(rows))
    }

    pub fn insert_graph(self, graph: Value) -> Result<Self> {
        self.graph_operation(graph, false)
    }

    /// Like [`insert_graph`](Self::insert_graph), then reloads the inserted
    /// roots together with every relation the graph touched.
    pub fn insert_graph_and_fetch(self, graph: Value) -> Result<Self> {
        self.graph_operation(graph, true)
    }

    /// Through a relation binding the graph roots become rows related to
    /// the single owner.
    fn graph_operation(self, graph: Value, fetch: bool) -> Result<Self> {
        let mut op = InsertGraphOperation::new();
        if let Some((relation, _)) = &self.binding {
            op = op.related_to(relation.clone(), self.single_owner("insert_graph")?);
        }
        if fetch {
            op = op.and_fetch();
        }
        self.attach(Box::new(op), OperationInput::Graph(graph))
    }

    /// Relations a graph insertion may write; anything outside fails
    /// before the first statement.
    pub fn allow_insert(mut self, expression: &str) -> Result<Self> {
        self.ctx.allowed_insert = Some(RelationExpression::parse(expression)?);
        Ok(self)
    }

    pub fn patch(self, patch: Value) -> Result<Self> {
        self.update_like(patch, ValidationKind::Patch)
    }

    pub fn update(self, record: Value) -> Result<Self> {
        self.update_like(record, ValidationKind::Update)
    }

    fn update_like(self, value: Value, kind: ValidationKind) -> Result<Self> {
        let name = kind.name();
        let record = match value {
            Value::Object(record) => record,
            other => {
                return Err(RelationError::invalid_operation(
                    name,
                    format!("expected an object, got {}", other),
                ))
            }
        };
        let op: Box<dyn QueryOperation> = match (&self.binding, kind) {
            (Some((relation, _)), ValidationKind::Update) => {
                Box::new(relation.update(self.single_owner(name)?))
            }
            (Some((relation, _)), ValidationKind::Patch) => {
                Box::new(relation.patch(self.single_owner(name)?))
            }
            (None, ValidationKind::Update) => Box::new(UpdateOperation::update()),
            (None, ValidationKind::Patch) => Box::new(UpdateOperation::patch()),
        };
        self.attach(op, OperationInput::Patch(record))
    }

    pub fn delete(self) -> Result<Self> {
        let op: Box<dyn QueryOperation> = match &self.binding {
            Some((relation, _)) => Box::new(relation.delete(self.single_owner("delete")?)),
            None => Box::new(DeleteOperation),
        };
        self.attach(op, OperationInput::None)
    }

    /// Connects existing rows, identified in any shape
    /// [`normalize_ids`] accepts, to the bound owner.
    pub fn relate(self, ids: impl Into<Value>) -> Result<Self> {
        let relation = self.bound_relation("relate")?;
        let op = relation.relate(self.single_owner("relate")?);
        self.attach(Box::new(op), OperationInput::Ids(ids.into()))
    }

    pub fn unrelate(self) -> Result<Self> {
        let relation = self.bound_relation("unrelate")?;
        let op = relation.unrelate(self.single_owner("unrelate")?);
        self.attach(Box::new(op), OperationInput::None)
    }

    fn bound_relation(&self, operation: &str) -> Result<Arc<Relation>> {
        self.binding
            .as_ref()
            .map(|(relation, _)| relation.clone())
            .ok_or_else(|| {
                RelationError::invalid_operation(operation, "query is not bound to a relation")
            })
    }

    fn single_owner(&self, operation: &str) -> Result<Record> {
        match &self.binding {
            Some((_, owners)) if owners.len() == 1 => Ok(owners[0].clone()),
            Some((relation, owners)) => Err(RelationError::invalid_operation(
                operation,
                format!(
                    "writes through \"{}\" need exactly one owner, got {}",
                    relation.name(),
                    owners.len()
                ),
            )),
            None => Err(RelationError::invalid_operation(
                operation,
                "query is not bound to a relation",
            )),
        }
    }

    /// Runs `call` and keeps the operation unless it vetoes itself.
    pub fn attach(mut self, op: Box<dyn QueryOperation>, input: OperationInput) -> Result<Self> {
        let entity = self.ctx.entity().name().to_string();
        let mut attached = AttachedOperation {
            op,
            state: OperationState::Pending,
        };

        if attached.op.is_write()
            && (self.vetoed.is_some() || self.operations.iter().any(|a| a.op.is_write()))
        {
            return Err(RelationError::invalid_operation(
                attached.op.name(),
                "a query runs at most one write operation",
            ));
        }

        match attached.op.call(&self.ctx, input) {
            Ok(true) => {
                attached.transition(&entity, OperationState::Called);
                self.operations.push(attached);
            }
            Ok(false) => {
                trace!("{}.{}: dropped by call", entity, attached.op.name());
                if attached.op.is_write() {
                    self.vetoed = Some(attached.op.vetoed_output());
                }
            }
            Err(err) => {
                attached.transition(&entity, OperationState::Failed);
                return Err(err);
            }
        }
        Ok(self)
    }

    /// Runs the pipeline: `on_before` short-circuits, then the write
    /// operation or the SELECT built by every `on_build`, then every
    /// `on_after` in attachment order.
    pub fn execute<'a>(self, executor: &'a dyn StatementExecutor) -> BoxFuture<'a, Result<QueryOutput>> {
        Box::pin(async move {
            let EntityQuery {
                ctx,
                binding,
                mut operations,
                vetoed,
            } = self;
            let entity = ctx.entity().name().to_string();

            if let Some(output) = vetoed {
                return Ok(output);
            }

            let has_write = operations.iter().any(|a| a.op.is_write());
            if let (false, Some((relation, owners))) = (has_write, binding) {
                let mut find = relation.find(owners);
                find.call(&ctx, OperationInput::None)?;
                operations.insert(
                    0,
                    AttachedOperation {
                        op: Box::new(find),
                        state: OperationState::Called,
                    },
                );
            }

            let short_circuit = operations.iter().find_map(|a| a.op.on_before(&ctx));

            let mut output = match short_circuit {
                Some(output) => output,
                None if has_write => {
                    let mut result = Ok(QueryOutput::Affected(0));
                    for attached in operations.iter_mut().filter(|a| a.op.is_write()) {
                        attached.transition(&entity, OperationState::Executing);
                        result = attached.op.execute(&ctx, executor).await;
                        if result.is_err() {
                            attached.transition(&entity, OperationState::Failed);
                        }
                    }
                    result?
                }
                None => {
                    let mut select = ctx.base_select();
                    for attached in operations.iter_mut() {
                        attached.transition(&entity, OperationState::Building);
                        if let Err(err) = attached.op.on_build(&ctx, &mut select) {
                            attached.transition(&entity, OperationState::Failed);
                            return Err(err);
                        }
                    }
                    let rows = executor.fetch(select).await?;
                    QueryOutput::Rows(
                        rows.into_iter()
                            .map(|row| ctx.entity().from_row(row))
                            .collect(),
                    )
                }
            };

            for attached in operations.iter_mut() {
                match attached.op.on_after(&ctx, executor, output).await {
                    Ok(next) => {
                        output = next;
                        attached.transition(&entity, OperationState::Completed);
                    }
                    Err(err) => {
                        attached.transition(&entity, OperationState::Failed);
                        return Err(err);
                    }
                }
            }
            Ok(output)
        })
    }

    /// Executes a read query and returns its rows.
    pub async fn fetch(self, executor: &dyn StatementExecutor) -> Result<Vec<Record>> {
        Ok(self.execute(executor).await?.into_rows())
    }

    /// Executes inside a fresh transaction of `conn`, committing on success
    /// and rolling back on any error.
    pub async fn execute_in_transaction<C>(self, conn: &C) -> Result<QueryOutput>
    where
        C: TransactionTrait,
    {
        let txn = conn.begin().await?;
        match self.execute(&txn).await {
            Ok(output) => {
                txn.commit().await?;
                Ok(output)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!("rollback failed after {}: {}", err, rollback);
                }
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ValidationKind {
    Update,
    Patch,
}

impl ValidationKind {
    fn name(self) -> &'static str {
        match self {
            ValidationKind::Update => "update",
            ValidationKind::Patch => "patch",
        }
    }
}

fn to_columns(entity: &EntitySchema, props: &[&str]) -> Vec<String> {
    props
        .iter()
        .map(|prop| entity.naming().to_column(prop))
        .collect()
}
