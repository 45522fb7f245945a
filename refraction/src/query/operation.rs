use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Asterisk, Condition, Query, SelectStatement};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{RelationError, Result};
use crate::executor::{DialectCapabilities, StatementExecutor};
use crate::expression::RelationExpression;
use crate::filters::{FilterFn, FilterRegistry, PathFilter};
use crate::schema::{EntitySchema, Schema};
use crate::validation::ValidationMode;
use crate::Record;

/// Arguments captured by [`QueryOperation::call`].
#[derive(Debug, Clone)]
pub enum OperationInput {
    None,
    /// Identifiers in any shape accepted by [`normalize_ids`](crate::key::normalize_ids).
    Ids(Value),
    Rows(Vec<Record>),
    Patch(Record),
    Graph(Value),
    Eager {
        expression: RelationExpression,
        filters: Vec<PathFilter>,
    },
}

/// What a query resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows(Vec<Record>),
    Affected(u64),
    /// The caller's own input, handed back unchanged.
    Value(Value),
}

impl QueryOutput {
    pub fn rows(&self) -> Option<&[Record]> {
        match self {
            QueryOutput::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Vec<Record> {
        match self {
            QueryOutput::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn affected(&self) -> Option<u64> {
        match self {
            QueryOutput::Affected(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Called,
    Building,
    Executing,
    Completed,
    Failed,
}

/// Everything an operation may read about the query it is attached to.
#[derive(Clone)]
pub struct QueryContext {
    pub(crate) schema: Arc<Schema>,
    pub(crate) entity: Arc<EntitySchema>,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) modifiers: Vec<FilterFn>,
    pub(crate) filters: FilterRegistry,
    pub(crate) depth: usize,
    pub(crate) allowed_insert: Option<RelationExpression>,
}

impl QueryContext {
    pub(crate) fn new(schema: Arc<Schema>, entity: Arc<EntitySchema>) -> Self {
        Self {
            schema,
            entity,
            conditions: Vec::new(),
            modifiers: Vec::new(),
            filters: FilterRegistry::new(),
            depth: 0,
            allowed_insert: None,
        }
    }

    /// Context of a query spawned by this one: same filters, one level deeper.
    pub(crate) fn child(&self, entity: Arc<EntitySchema>) -> Self {
        Self {
            schema: self.schema.clone(),
            entity,
            conditions: Vec::new(),
            modifiers: Vec::new(),
            filters: self.filters.clone(),
            depth: self.depth + 1,
            allowed_insert: None,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn entity(&self) -> &Arc<EntitySchema> {
        &self.entity
    }

    pub fn config(&self) -> &EngineConfig {
        self.schema.config()
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Eager nesting level; zero for a query built by the caller.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Upper bound for relations written by graph insertion, if any.
    pub fn allowed_insert(&self) -> Option<&RelationExpression> {
        self.allowed_insert.as_ref()
    }

    pub fn capabilities(&self, executor: &dyn StatementExecutor) -> DialectCapabilities {
        self.schema.capabilities(executor.backend())
    }

    /// The accumulated WHERE clauses, if any.
    pub fn condition(&self) -> Option<Condition> {
        if self.conditions.is_empty() {
            return None;
        }
        Some(
            self.conditions
                .iter()
                .cloned()
                .fold(Condition::all(), |all, cond| all.add(cond)),
        )
    }

    /// `SELECT table.* FROM table` with the query's conditions and modifiers.
    pub fn base_select(&self) -> SelectStatement {
        let table = self.entity.table();
        let mut select = Query::select();
        select
            .column((Alias::new(table), Asterisk))
            .from(Alias::new(table));
        if let Some(condition) = self.condition() {
            select.cond_where(condition);
        }
        for modifier in &self.modifiers {
            modifier(&mut select);
        }
        select
    }

    pub fn validate(
        &self,
        entity: &EntitySchema,
        record: Record,
        mode: ValidationMode,
    ) -> Result<Record> {
        self.schema
            .validator()
            .validate(entity.name(), record, mode)
            .map_err(RelationError::Validation)
    }
}

/// One unit of work attached to an [`EntityQuery`](crate::query::EntityQuery).
///
/// `call` runs when the operation is attached; the remaining hooks run when
/// the query executes: `on_before`, then `on_build` (reads) or `execute`
/// (the single write), then `on_after` in attachment order.
#[async_trait]
pub trait QueryOperation: Send + Sync {
    fn name(&self) -> &str;

    fn is_write(&self) -> bool {
        false
    }

    /// Captures and validates arguments. `Ok(false)` drops the operation.
    fn call(&mut self, ctx: &QueryContext, input: OperationInput) -> Result<bool>;

    /// What the query resolves to when a write operation drops itself in
    /// `call`.
    fn vetoed_output(&self) -> QueryOutput {
        QueryOutput::Affected(0)
    }

    /// A `Some` result skips the statement entirely.
    fn on_before(&self, _ctx: &QueryContext) -> Option<QueryOutput> {
        None
    }

    fn on_build(&self, _ctx: &QueryContext, _select: &mut SelectStatement) -> Result<()> {
        Ok(())
    }

    async fn execute(
        &mut self,
        _ctx: &QueryContext,
        _executor: &dyn StatementExecutor,
    ) -> Result<QueryOutput> {
        Err(RelationError::invalid_operation(
            self.name(),
            "operation does not issue a statement of its own",
        ))
    }

    async fn on_after(
        &mut self,
        _ctx: &QueryContext,
        _executor: &dyn StatementExecutor,
        output: QueryOutput,
    ) -> Result<QueryOutput> {
        Ok(output)
    }
}
