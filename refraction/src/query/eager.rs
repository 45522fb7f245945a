//! Eager loading: one find per relation branch per level, siblings fetched
//! concurrently and attached to their owners by key.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::debug;

use crate::error::{RelationError, Result};
use crate::executor::StatementExecutor;
use crate::expression::{RelationExpression, WILDCARD};
use crate::query::operation::{OperationInput, QueryContext, QueryOperation, QueryOutput};
use crate::query::write::unexpected_input;
use crate::query::EntityQuery;
use crate::relation::Relation;
use crate::Record;

#[derive(Debug, Default)]
pub struct EagerFetchOperation {
    expression: RelationExpression,
}

impl EagerFetchOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expression(&self) -> &RelationExpression {
        &self.expression
    }
}

#[async_trait]
impl QueryOperation for EagerFetchOperation {
    fn name(&self) -> &str {
        "eager"
    }

    fn call(&mut self, ctx: &QueryContext, input: OperationInput) -> Result<bool> {
        let (mut expression, filters) = match input {
            OperationInput::Eager {
                expression,
                filters,
            } => (expression, filters),
            other => return Err(unexpected_input(self.name(), &other)),
        };
        for path_filter in filters {
            expression.add_anonymous_filter_at_path(&path_filter.path, path_filter.filter)?;
        }

        let entity = ctx.entity();
        for child in expression.children() {
            if child.name() != WILDCARD && entity.relation(child.name()).is_none() {
                return Err(RelationError::unknown_relation(entity.name(), child.name()));
            }
        }

        let keep = !expression.is_leaf();
        self.expression = expression;
        Ok(keep)
    }

    async fn on_after(
        &mut self,
        ctx: &QueryContext,
        executor: &dyn StatementExecutor,
        output: QueryOutput,
    ) -> Result<QueryOutput> {
        let mut owners = match output {
            QueryOutput::Rows(rows) if !rows.is_empty() => rows,
            other => return Ok(other),
        };

        let branches: Vec<(Arc<Relation>, RelationExpression)> = ctx
            .entity()
            .relations()
            .iter()
            .filter_map(|relation| {
                self.expression
                    .child_expression(relation.name())
                    .map(|child| (relation.clone(), child))
            })
            .collect();
        if branches.is_empty() {
            return Ok(QueryOutput::Rows(owners));
        }

        let max_depth = ctx.config().max_recursion_depth;
        if ctx.depth() >= max_depth {
            return Err(RelationError::invalid_operation(
                self.name(),
                format!(
                    "eager expression \"{}\" nests deeper than {} levels",
                    self.expression, max_depth
                ),
            ));
        }

        debug!(
            "eager {} level {}: {} owners, branches {:?}",
            ctx.entity().name(),
            ctx.depth(),
            owners.len(),
            branches.iter().map(|(r, _)| r.name()).collect::<Vec<_>>()
        );

        let fetches = branches
            .iter()
            .map(|(relation, child)| fetch_branch(ctx, executor, relation, child, &owners));
        let mut fetched = Vec::with_capacity(branches.len());
        for result in join_all(fetches).await {
            fetched.push(result?);
        }

        for ((relation, _), related) in branches.iter().zip(fetched) {
            relation.attach(&mut owners, related);
        }
        Ok(QueryOutput::Rows(owners))
    }
}

async fn fetch_branch(
    ctx: &QueryContext,
    executor: &dyn StatementExecutor,
    relation: &Arc<Relation>,
    expression: &RelationExpression,
    owners: &[Record],
) -> Result<Vec<Record>> {
    let related = ctx.schema().entity(relation.related_entity())?.clone();
    let mut query = EntityQuery::child_of(ctx, related);

    for arg in expression.args() {
        let named = ctx
            .filters()
            .get(arg)
            .cloned()
            .ok_or_else(|| RelationError::UnknownFilter {
                relation: relation.name().to_string(),
                filter: arg.clone(),
            })?;
        query = query.modify_with(named);
    }
    for anonymous in expression.anonymous_filters() {
        query = query.modify_with(anonymous.clone());
    }

    query = query.attach(
        Box::new(relation.find(owners.to_vec()).keeping_owner_keys()),
        OperationInput::None,
    )?;
    if !expression.is_leaf() {
        query = query.attach(
            Box::new(EagerFetchOperation::new()),
            OperationInput::Eager {
                expression: expression.clone(),
                filters: Vec::new(),
            },
        )?;
    }

    Ok(query.execute(executor).await?.into_rows())
}
