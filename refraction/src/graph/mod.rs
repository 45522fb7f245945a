//! Graph insertion: a nested document of new rows, `#id` declarations,
//! `#ref` references and `#dbRef` links to existing rows, written in
//! dependency order. Through a relation binding the roots are related to
//! the bound owner once the graph is written.

mod node;
mod plan;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use serde_json::Value;

use crate::error::{RelationError, Result};
use crate::executor::StatementExecutor;
use crate::expression::RelationExpression;
use crate::key::{unique_keys, where_composite, CompositeKey};
use crate::query::operation::{OperationInput, QueryContext, QueryOperation, QueryOutput};
use crate::query::write::{insert_record, insert_rows, unexpected_input, update_rows};
use crate::query::EntityQuery;
use crate::relation::{JoinTable, Relation, RelationKind};
use crate::validation::ValidationMode;
use crate::Record;

use node::{display_path, template_regex, GraphNodes, NodeSource, Template};
use plan::{require_db_ref_props, InsertPlan};

/// A `#ref{}` property written as NULL because its target was not yet
/// inserted.
struct DeferredTemplate {
    node: usize,
    template: Template,
}

/// The owner a relation-bound graph hangs its roots on.
struct BoundOwner {
    relation: Arc<Relation>,
    owner: Record,
}

#[derive(Default)]
pub struct InsertGraphOperation {
    graph: Option<GraphNodes>,
    plan: InsertPlan,
    fetch: bool,
    bound: Option<BoundOwner>,
}

impl InsertGraphOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reloads the inserted roots with every relation present in the graph.
    pub fn and_fetch(mut self) -> Self {
        self.fetch = true;
        self
    }

    /// Inserts the roots as rows related to `owner` through `relation`.
    pub fn related_to(mut self, relation: Arc<Relation>, owner: Record) -> Self {
        self.bound = Some(BoundOwner { relation, owner });
        self
    }
}

#[async_trait]
impl QueryOperation for InsertGraphOperation {
    fn name(&self) -> &str {
        "insert_graph"
    }

    fn is_write(&self) -> bool {
        true
    }

    fn call(&mut self, ctx: &QueryContext, input: OperationInput) -> Result<bool> {
        let graph = match input {
            OperationInput::Graph(graph) => graph,
            other => return Err(unexpected_input(self.name(), &other)),
        };
        let mut graph = GraphNodes::collect(ctx.schema(), ctx.entity(), graph)?;
        if graph.is_empty() {
            return Ok(false);
        }
        if let Some(bound) = &self.bound {
            bound.prepare(&mut graph)?;
        }
        self.plan = InsertPlan::build(&graph)?;
        self.graph = Some(graph);
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
        let mut graph = self.graph.take().ok_or_else(|| {
            RelationError::invalid_operation(self.name(), "graph was already inserted")
        })?;
        let implied = implied_expression(&graph);
        if let Some(allowed) = ctx.allowed_insert() {
            if !implied.is_subset_of(allowed) {
                return Err(RelationError::RelationNotAllowed {
                    expression: implied.to_string(),
                    allowed: allowed.to_string(),
                });
            }
        }

        debug!(
            "insert graph into {}: order {:?}",
            ctx.entity().name(),
            self.plan
                .order
                .iter()
                .map(|&i| display_path(&graph.nodes[i].path).to_string())
                .collect::<Vec<_>>()
        );

        let templates = template_regex(&ctx.config().markers)?;
        let mut writer = GraphWriter {
            ctx,
            executor,
            plan: &self.plan,
            templates: &templates,
            bound: self.bound.as_ref(),
            deferred: Vec::new(),
        };
        writer.apply_known_assignments(&mut graph);
        for &index in &self.plan.order {
            writer.insert_node(&mut graph, index).await?;
        }
        writer.write_join_rows(&graph).await?;
        writer.link_owner(&graph).await?;

        let mut rendered: Vec<Record> = graph.roots.iter().map(|&root| render(&graph, root)).collect();
        if self.fetch {
            rendered = fetch_roots(ctx, executor, &graph, implied).await?;
        }
        Ok(QueryOutput::Rows(rendered))
    }
}

struct GraphWriter<'a> {
    ctx: &'a QueryContext,
    executor: &'a dyn StatementExecutor,
    plan: &'a InsertPlan,
    templates: &'a Regex,
    bound: Option<&'a BoundOwner>,
    deferred: Vec<DeferredTemplate>,
}

impl GraphWriter<'_> {
    /// Assignments out of `#dbRef` nodes, whose keys are known up front.
    fn apply_known_assignments(&self, graph: &mut GraphNodes) {
        for assignment in &self.plan.assignments {
            if graph.nodes[assignment.from].has_identity() {
                propagate(graph, assignment);
            }
        }
    }

    async fn insert_node(&mut self, graph: &mut GraphNodes, index: usize) -> Result<()> {
        let templates = std::mem::take(&mut graph.nodes[index].templates);
        for template in templates {
            match substitute(self.templates, graph, &template) {
                Some(value) => {
                    graph.nodes[index].data.insert(template.prop.clone(), value);
                }
                None => {
                    graph.nodes[index]
                        .data
                        .insert(template.prop.clone(), Value::Null);
                    self.deferred.push(DeferredTemplate {
                        node: index,
                        template,
                    });
                }
            }
        }

        let node = &graph.nodes[index];
        let entity = node.entity.clone();
        let mut record = node.data.clone();
        for edge in self.plan.join_edges.iter().filter(|e| e.extras_from == index) {
            if let RelationKind::ManyToMany(join_table) = edge.relation.kind() {
                record = join_table.omit_extras(&record, edge.relation.naming());
            }
        }
        if let Some(bound) = self.bound {
            if let RelationKind::ManyToMany(join_table) = bound.relation.kind() {
                if graph.roots.contains(&index) {
                    record = join_table.omit_extras(&record, bound.relation.naming());
                }
            }
        }

        let record = self
            .ctx
            .validate(&entity, record, ValidationMode::Insert)
            .map_err(|err| match err {
                RelationError::Validation(errors) => RelationError::Validation(errors.prefixed(&node.path)),
                other => other,
            })?;
        let inserted = insert_record(self.ctx, self.executor, &entity, record).await?;

        let node = &mut graph.nodes[index];
        for (prop, value) in inserted {
            node.data.insert(prop, value);
        }
        node.inserted = true;

        for assignment in self.plan.assignments.iter().filter(|a| a.from == index) {
            propagate(graph, assignment);
        }
        self.relate_existing(graph, index).await?;
        self.patch_deferred(graph).await
    }

    async fn relate_existing(&self, graph: &mut GraphNodes, owner: usize) -> Result<()> {
        for edge in self.plan.relate_existing.iter().filter(|e| e.owner == owner) {
            let relation = &edge.relation;
            let owner_key = relation.owner_key(&graph.nodes[owner].data);
            let related = &graph.nodes[edge.related];
            let related_id = related.entity.id_key(&related.data);
            let columns: Vec<(String, Value)> = relation
                .related_columns()
                .iter()
                .cloned()
                .zip(owner_key.values().iter().cloned())
                .collect();
            update_rows(
                self.executor,
                relation.related_table(),
                &columns,
                Some(where_composite(
                    relation.related_table(),
                    relation.related_id_columns(),
                    &related_id,
                )),
            )
            .await?;
            owner_key.assign(&mut graph.nodes[edge.related].data, relation.related_props());
        }
        Ok(())
    }

    async fn patch_deferred(&mut self, graph: &mut GraphNodes) -> Result<()> {
        let mut still_deferred = Vec::new();
        for deferred in std::mem::take(&mut self.deferred) {
            let value = match substitute(self.templates, graph, &deferred.template) {
                Some(value) => value,
                None => {
                    still_deferred.push(deferred);
                    continue;
                }
            };
            let node = &graph.nodes[deferred.node];
            warn!(
                "patching {} of {} after insert: {}",
                deferred.template.prop,
                node.label(),
                deferred.template.text
            );
            let column = node.entity.naming().to_column(&deferred.template.prop);
            let id = node.entity.id_key(&node.data);
            update_rows(
                self.executor,
                node.entity.table(),
                &[(column, value.clone())],
                Some(where_composite(node.entity.table(), node.entity.id_columns(), &id)),
            )
            .await?;
            graph.nodes[deferred.node]
                .data
                .insert(deferred.template.prop.clone(), value);
        }
        self.deferred = still_deferred;
        Ok(())
    }

    async fn write_join_rows(&self, graph: &GraphNodes) -> Result<()> {
        for edge in &self.plan.join_edges {
            let relation = &edge.relation;
            let join_table = match relation.kind() {
                RelationKind::ManyToMany(join_table) => join_table,
                _ => continue,
            };
            let owner_key = relation.owner_key(&graph.nodes[edge.owner].data);
            self.write_join_row(
                relation,
                join_table,
                &owner_key,
                graph,
                edge.related,
                edge.extras_from,
            )
            .await?;
        }
        Ok(())
    }

    async fn write_join_row(
        &self,
        relation: &Relation,
        join_table: &JoinTable,
        owner_key: &CompositeKey,
        graph: &GraphNodes,
        related: usize,
        extras_from: usize,
    ) -> Result<()> {
        let mut record = graph.nodes[related].data.clone();
        if extras_from != related {
            for prop in join_table.extra_props(relation.naming()) {
                match graph.nodes[extras_from].data.get(&prop) {
                    Some(value) => {
                        record.insert(prop, value.clone());
                    }
                    None => {
                        record.remove(&prop);
                    }
                }
            }
        }
        let rows = join_table.create_join_rows(
            owner_key,
            &[record],
            relation.related_props(),
            relation.naming(),
        );
        insert_rows(self.executor, join_table.table(), rows).await?;
        Ok(())
    }

    /// Connects every root to the bound owner once all rows exist.
    async fn link_owner(&self, graph: &GraphNodes) -> Result<()> {
        let Some(bound) = self.bound else {
            return Ok(());
        };
        let relation = &bound.relation;
        let owner_key = relation.owner_key(&bound.owner);
        for &root in &graph.roots {
            let target = graph.resolve(root);
            let related = &graph.nodes[target];
            match relation.kind() {
                RelationKind::BelongsToOne => {
                    let key = relation.related_key(&related.data);
                    let columns: Vec<(String, Value)> = relation
                        .owner_columns()
                        .iter()
                        .cloned()
                        .zip(key.values().iter().cloned())
                        .collect();
                    update_rows(
                        self.executor,
                        relation.owner_table(),
                        &columns,
                        Some(where_composite(
                            relation.owner_table(),
                            relation.owner_id_columns(),
                            &relation.owner_id(&bound.owner),
                        )),
                    )
                    .await?;
                }
                RelationKind::HasMany => {
                    if let NodeSource::DbRef(id) = &related.source {
                        let columns: Vec<(String, Value)> = relation
                            .related_columns()
                            .iter()
                            .cloned()
                            .zip(owner_key.values().iter().cloned())
                            .collect();
                        update_rows(
                            self.executor,
                            relation.related_table(),
                            &columns,
                            Some(where_composite(
                                relation.related_table(),
                                relation.related_id_columns(),
                                id,
                            )),
                        )
                        .await?;
                    }
                }
                RelationKind::ManyToMany(join_table) => {
                    self.write_join_row(relation, join_table, &owner_key, graph, target, root)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

impl BoundOwner {
    /// Checks the roots against the relation and presets the owner key on
    /// new has-many roots so validation sees it.
    fn prepare(&self, graph: &mut GraphNodes) -> Result<()> {
        let relation = &self.relation;
        if relation.is_one_to_one() && graph.roots.len() > 1 {
            return Err(RelationError::cardinality(
                relation.name(),
                "can only insert one model to a one-to-one relation",
            ));
        }
        let owner_key = relation.owner_key(&self.owner);
        for root in graph.roots.clone() {
            let target = graph.resolve(root);
            match relation.kind() {
                RelationKind::HasMany => {
                    if graph.nodes[target].source == NodeSource::Insert {
                        owner_key.assign(&mut graph.nodes[target].data, relation.related_props());
                    }
                }
                RelationKind::BelongsToOne | RelationKind::ManyToMany(_) => {
                    require_db_ref_props(graph, target, relation.related_props())?;
                }
            }
        }
        Ok(())
    }
}

fn propagate(graph: &mut GraphNodes, assignment: &plan::Assignment) {
    let key = CompositeKey::from_record(&graph.nodes[assignment.from].data, &assignment.from_props);
    key.assign(&mut graph.nodes[assignment.to].data, &assignment.to_props);
}

/// The template value once every target it names has been inserted. A
/// placeholder spanning the whole string keeps the target's value type.
fn substitute(regex: &Regex, graph: &GraphNodes, template: &Template) -> Option<Value> {
    let mut values = Vec::with_capacity(template.targets.len());
    for (uid, prop) in &template.targets {
        let target = &graph.nodes[*graph.ids.get(uid)?];
        if !target.has_identity() {
            return None;
        }
        values.push(target.data.get(prop).cloned().unwrap_or(Value::Null));
    }

    if let (Some(whole), [value]) = (regex.find(&template.text), values.as_slice()) {
        if whole.start() == 0 && whole.end() == template.text.len() {
            return Some(value.clone());
        }
    }

    let mut next = values.iter();
    let text = regex.replace_all(&template.text, |_: &regex::Captures| {
        match next.next() {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    Some(Value::String(text.into_owned()))
}

/// The input shape with database-assigned values filled in.
fn render(graph: &GraphNodes, index: usize) -> Record {
    let node = &graph.nodes[index];
    match &node.source {
        NodeSource::Ref(_) => {
            let mut record = graph.nodes[graph.resolve(index)].data.clone();
            for (prop, value) in &node.data {
                record.insert(prop.clone(), value.clone());
            }
            record
        }
        NodeSource::DbRef(_) => node.data.clone(),
        NodeSource::Insert => {
            let mut record = node.data.clone();
            for slot in &node.relations {
                let value = if slot.to_many {
                    Value::Array(
                        slot.children
                            .iter()
                            .map(|&child| Value::Object(render(graph, child)))
                            .collect(),
                    )
                } else {
                    slot.children
                        .first()
                        .map(|&child| Value::Object(render(graph, child)))
                        .unwrap_or(Value::Null)
                };
                record.insert(slot.relation.name().to_string(), value);
            }
            record
        }
    }
}

/// Every relation written by the graph, as an eager expression rooted at
/// the graph's entity.
fn implied_expression(graph: &GraphNodes) -> RelationExpression {
    let mut root = RelationExpression::new();
    for &index in &graph.roots {
        for child in node_expressions(graph, index) {
            root.insert_child(child);
        }
    }
    root
}

fn node_expressions(graph: &GraphNodes, index: usize) -> Vec<RelationExpression> {
    let node = &graph.nodes[index];
    node.relations
        .iter()
        .map(|slot| {
            let mut expression = RelationExpression::named(slot.relation.name());
            for &child in &slot.children {
                if graph.nodes[child].source == NodeSource::Insert {
                    for nested in node_expressions(graph, child) {
                        expression.insert_child(nested);
                    }
                }
            }
            expression
        })
        .collect()
}

async fn fetch_roots(
    ctx: &QueryContext,
    executor: &dyn StatementExecutor,
    graph: &GraphNodes,
    implied: RelationExpression,
) -> Result<Vec<Record>> {
    let entity = ctx.entity();
    let keys: Vec<CompositeKey> = graph
        .roots
        .iter()
        .map(|&root| entity.id_key(&graph.nodes[root].data))
        .collect();
    let id_props: Vec<&str> = entity.id_props().iter().map(String::as_str).collect();

    let mut query = EntityQuery::new(ctx.schema().clone(), entity.clone())
        .filters(ctx.filters().clone())
        .where_in_composite(&id_props, &unique_keys(keys.clone()));
    if implied.has_children() {
        query = query.eager_expression(implied, Vec::new())?;
    }
    let rows = query.fetch(executor).await?;

    let mut by_key: HashMap<CompositeKey, Record> = rows
        .into_iter()
        .map(|row| (entity.id_key(&row), row))
        .collect();
    Ok(keys
        .iter()
        .filter_map(|key| by_key.remove(key))
        .collect())
}
