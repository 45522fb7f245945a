//! Insertion order of a collected graph.
//!
//! Hard edges (`must precede`) come from foreign keys: a to-one target is
//! written before its owner, a has-many owner before its children.
//! Many-to-many endpoints are unordered; their join rows are written after
//! every node. `#ref{}` placeholders only add soft preferences and are
//! patched afterwards when the preference cannot be met.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::error::{RelationError, Result};
use crate::graph::node::{GraphNodes, NodeSource};
use crate::relation::{Relation, RelationKind};

/// Copies key properties of `from` into `to` once `from` has an identity.
#[derive(Debug, Clone)]
pub(crate) struct Assignment {
    pub from: usize,
    pub to: usize,
    pub from_props: Vec<String>,
    pub to_props: Vec<String>,
}

/// An existing row adopted by a has-many owner.
#[derive(Debug, Clone)]
pub(crate) struct RelateExisting {
    pub owner: usize,
    pub related: usize,
    pub relation: Arc<Relation>,
}

#[derive(Debug, Clone)]
pub(crate) struct JoinEdge {
    pub owner: usize,
    pub related: usize,
    /// The node listed in the relation, holding the extra properties.
    pub extras_from: usize,
    pub relation: Arc<Relation>,
}

#[derive(Debug, Default)]
pub(crate) struct InsertPlan {
    pub order: Vec<usize>,
    pub assignments: Vec<Assignment>,
    pub relate_existing: Vec<RelateExisting>,
    pub join_edges: Vec<JoinEdge>,
}

impl InsertPlan {
    pub fn build(graph: &GraphNodes) -> Result<Self> {
        let count = graph.nodes.len();
        let mut plan = InsertPlan::default();
        let mut hard: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut soft: Vec<HashSet<usize>> = vec![HashSet::new(); count];

        for node in &graph.nodes {
            for slot in &node.relations {
                let relation = &slot.relation;
                for &child in &slot.children {
                    let target = graph.resolve(child);
                    let target_is_new = graph.nodes[target].source == NodeSource::Insert;
                    match relation.kind() {
                        RelationKind::BelongsToOne => {
                            plan.assignments.push(Assignment {
                                from: target,
                                to: node.index,
                                from_props: relation.related_props().to_vec(),
                                to_props: relation.owner_props().to_vec(),
                            });
                            if target_is_new {
                                hard[node.index].insert(target);
                            }
                        }
                        RelationKind::HasMany => {
                            if target_is_new {
                                plan.assignments.push(Assignment {
                                    from: node.index,
                                    to: target,
                                    from_props: relation.owner_props().to_vec(),
                                    to_props: relation.related_props().to_vec(),
                                });
                                hard[target].insert(node.index);
                            } else {
                                plan.relate_existing.push(RelateExisting {
                                    owner: node.index,
                                    related: target,
                                    relation: relation.clone(),
                                });
                            }
                        }
                        RelationKind::ManyToMany(_) => plan.join_edges.push(JoinEdge {
                            owner: node.index,
                            related: target,
                            extras_from: child,
                            relation: relation.clone(),
                        }),
                    }
                }
            }
            for template in &node.templates {
                for (uid, _) in &template.targets {
                    if let Some(&target) = graph.ids.get(uid) {
                        if target != node.index {
                            soft[node.index].insert(target);
                        }
                    }
                }
            }
        }

        for assignment in &plan.assignments {
            require_db_ref_props(graph, assignment.from, &assignment.from_props)?;
        }
        for edge in &plan.join_edges {
            require_db_ref_props(graph, edge.related, edge.relation.related_props())?;
        }

        plan.order = schedule(graph, &hard, &soft)?;
        Ok(plan)
    }
}

/// A `#dbRef` node only carries its id and extras, so any other key
/// property read from it must have been supplied in the input.
pub(crate) fn require_db_ref_props(graph: &GraphNodes, index: usize, props: &[String]) -> Result<()> {
    let node = &graph.nodes[index];
    if let NodeSource::DbRef(_) = node.source {
        if let Some(prop) = props.iter().find(|prop| !node.data.contains_key(*prop)) {
            return Err(RelationError::invalid_graph(
                &node.path,
                format!("a database reference does not carry \"{}\"", prop),
            ));
        }
    }
    Ok(())
}

/// Kahn's algorithm over the hard edges of insert nodes. Among ready nodes
/// the first in input order whose soft predecessors are done wins,
/// otherwise the first in input order.
fn schedule(graph: &GraphNodes, hard: &[BTreeSet<usize>], soft: &[HashSet<usize>]) -> Result<Vec<usize>> {
    let inserts: Vec<usize> = graph
        .nodes
        .iter()
        .filter(|node| node.source == NodeSource::Insert)
        .map(|node| node.index)
        .collect();

    let mut pending: Vec<usize> = vec![0; graph.nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.nodes.len()];
    for &index in &inserts {
        for &before in &hard[index] {
            pending[index] += 1;
            dependents[before].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = inserts.iter().copied().filter(|&i| pending[i] == 0).collect();
    let mut done = vec![false; graph.nodes.len()];
    let mut order = Vec::with_capacity(inserts.len());

    while !ready.is_empty() {
        let next = ready
            .iter()
            .copied()
            .find(|&i| soft[i].iter().all(|&s| done[s]))
            .or_else(|| ready.iter().next().copied());
        let Some(next) = next else { break };
        ready.remove(&next);
        done[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != inserts.len() {
        let nodes = inserts
            .iter()
            .filter(|&&i| !done[i])
            .map(|&i| graph.nodes[i].label())
            .collect();
        return Err(RelationError::CyclicGraph { nodes });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::relation::RelationBuilder;
    use crate::schema::{EntitySchema, Schema};

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .entity(
                EntitySchema::builder("Person", "persons")
                    .relation(
                        RelationBuilder::belongs_to_one("parent", "Person")
                            .join("persons.parent_id", "persons.id"),
                    )
                    .relation(
                        RelationBuilder::has_many("children", "Person")
                            .join("persons.id", "persons.parent_id"),
                    )
                    .relation(
                        RelationBuilder::belongs_to_one("mentor", "Person")
                            .join("persons.mentor_id", "persons.id"),
                    )
                    .relation(
                        RelationBuilder::many_to_many("movies", "Movie")
                            .join("persons.id", "movies.id")
                            .through("persons_movies.person_id", "persons_movies.movie_id"),
                    )
                    .relation(
                        RelationBuilder::many_to_many("favorites", "Movie")
                            .join("persons.id", "movies.code")
                            .through("favorites.person_id", "favorites.movie_code"),
                    ),
            )
            .entity(EntitySchema::builder("Movie", "movies"))
            .build()
            .unwrap()
    }

    fn plan(graph: Value) -> Result<(GraphNodes, InsertPlan)> {
        let schema = schema();
        let person = schema.entity("Person").unwrap().clone();
        let nodes = GraphNodes::collect(&schema, &person, graph)?;
        let plan = InsertPlan::build(&nodes)?;
        Ok((nodes, plan))
    }

    #[test]
    fn to_one_targets_go_first_and_children_last() {
        let (nodes, plan) = plan(json!({
            "name": "me",
            "children": [{"name": "kid"}],
            "parent": {"name": "dad"}
        }))
        .unwrap();
        let paths: Vec<&str> = plan.order.iter().map(|&i| nodes.nodes[i].path.as_str()).collect();
        assert_eq!(paths, vec!["parent", "", "children[0]"]);
    }

    #[test]
    fn soft_references_reorder_siblings() {
        let (nodes, plan) = plan(json!([
            {"name": "#ref{a.id}"},
            {"#id": "a", "name": "A"}
        ]))
        .unwrap();
        let paths: Vec<&str> = plan.order.iter().map(|&i| nodes.nodes[i].path.as_str()).collect();
        assert_eq!(paths, vec!["[1]", "[0]"]);
    }

    #[test]
    fn mutual_to_one_references_are_a_cycle() {
        let result = plan(json!([
            {"#id": "a", "parent": {"#ref": "b"}},
            {"#id": "b", "mentor": {"#ref": "a"}}
        ]));
        assert!(matches!(result, Err(RelationError::CyclicGraph { .. })));
    }

    #[test]
    fn many_to_many_endpoints_are_unordered() {
        let (_, plan) = plan(json!({
            "name": "me",
            "movies": [{"title": "x", "#id": "m"}, {"#dbRef": 4}]
        }))
        .unwrap();
        assert_eq!(plan.order, vec![0, 1]);
        assert_eq!(plan.join_edges.len(), 2);
        assert!(plan.assignments.is_empty());
    }

    #[test]
    fn join_rows_need_the_related_key_of_database_references() {
        let result = plan(json!({
            "name": "me",
            "favorites": [{"#dbRef": 4}]
        }));
        match result {
            Err(RelationError::InvalidGraph { path, message }) => {
                assert_eq!(path, "favorites[0]");
                assert!(message.contains("\"code\""));
            }
            other => panic!("unexpected result {:?}", other.map(|(_, plan)| plan.order)),
        }

        let (_, plan) = plan(json!({
            "name": "me",
            "favorites": [{"#dbRef": 4, "code": "X1"}]
        }))
        .unwrap();
        assert_eq!(plan.join_edges.len(), 1);
    }
}
