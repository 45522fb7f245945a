//! Flattening an input graph into nodes.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::config::GraphMarkers;
use crate::error::{RelationError, Result};
use crate::key::{normalize_ids, CompositeKey};
use crate::relation::{Relation, RelationKind};
use crate::schema::{EntitySchema, Schema};
use crate::Record;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeSource {
    /// A new row.
    Insert,
    /// An existing row identified by primary key.
    DbRef(CompositeKey),
    /// The node declared with this `#id`.
    Ref(String),
}

#[derive(Debug)]
pub(crate) struct RelationSlot {
    pub relation: Arc<Relation>,
    pub children: Vec<usize>,
    pub to_many: bool,
}

/// A `#ref{id.prop}` placeholder found in a property value.
#[derive(Debug, Clone)]
pub(crate) struct Template {
    pub prop: String,
    pub text: String,
    pub targets: Vec<(String, String)>,
}

#[derive(Debug)]
pub(crate) struct GraphNode {
    pub index: usize,
    pub entity: Arc<EntitySchema>,
    pub path: String,
    pub uid: Option<String>,
    pub source: NodeSource,
    /// Scalar properties; after insertion also everything the database
    /// assigned.
    pub data: Record,
    pub relations: Vec<RelationSlot>,
    pub templates: Vec<Template>,
    pub inserted: bool,
}

impl GraphNode {
    /// Whether the row exists in the database, so its keys can be read.
    pub fn has_identity(&self) -> bool {
        match self.source {
            NodeSource::Insert => self.inserted,
            NodeSource::DbRef(_) => true,
            NodeSource::Ref(_) => false,
        }
    }

    pub fn label(&self) -> String {
        match &self.uid {
            Some(uid) => format!("{} ({})", display_path(&self.path), uid),
            None => display_path(&self.path).to_string(),
        }
    }
}

pub(crate) fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "<root>"
    } else {
        path
    }
}

pub(crate) fn template_regex(markers: &GraphMarkers) -> Result<Regex> {
    let pattern = format!(r"{}\{{([^.{{}}]+)\.([^{{}}]+)\}}", regex::escape(&markers.reference));
    Regex::new(&pattern)
        .map_err(|e| RelationError::invalid_operation("insert_graph", e.to_string()))
}

/// Nodes in pre-order plus the roots of the input.
#[derive(Debug)]
pub(crate) struct GraphNodes {
    pub nodes: Vec<GraphNode>,
    pub roots: Vec<usize>,
    pub ids: HashMap<String, usize>,
}

impl GraphNodes {
    pub fn collect(schema: &Schema, entity: &Arc<EntitySchema>, graph: Value) -> Result<Self> {
        let markers = schema.config().markers.clone();
        let mut collector = Collector {
            schema,
            templates: template_regex(&markers)?,
            markers,
            nodes: Vec::new(),
            ids: HashMap::new(),
        };

        let roots = match graph {
            Value::Object(record) => vec![collector.node(entity, record, String::new())?],
            Value::Array(items) => {
                let mut roots = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let path = format!("[{}]", i);
                    match item {
                        Value::Object(record) => roots.push(collector.node(entity, record, path)?),
                        _ => {
                            return Err(RelationError::invalid_graph(
                                path,
                                "expected an object",
                            ))
                        }
                    }
                }
                roots
            }
            _ => {
                return Err(RelationError::invalid_graph(
                    "<root>",
                    "expected an object or an array of objects",
                ))
            }
        };

        for node in &collector.nodes {
            if let NodeSource::Ref(uid) = &node.source {
                if !collector.ids.contains_key(uid) {
                    return Err(RelationError::UnresolvedReference {
                        reference: uid.clone(),
                    });
                }
            }
            for template in &node.templates {
                for (uid, _) in &template.targets {
                    if !collector.ids.contains_key(uid) {
                        return Err(RelationError::UnresolvedReference {
                            reference: template.text.clone(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            nodes: collector.nodes,
            roots,
            ids: collector.ids,
        })
    }

    /// The inserted node a node stands for: itself, or the target of a
    /// `#ref` object.
    pub fn resolve(&self, index: usize) -> usize {
        match &self.nodes[index].source {
            NodeSource::Ref(uid) => self.ids.get(uid).copied().unwrap_or(index),
            _ => index,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

struct Collector<'a> {
    schema: &'a Schema,
    markers: GraphMarkers,
    templates: Regex,
    nodes: Vec<GraphNode>,
    ids: HashMap<String, usize>,
}

impl Collector<'_> {
    fn node(&mut self, entity: &Arc<EntitySchema>, mut record: Record, path: String) -> Result<usize> {
        let index = self.nodes.len();

        if let Some(reference) = record.remove(&self.markers.reference) {
            let uid = marker_string(&reference).ok_or_else(|| {
                RelationError::invalid_graph(&path, "reference must be a string")
            })?;
            self.reject_relations(entity, &record, &path)?;
            self.nodes.push(GraphNode {
                index,
                entity: entity.clone(),
                path,
                uid: None,
                source: NodeSource::Ref(uid),
                data: record,
                relations: Vec::new(),
                templates: Vec::new(),
                inserted: false,
            });
            return Ok(index);
        }

        if let Some(db_ref) = record.remove(&self.markers.db_ref) {
            let key = match normalize_ids(&db_ref, entity.id_props())?.as_slice() {
                [key] => key.clone(),
                _ => {
                    return Err(RelationError::invalid_graph(
                        &path,
                        "a database reference must identify exactly one row",
                    ))
                }
            };
            self.reject_relations(entity, &record, &path)?;
            let mut data = record;
            key.assign(&mut data, entity.id_props());
            self.nodes.push(GraphNode {
                index,
                entity: entity.clone(),
                path,
                uid: None,
                source: NodeSource::DbRef(key),
                data,
                relations: Vec::new(),
                templates: Vec::new(),
                inserted: false,
            });
            return Ok(index);
        }

        let uid = match record.remove(&self.markers.id) {
            Some(value) => {
                let uid = marker_string(&value)
                    .ok_or_else(|| RelationError::invalid_graph(&path, "id must be a string"))?;
                if self.ids.insert(uid.clone(), index).is_some() {
                    return Err(RelationError::DuplicateId { id: uid });
                }
                Some(uid)
            }
            None => None,
        };

        self.nodes.push(GraphNode {
            index,
            entity: entity.clone(),
            path: path.clone(),
            uid,
            source: NodeSource::Insert,
            data: Record::new(),
            relations: Vec::new(),
            templates: Vec::new(),
            inserted: false,
        });

        let mut data = Record::new();
        let mut relations = Vec::new();
        let mut templates = Vec::new();
        for (prop, value) in record {
            if let Some(relation) = entity.relation(&prop) {
                relations.push(self.slot(relation.clone(), value, &path)?);
                continue;
            }
            if let Value::String(text) = &value {
                let targets: Vec<(String, String)> = self
                    .templates
                    .captures_iter(text)
                    .map(|caps| (caps[1].to_string(), caps[2].to_string()))
                    .collect();
                if !targets.is_empty() {
                    templates.push(Template {
                        prop,
                        text: text.clone(),
                        targets,
                    });
                    continue;
                }
            }
            data.insert(prop, value);
        }

        let node = &mut self.nodes[index];
        node.data = data;
        node.relations = relations;
        node.templates = templates;
        Ok(index)
    }

    fn slot(&mut self, relation: Arc<Relation>, value: Value, owner_path: &str) -> Result<RelationSlot> {
        let path = join_path(owner_path, relation.name());
        let related = self.schema.entity(relation.related_entity())?.clone();
        let to_many = !matches!(relation.kind(), RelationKind::BelongsToOne);

        let items = match (value, to_many) {
            (Value::Null, _) => Vec::new(),
            (Value::Object(record), false) => vec![(record, path.clone())],
            (Value::Array(_), false) => {
                return Err(RelationError::invalid_graph(
                    &path,
                    "a to-one relation takes a single object",
                ))
            }
            (Value::Object(record), true) => vec![(record, format!("{}[0]", path))],
            (Value::Array(items), true) => {
                let mut records = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let item_path = format!("{}[{}]", path, i);
                    match item {
                        Value::Object(record) => records.push((record, item_path)),
                        _ => return Err(RelationError::invalid_graph(item_path, "expected an object")),
                    }
                }
                records
            }
            (_, _) => {
                return Err(RelationError::invalid_graph(
                    &path,
                    "relation value must be an object, an array or null",
                ))
            }
        };

        let mut children = Vec::with_capacity(items.len());
        for (record, item_path) in items {
            children.push(self.node(&related, record, item_path)?);
        }
        Ok(RelationSlot {
            relation,
            children,
            to_many,
        })
    }

    fn reject_relations(&self, entity: &EntitySchema, record: &Record, path: &str) -> Result<()> {
        match record.keys().find(|prop| entity.relation(prop).is_some()) {
            Some(prop) => Err(RelationError::invalid_graph(
                path,
                format!("a reference cannot carry relation \"{}\"", prop),
            )),
            None => Ok(()),
        }
    }
}

fn marker_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn join_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::relation::RelationBuilder;

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .entity(
                EntitySchema::builder("Person", "persons")
                    .relation(
                        RelationBuilder::has_many("pets", "Animal").join("persons.id", "animals.owner_id"),
                    )
                    .relation(
                        RelationBuilder::belongs_to_one("parent", "Person")
                            .join("persons.parent_id", "persons.id"),
                    ),
            )
            .entity(EntitySchema::builder("Animal", "animals"))
            .build()
            .unwrap()
    }

    #[test]
    fn nodes_are_collected_in_pre_order() {
        let schema = schema();
        let person = schema.entity("Person").unwrap().clone();
        let graph = GraphNodes::collect(
            &schema,
            &person,
            json!({
                "name": "Jen",
                "parent": {"name": "Sr"},
                "pets": [{"name": "Fluffy"}, {"#ref": "x"}],
                "#id": "x"
            }),
        )
        .unwrap();

        let paths: Vec<&str> = graph.nodes.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["", "parent", "pets[0]", "pets[1]"]);
        assert_eq!(graph.ids["x"], 0);
        assert_eq!(graph.resolve(3), 0);
        assert_eq!(graph.nodes[0].data, json!({"name": "Jen"}).as_object().cloned().unwrap());
    }

    #[test]
    fn templates_are_split_from_data() {
        let schema = schema();
        let person = schema.entity("Person").unwrap().clone();
        let graph = GraphNodes::collect(
            &schema,
            &person,
            json!([{"#id": "a", "name": "A"}, {"name": "copy of #ref{a.name}"}]),
        )
        .unwrap();
        assert_eq!(graph.roots, vec![0, 1]);
        let template = &graph.nodes[1].templates[0];
        assert_eq!(template.prop, "name");
        assert_eq!(template.targets, vec![("a".to_string(), "name".to_string())]);
        assert!(!graph.nodes[1].data.contains_key("name"));
    }

    #[test]
    fn malformed_graphs_fail() {
        let schema = schema();
        let person = schema.entity("Person").unwrap().clone();
        let duplicate = GraphNodes::collect(&schema, &person, json!([{"#id": "a"}, {"#id": "a"}]));
        assert!(matches!(duplicate, Err(RelationError::DuplicateId { .. })));

        let dangling = GraphNodes::collect(&schema, &person, json!({"name": "#ref{nope.id}"}));
        assert!(matches!(dangling, Err(RelationError::UnresolvedReference { .. })));

        let to_one_array = GraphNodes::collect(&schema, &person, json!({"parent": [{}]}));
        assert!(matches!(to_one_array, Err(RelationError::InvalidGraph { .. })));

        let ref_with_relation =
            GraphNodes::collect(&schema, &person, json!({"#id": "a", "parent": {"#ref": "a", "pets": []}}));
        assert!(matches!(ref_with_relation, Err(RelationError::InvalidGraph { .. })));
    }
}
