//! Explicit registry of entity types and their declared relations.

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::DatabaseBackend;
use serde_json::Value;

use crate::config::{ColumnNaming, EngineConfig};
use crate::error::{RelationError, Result};
use crate::executor::DialectCapabilities;
use crate::key::CompositeKey;
use crate::query::EntityQuery;
use crate::relation::{Relation, RelationBuilder, OWNER_KEY_PREFIX};
use crate::validation::{AcceptAll, Validator};
use crate::Record;

/// Table and identity columns of an entity, as seen by a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntityInfo {
    pub name: String,
    pub table: String,
    pub id_columns: Vec<String>,
}

#[derive(Debug)]
pub struct EntitySchema {
    info: EntityInfo,
    id_props: Vec<String>,
    naming: ColumnNaming,
    relations: Vec<Arc<Relation>>,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> EntityBuilder {
        EntityBuilder {
            name: name.into(),
            table: table.into(),
            id_columns: vec!["id".to_string()],
            relations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn table(&self) -> &str {
        &self.info.table
    }

    pub fn id_columns(&self) -> &[String] {
        &self.info.id_columns
    }

    pub fn id_props(&self) -> &[String] {
        &self.id_props
    }

    pub fn naming(&self) -> ColumnNaming {
        self.naming
    }

    /// Relations in declaration order.
    pub fn relations(&self) -> &[Arc<Relation>] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&Arc<Relation>> {
        self.relations.iter().find(|r| r.name() == name)
    }

    pub fn try_relation(&self, name: &str) -> Result<&Arc<Relation>> {
        self.relation(name)
            .ok_or_else(|| RelationError::unknown_relation(self.name(), name))
    }

    pub fn id_key(&self, record: &Record) -> CompositeKey {
        CompositeKey::from_record(record, &self.id_props)
    }

    /// Column/value pairs to write for `record`. Relation properties and
    /// engine-internal properties are left out.
    pub fn to_columns(&self, record: &Record) -> Vec<(String, Value)> {
        record
            .iter()
            .filter(|(prop, _)| !prop.starts_with(OWNER_KEY_PREFIX))
            .filter(|(prop, _)| self.relation(prop).is_none())
            .map(|(prop, value)| (self.naming.to_column(prop), value.clone()))
            .collect()
    }

    /// Converts a column-keyed row into a property-keyed record.
    pub fn from_row(&self, row: Record) -> Record {
        row.into_iter()
            .map(|(col, value)| {
                if col.starts_with(OWNER_KEY_PREFIX) {
                    (col, value)
                } else {
                    (self.naming.to_property(&col), value)
                }
            })
            .collect()
    }
}

pub struct EntityBuilder {
    name: String,
    table: String,
    id_columns: Vec<String>,
    relations: Vec<RelationBuilder>,
}

impl EntityBuilder {
    pub fn id_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.id_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn relation(mut self, relation: RelationBuilder) -> Self {
        self.relations.push(relation);
        self
    }
}

pub struct Schema {
    entities: HashMap<String, Arc<EntitySchema>>,
    config: EngineConfig,
    validator: Arc<dyn Validator>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entities.keys().collect();
        names.sort();
        f.debug_struct("Schema")
            .field("entities", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<EntitySchema>> {
        self.entities
            .get(name)
            .ok_or_else(|| RelationError::unknown_entity(name))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }

    pub fn capabilities(&self, backend: DatabaseBackend) -> DialectCapabilities {
        self.config
            .dialect
            .unwrap_or_else(|| DialectCapabilities::for_backend(backend))
    }

    /// A query against the table of `entity`.
    pub fn query(self: &Arc<Self>, entity: &str) -> Result<EntityQuery> {
        let entity = self.entity(entity)?.clone();
        Ok(EntityQuery::new(self.clone(), entity))
    }

    /// A query against the rows related to `owners` through `relation`.
    pub fn related_query(
        self: &Arc<Self>,
        entity: &str,
        relation: &str,
        owners: Vec<Record>,
    ) -> Result<EntityQuery> {
        let relation = self.entity(entity)?.try_relation(relation)?.clone();
        let related = self.entity(relation.related_entity())?.clone();
        Ok(EntityQuery::new(self.clone(), related).bind_relation(relation, owners))
    }
}

#[derive(Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityBuilder>,
    config: Option<EngineConfig>,
    validator: Option<Arc<dyn Validator>>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntityBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: Validator + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn build(self) -> Result<Arc<Schema>> {
        let config = self.config.unwrap_or_default();
        let naming = config.naming;

        let mut infos: HashMap<String, EntityInfo> = HashMap::new();
        for entity in &self.entities {
            if entity.id_columns.is_empty() {
                return Err(RelationError::invalid_relation(
                    &entity.name,
                    "entity must declare at least one id column",
                ));
            }
            let info = EntityInfo {
                name: entity.name.clone(),
                table: entity.table.clone(),
                id_columns: entity.id_columns.clone(),
            };
            if infos.insert(entity.name.clone(), info).is_some() {
                return Err(RelationError::invalid_relation(
                    &entity.name,
                    "entity is registered twice",
                ));
            }
        }

        let mut entities = HashMap::new();
        for entity in self.entities {
            let info = infos[&entity.name].clone();
            let mut relations: Vec<Arc<Relation>> = Vec::new();
            for builder in entity.relations {
                let related = infos
                    .get(builder.related_entity())
                    .ok_or_else(|| {
                        RelationError::invalid_relation(
                            builder.name(),
                            format!("unknown related entity \"{}\"", builder.related_entity()),
                        )
                    })?;
                let relation = builder.build(&info, related, naming)?;
                if relations.iter().any(|r| r.name() == relation.name()) {
                    return Err(RelationError::invalid_relation(
                        relation.name(),
                        format!("declared twice on \"{}\"", info.name),
                    ));
                }
                relations.push(Arc::new(relation));
            }

            let id_props = info
                .id_columns
                .iter()
                .map(|col| naming.to_property(col))
                .collect();
            entities.insert(
                entity.name,
                Arc::new(EntitySchema {
                    info,
                    id_props,
                    naming,
                    relations,
                }),
            );
        }

        Ok(Arc::new(Schema {
            entities,
            config,
            validator: self.validator.unwrap_or_else(|| Arc::new(AcceptAll)),
        }))
    }
}
