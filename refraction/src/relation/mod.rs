//! Declared relations between entity types.
//!
//! A relation is one of three kinds fixed at schema build time. Code that
//! needs a kind-specific SQL shape matches on [`RelationKind`].

mod join_table;
mod operations;

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::OnceCell;
use serde_json::Value;

pub use join_table::JoinTable;
pub use operations::{
    FindOperation, RelateOperation, RelatedDeleteOperation, RelatedInsertOperation,
    RelatedUpdateOperation, UnrelateOperation,
};

use crate::config::ColumnNaming;
use crate::error::{RelationError, Result};
use crate::filters::{filter, FilterFn};
use crate::key::CompositeKey;
use crate::schema::EntityInfo;
use crate::Record;

/// Prefix of the owner-key columns a many-to-many find selects from the
/// join table. Properties with this prefix never reach the database.
pub(crate) const OWNER_KEY_PREFIX: &str = "__owner_key_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// The owner row holds the foreign key.
    BelongsToOne,
    /// The related rows hold the foreign key.
    HasMany,
    ManyToMany(JoinTable),
}

impl RelationKind {
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::BelongsToOne => "BelongsToOneRelation",
            RelationKind::HasMany => "HasManyRelation",
            RelationKind::ManyToMany(_) => "ManyToManyRelation",
        }
    }
}

#[derive(Debug)]
struct RelationProps {
    owner: Vec<String>,
    related: Vec<String>,
    owner_id: Vec<String>,
    related_id: Vec<String>,
    owner_key_aliases: Vec<String>,
}

pub struct Relation {
    name: String,
    owner: EntityInfo,
    related: EntityInfo,
    owner_columns: Vec<String>,
    related_columns: Vec<String>,
    kind: RelationKind,
    modifier: Option<FilterFn>,
    naming: ColumnNaming,
    props: OnceCell<RelationProps>,
    join_table_alias: OnceCell<String>,
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("owner", &self.owner.name)
            .field("related", &self.related.name)
            .field("owner_columns", &self.owner_columns)
            .field("related_columns", &self.related_columns)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Relation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RelationKind {
        &self.kind
    }

    pub fn is_one_to_one(&self) -> bool {
        matches!(self.kind, RelationKind::BelongsToOne)
    }

    pub fn owner_entity(&self) -> &str {
        &self.owner.name
    }

    pub fn related_entity(&self) -> &str {
        &self.related.name
    }

    pub fn owner_table(&self) -> &str {
        &self.owner.table
    }

    pub fn related_table(&self) -> &str {
        &self.related.table
    }

    /// Columns of the owner table that identify the related rows.
    pub fn owner_columns(&self) -> &[String] {
        &self.owner_columns
    }

    /// Columns of the related table matched against [`owner_columns`](Self::owner_columns).
    pub fn related_columns(&self) -> &[String] {
        &self.related_columns
    }

    pub fn owner_id_columns(&self) -> &[String] {
        &self.owner.id_columns
    }

    pub fn related_id_columns(&self) -> &[String] {
        &self.related.id_columns
    }

    pub fn join_table(&self) -> Option<&JoinTable> {
        match &self.kind {
            RelationKind::ManyToMany(join_table) => Some(join_table),
            _ => None,
        }
    }

    pub fn modifier(&self) -> Option<&FilterFn> {
        self.modifier.as_ref()
    }

    pub fn naming(&self) -> ColumnNaming {
        self.naming
    }

    fn props(&self) -> &RelationProps {
        self.props.get_or_init(|| {
            let to_props = |cols: &[String]| -> Vec<String> {
                cols.iter().map(|col| self.naming.to_property(col)).collect()
            };
            RelationProps {
                owner: to_props(&self.owner_columns),
                related: to_props(&self.related_columns),
                owner_id: to_props(&self.owner.id_columns),
                related_id: to_props(&self.related.id_columns),
                owner_key_aliases: (0..self.owner_columns.len())
                    .map(|i| format!("{}{}", OWNER_KEY_PREFIX, i))
                    .collect(),
            }
        })
    }

    pub fn owner_props(&self) -> &[String] {
        &self.props().owner
    }

    pub fn related_props(&self) -> &[String] {
        &self.props().related
    }

    pub fn owner_id_props(&self) -> &[String] {
        &self.props().owner_id
    }

    pub fn related_id_props(&self) -> &[String] {
        &self.props().related_id
    }

    pub(crate) fn owner_key_aliases(&self) -> &[String] {
        &self.props().owner_key_aliases
    }

    /// `<join table>_rel_<relation>`, the alias of the join table in finds.
    pub fn join_table_alias(&self) -> Option<&str> {
        let join_table = self.join_table()?;
        Some(
            self.join_table_alias
                .get_or_init(|| format!("{}_rel_{}", join_table.table(), self.name))
                .as_str(),
        )
    }

    pub fn owner_key(&self, owner: &Record) -> CompositeKey {
        CompositeKey::from_record(owner, self.owner_props())
    }

    pub fn owner_id(&self, owner: &Record) -> CompositeKey {
        CompositeKey::from_record(owner, self.owner_id_props())
    }

    pub fn related_key(&self, related: &Record) -> CompositeKey {
        CompositeKey::from_record(related, self.related_props())
    }

    fn owner_key_of_found_row(&self, row: &Record) -> CompositeKey {
        CompositeKey::from_record(row, self.owner_key_aliases())
    }

    /// Sets the relation property of every owner from rows returned by a
    /// find of this relation, matching on key tuples.
    pub fn attach(&self, owners: &mut [Record], related: Vec<Record>) {
        match &self.kind {
            RelationKind::BelongsToOne => {
                let mut by_key: HashMap<CompositeKey, Record> = HashMap::new();
                for row in related {
                    by_key.entry(self.related_key(&row)).or_insert(row);
                }
                for owner in owners.iter_mut() {
                    let key = self.owner_key(owner);
                    let value = if key.has_null() {
                        Value::Null
                    } else {
                        by_key
                            .get(&key)
                            .cloned()
                            .map(Value::Object)
                            .unwrap_or(Value::Null)
                    };
                    owner.insert(self.name.clone(), value);
                }
            }
            RelationKind::HasMany => {
                let groups = group_rows(related, |row| self.related_key(row));
                self.attach_groups(owners, groups);
            }
            RelationKind::ManyToMany(_) => {
                let aliases = self.owner_key_aliases();
                let groups = group_rows(related, |row| self.owner_key_of_found_row(row))
                    .into_iter()
                    .map(|(key, rows)| {
                        let rows = rows
                            .into_iter()
                            .map(|mut row| {
                                for alias in aliases {
                                    row.remove(alias);
                                }
                                row
                            })
                            .collect();
                        (key, rows)
                    })
                    .collect();
                self.attach_groups(owners, groups);
            }
        }
    }

    fn attach_groups(&self, owners: &mut [Record], groups: HashMap<CompositeKey, Vec<Record>>) {
        for owner in owners.iter_mut() {
            let rows = groups
                .get(&self.owner_key(owner))
                .cloned()
                .unwrap_or_default();
            owner.insert(
                self.name.clone(),
                Value::Array(rows.into_iter().map(Value::Object).collect()),
            );
        }
    }
}

fn group_rows<F>(rows: Vec<Record>, key: F) -> HashMap<CompositeKey, Vec<Record>>
where
    F: Fn(&Record) -> CompositeKey,
{
    let mut groups: HashMap<CompositeKey, Vec<Record>> = HashMap::new();
    for row in rows {
        groups.entry(key(&row)).or_default().push(row);
    }
    groups
}

/// `table.column` references, possibly composite.
#[derive(Debug, Clone, Default)]
pub struct ColumnRefs(Vec<String>);

impl From<&str> for ColumnRefs {
    fn from(reference: &str) -> Self {
        Self(vec![reference.to_string()])
    }
}

impl From<String> for ColumnRefs {
    fn from(reference: String) -> Self {
        Self(vec![reference])
    }
}

impl<const N: usize> From<[&str; N]> for ColumnRefs {
    fn from(references: [&str; N]) -> Self {
        Self(references.iter().map(|r| r.to_string()).collect())
    }
}

impl From<Vec<String>> for ColumnRefs {
    fn from(references: Vec<String>) -> Self {
        Self(references)
    }
}

struct ParsedRefs {
    table: String,
    columns: Vec<String>,
}

fn parse_refs(relation: &str, what: &str, refs: &ColumnRefs) -> Result<ParsedRefs> {
    let mut table: Option<String> = None;
    let mut columns = Vec::with_capacity(refs.0.len());
    for reference in &refs.0 {
        let (t, column) = reference.rsplit_once('.').ok_or_else(|| {
            RelationError::invalid_relation(
                relation,
                format!("{} must have format Table.column, got \"{}\"", what, reference),
            )
        })?;
        if t.is_empty() || column.is_empty() {
            return Err(RelationError::invalid_relation(
                relation,
                format!("{} must have format Table.column, got \"{}\"", what, reference),
            ));
        }
        match &table {
            Some(existing) if existing != t => {
                return Err(RelationError::invalid_relation(
                    relation,
                    format!("{} references more than one table", what),
                ))
            }
            Some(_) => {}
            None => table = Some(t.to_string()),
        }
        columns.push(column.to_string());
    }
    match table {
        Some(table) => Ok(ParsedRefs { table, columns }),
        None => Err(RelationError::invalid_relation(
            relation,
            format!("{} is empty", what),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclaredKind {
    BelongsToOne,
    HasMany,
    ManyToMany,
}

/// Declaration of a relation, resolved against the registry by
/// [`SchemaBuilder::build`](crate::schema::SchemaBuilder::build).
#[derive(Clone)]
pub struct RelationBuilder {
    name: String,
    related: String,
    kind: DeclaredKind,
    from: ColumnRefs,
    to: ColumnRefs,
    through: Option<(ColumnRefs, ColumnRefs)>,
    extra: Vec<String>,
    modifier: Option<FilterFn>,
}

impl RelationBuilder {
    fn new(name: impl Into<String>, related: impl Into<String>, kind: DeclaredKind) -> Self {
        Self {
            name: name.into(),
            related: related.into(),
            kind,
            from: ColumnRefs::default(),
            to: ColumnRefs::default(),
            through: None,
            extra: Vec::new(),
            modifier: None,
        }
    }

    pub fn belongs_to_one(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, related, DeclaredKind::BelongsToOne)
    }

    pub fn has_many(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, related, DeclaredKind::HasMany)
    }

    pub fn many_to_many(name: impl Into<String>, related: impl Into<String>) -> Self {
        Self::new(name, related, DeclaredKind::ManyToMany)
    }

    /// Owner and related column references. Sides are told apart by table
    /// name, so `from` is the owner side when both name the same table.
    pub fn join(mut self, from: impl Into<ColumnRefs>, to: impl Into<ColumnRefs>) -> Self {
        self.from = from.into();
        self.to = to.into();
        self
    }

    /// Join-table column references of a many-to-many relation.
    pub fn through(mut self, from: impl Into<ColumnRefs>, to: impl Into<ColumnRefs>) -> Self {
        self.through = Some((from.into(), to.into()));
        self
    }

    /// Join-table columns carried on the related rows.
    pub fn extra<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Filter applied to every find of this relation.
    pub fn modify<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut sea_orm::sea_query::SelectStatement) + Send + Sync + 'static,
    {
        self.modifier = Some(filter(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn related_entity(&self) -> &str {
        &self.related
    }

    pub(crate) fn build(
        self,
        owner: &EntityInfo,
        related: &EntityInfo,
        naming: ColumnNaming,
    ) -> Result<Relation> {
        let name = self.name.as_str();
        let from = parse_refs(name, "join.from", &self.from)?;
        let to = parse_refs(name, "join.to", &self.to)?;

        let from_is_owner = from.table == owner.table;
        let (owner_side, related_side) = if from_is_owner {
            (from, to)
        } else if to.table == owner.table {
            (to, from)
        } else {
            return Err(RelationError::invalid_relation(
                name,
                format!("join must reference the owner table \"{}\"", owner.table),
            ));
        };
        if related_side.table != related.table {
            return Err(RelationError::invalid_relation(
                name,
                format!("join must reference the related table \"{}\"", related.table),
            ));
        }

        let kind = match self.kind {
            DeclaredKind::BelongsToOne | DeclaredKind::HasMany => {
                if self.through.is_some() {
                    return Err(RelationError::invalid_relation(
                        name,
                        "only many-to-many relations have a join table",
                    ));
                }
                if owner_side.columns.len() != related_side.columns.len() {
                    return Err(RelationError::invalid_relation(
                        name,
                        "owner and related column counts differ",
                    ));
                }
                if self.kind == DeclaredKind::BelongsToOne {
                    RelationKind::BelongsToOne
                } else {
                    RelationKind::HasMany
                }
            }
            DeclaredKind::ManyToMany => {
                let (through_from, through_to) = self.through.as_ref().ok_or_else(|| {
                    RelationError::invalid_relation(
                        name,
                        "join must have `through` that describes the join table",
                    )
                })?;
                let through_from = parse_refs(name, "join.through.from", through_from)?;
                let through_to = parse_refs(name, "join.through.to", through_to)?;
                if through_from.table != through_to.table {
                    return Err(RelationError::invalid_relation(
                        name,
                        "join.through `from` and `to` must point to the same join table",
                    ));
                }
                let (jt_owner, jt_related) = if from_is_owner {
                    (through_from.columns, through_to.columns)
                } else {
                    (through_to.columns, through_from.columns)
                };
                if jt_owner.len() != owner_side.columns.len()
                    || jt_related.len() != related_side.columns.len()
                {
                    return Err(RelationError::invalid_relation(
                        name,
                        "join table column counts do not match the joined columns",
                    ));
                }
                RelationKind::ManyToMany(JoinTable {
                    table: through_from.table,
                    owner_columns: jt_owner,
                    related_columns: jt_related,
                    extra_columns: self.extra.clone(),
                })
            }
        };

        Ok(Relation {
            name: self.name,
            owner: owner.clone(),
            related: related.clone(),
            owner_columns: owner_side.columns,
            related_columns: related_side.columns,
            kind,
            modifier: self.modifier,
            naming,
            props: OnceCell::new(),
            join_table_alias: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn info(name: &str, table: &str) -> EntityInfo {
        EntityInfo {
            name: name.into(),
            table: table.into(),
            id_columns: vec!["id".into()],
        }
    }

    fn records(value: Value) -> Vec<Record> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn join_sides_are_resolved_from_table_names() {
        let relation = RelationBuilder::belongs_to_one("owner", "Person")
            .join("persons.id", "animals.owner_id")
            .build(&info("Animal", "animals"), &info("Person", "persons"), ColumnNaming::SnakeCase)
            .unwrap();
        assert_eq!(relation.owner_columns(), &["owner_id".to_string()]);
        assert_eq!(relation.related_columns(), &["id".to_string()]);
        assert_eq!(relation.owner_props(), &["ownerId".to_string()]);
    }

    #[test]
    fn invalid_declarations_fail() {
        let person = info("Person", "persons");
        let movie = info("Movie", "movies");
        let split = RelationBuilder::many_to_many("movies", "Movie")
            .join("persons.id", "movies.id")
            .through("persons_movies.person_id", "movies_persons.movie_id")
            .build(&person, &movie, ColumnNaming::Preserve);
        assert!(matches!(split, Err(RelationError::InvalidRelation { .. })));

        let arity = RelationBuilder::has_many("pets", "Movie")
            .join(["persons.id", "persons.x"], "movies.owner_id")
            .build(&person, &movie, ColumnNaming::Preserve);
        assert!(arity.is_err());

        let no_through = RelationBuilder::many_to_many("movies", "Movie")
            .join("persons.id", "movies.id")
            .build(&person, &movie, ColumnNaming::Preserve);
        assert!(no_through.is_err());
    }

    #[test]
    fn join_table_alias_is_memoized() {
        let relation = RelationBuilder::many_to_many("movies", "Movie")
            .join("persons.id", "movies.id")
            .through("persons_movies.person_id", "persons_movies.movie_id")
            .build(&info("Person", "persons"), &info("Movie", "movies"), ColumnNaming::Preserve)
            .unwrap();
        let first = relation.join_table_alias().unwrap().as_ptr();
        assert_eq!(relation.join_table_alias(), Some("persons_movies_rel_movies"));
        assert_eq!(relation.join_table_alias().unwrap().as_ptr(), first);
    }

    #[test]
    fn has_many_attach_keeps_related_order() {
        let relation = RelationBuilder::has_many("pets", "Animal")
            .join("persons.id", "animals.owner_id")
            .build(&info("Person", "persons"), &info("Animal", "animals"), ColumnNaming::Preserve)
            .unwrap();
        let mut owners = records(json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        let related = records(json!([
            {"owner_id": 1, "v": "a"},
            {"owner_id": 2, "v": "b"},
            {"owner_id": 2, "v": "c"}
        ]));
        relation.attach(&mut owners, related);

        assert_eq!(owners[0]["pets"], json!([{"owner_id": 1, "v": "a"}]));
        assert_eq!(
            owners[1]["pets"],
            json!([{"owner_id": 2, "v": "b"}, {"owner_id": 2, "v": "c"}])
        );
        assert_eq!(owners[2]["pets"], json!([]));
    }

    #[test]
    fn belongs_to_one_attach_sets_null_when_missing() {
        let relation = RelationBuilder::belongs_to_one("owner", "Person")
            .join("animals.owner_id", "persons.id")
            .build(&info("Animal", "animals"), &info("Person", "persons"), ColumnNaming::Preserve)
            .unwrap();
        let mut owners = records(json!([{"id": 1, "owner_id": 5}, {"id": 2, "owner_id": null}, {"id": 3, "owner_id": 6}]));
        relation.attach(&mut owners, records(json!([{"id": 5, "name": "Jen"}])));
        assert_eq!(owners[0]["owner"], json!({"id": 5, "name": "Jen"}));
        assert_eq!(owners[1]["owner"], Value::Null);
        assert_eq!(owners[2]["owner"], Value::Null);
    }
}
