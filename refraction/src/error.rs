use std::collections::BTreeMap;
use std::fmt;

/// Field-level validation failures keyed by property name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    fields: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fields
    }

    /// Prefixes every field with `path`, used when a nested graph node fails.
    pub fn prefixed(self, path: &str) -> Self {
        if path.is_empty() {
            return self;
        }
        let fields = self
            .fields
            .into_iter()
            .map(|(field, messages)| (format!("{}.{}", path, field), messages))
            .collect();
        Self { fields }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}: {}", field, messages.join(", "))?;
        }
        Ok(())
    }
}

/// Coarse classification of a [`RelationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Expression,
    Cardinality,
    Graph,
    Validation,
    Transport,
    Schema,
    Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum RelationError {
    #[error("malformed relation expression `{expression}` at offset {position}: {message}")]
    ExpressionSyntax {
        expression: String,
        position: usize,
        message: String,
    },
    #[error("unknown relation \"{relation}\" for entity \"{entity}\"")]
    UnknownRelation { entity: String, relation: String },
    #[error("could not find filter \"{filter}\" for relation \"{relation}\"")]
    UnknownFilter { relation: String, filter: String },
    #[error("trying to insert an unallowed relation: `{expression}` is not a subset of `{allowed}`")]
    RelationNotAllowed { expression: String, allowed: String },

    #[error("relation \"{relation}\": {message}")]
    Cardinality { relation: String, message: String },
    #[error("invalid identifier list: {message}")]
    InvalidIds { message: String },

    #[error("insert graph contains a dependency cycle between nodes {}", .nodes.join(", "))]
    CyclicGraph { nodes: Vec<String> },
    #[error("could not resolve reference \"{reference}\"")]
    UnresolvedReference { reference: String },
    #[error("duplicate identifier \"{id}\" in insert graph")]
    DuplicateId { id: String },
    #[error("invalid insert graph at `{path}`: {message}")]
    InvalidGraph { path: String, message: String },

    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("unknown entity \"{entity}\"")]
    UnknownEntity { entity: String },
    #[error("invalid relation \"{relation}\": {message}")]
    InvalidRelation { relation: String, message: String },

    #[error("operation \"{operation}\": {message}")]
    InvalidOperation { operation: String, message: String },

    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
}

pub type Result<T> = std::result::Result<T, RelationError>;

impl RelationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelationError::ExpressionSyntax { .. }
            | RelationError::UnknownRelation { .. }
            | RelationError::UnknownFilter { .. }
            | RelationError::RelationNotAllowed { .. } => ErrorKind::Expression,
            RelationError::Cardinality { .. } | RelationError::InvalidIds { .. } => {
                ErrorKind::Cardinality
            }
            RelationError::CyclicGraph { .. }
            | RelationError::UnresolvedReference { .. }
            | RelationError::DuplicateId { .. }
            | RelationError::InvalidGraph { .. } => ErrorKind::Graph,
            RelationError::Validation(_) => ErrorKind::Validation,
            RelationError::UnknownEntity { .. } | RelationError::InvalidRelation { .. } => {
                ErrorKind::Schema
            }
            RelationError::InvalidOperation { .. } => ErrorKind::Usage,
            RelationError::Database(_) => ErrorKind::Transport,
        }
    }

    pub fn unknown_relation(entity: impl Into<String>, relation: impl Into<String>) -> Self {
        Self::UnknownRelation {
            entity: entity.into(),
            relation: relation.into(),
        }
    }

    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity: entity.into(),
        }
    }

    pub fn invalid_relation(relation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRelation {
            relation: relation.into(),
            message: message.into(),
        }
    }

    pub fn cardinality(relation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cardinality {
            relation: relation.into(),
            message: message.into(),
        }
    }

    pub fn invalid_ids(message: impl Into<String>) -> Self {
        Self::InvalidIds {
            message: message.into(),
        }
    }

    pub fn invalid_graph(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidGraph {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<ValidationErrors> for RelationError {
    fn from(errors: ValidationErrors) -> Self {
        RelationError::Validation(errors)
    }
}

impl From<RelationError> for sea_orm::DbErr {
    fn from(err: RelationError) -> Self {
        match err {
            RelationError::Database(inner) => inner,
            other => sea_orm::DbErr::Custom(other.to_string()),
        }
    }
}
