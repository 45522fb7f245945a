//! Relation graphs over sea-orm connections: declared relations, relation
//! expressions, eager loading, relation writes and graph insertion.

pub mod config;
pub mod error;
pub mod executor;
pub mod expression;
pub mod filters;
pub mod graph;
pub mod key;
pub mod query;
pub mod relation;
pub mod schema;
pub mod validation;

/// Property-keyed plain data, the in-memory form of every row.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub use config::{ColumnNaming, EngineConfig, GraphMarkers};
pub use error::{ErrorKind, RelationError, Result, ValidationErrors};
pub use executor::{DialectCapabilities, InsertOutcome, SqlStatement, StatementExecutor};
pub use expression::{Recursion, RelationExpression};
pub use filters::{filter, FilterFn, FilterRegistry, PathFilter};
pub use graph::InsertGraphOperation;
pub use key::{normalize_ids, CompositeKey};
pub use query::{EntityQuery, OperationInput, OperationState, QueryContext, QueryOperation, QueryOutput};
pub use relation::{JoinTable, Relation, RelationBuilder, RelationKind};
pub use schema::{EntityBuilder, EntitySchema, Schema, SchemaBuilder};
pub use validation::{AcceptAll, FieldRules, FieldType, ValidationMode, Validator};
