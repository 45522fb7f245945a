#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use refraction::{
    EntitySchema, InsertOutcome, Record, RelationBuilder, Schema, SchemaBuilder, SqlStatement,
    StatementExecutor,
};
use sea_orm::sea_query::{InsertStatement, SelectStatement};
use sea_orm::{
    ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult,
    JsonValue, Statement,
};
use serde_json::Value;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn setup_test_db() -> DatabaseConnection {
    init_logger();
    let db = Database::connect("sqlite::memory:").await.unwrap();

    for sql in [
        "CREATE TABLE persons (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            parent_id INTEGER,
            mentor_id INTEGER
        )",
        "CREATE TABLE animals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            owner_id INTEGER
        )",
        "CREATE TABLE movies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT
        )",
        "CREATE TABLE persons_movies (
            person_id INTEGER NOT NULL,
            movie_id INTEGER NOT NULL,
            character TEXT
        )",
    ] {
        run(&db, sql).await;
    }
    db
}

/// Jen(1) <- Sam(2) <- Lou(4), Jen(1) <- Kim(3); Jen owns Fluffy, Sam owns
/// Rex and Tom; Jen played in Alien and Heat, Sam in Heat.
pub async fn seed(db: &DatabaseConnection) {
    for sql in [
        "INSERT INTO persons (id, name, parent_id) VALUES (1, 'Jen', NULL), (2, 'Sam', 1), (3, 'Kim', 1), (4, 'Lou', 2)",
        "INSERT INTO animals (id, name, owner_id) VALUES (1, 'Fluffy', 1), (2, 'Rex', 2), (3, 'Tom', 2)",
        "INSERT INTO movies (id, title) VALUES (1, 'Alien'), (2, 'Heat')",
        "INSERT INTO persons_movies (person_id, movie_id, character) VALUES (1, 1, 'Ripley'), (1, 2, 'Eady'), (2, 2, 'Cop')",
    ] {
        run(db, sql).await;
    }
}

pub async fn run(db: &DatabaseConnection, sql: &str) {
    ConnectionTrait::execute(db, Statement::from_string(DatabaseBackend::Sqlite, sql.to_string()))
        .await
        .unwrap();
}

pub async fn rows(db: &DatabaseConnection, sql: &str) -> Vec<Value> {
    JsonValue::find_by_statement(Statement::from_string(DatabaseBackend::Sqlite, sql.to_string()))
        .all(db)
        .await
        .unwrap()
}

pub fn schema_builder() -> SchemaBuilder {
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
                    RelationBuilder::has_many("pets", "Animal")
                        .join("persons.id", "animals.owner_id"),
                )
                .relation(
                    RelationBuilder::many_to_many("movies", "Movie")
                        .join("persons.id", "movies.id")
                        .through("persons_movies.person_id", "persons_movies.movie_id")
                        .extra(["character"]),
                )
                .relation(
                    RelationBuilder::belongs_to_one("mentor", "Person")
                        .join("persons.mentor_id", "persons.id"),
                ),
        )
        .entity(
            EntitySchema::builder("Animal", "animals").relation(
                RelationBuilder::belongs_to_one("owner", "Person")
                    .join("animals.owner_id", "persons.id"),
            ),
        )
        .entity(
            EntitySchema::builder("Movie", "movies").relation(
                RelationBuilder::many_to_many("actors", "Person")
                    .join("movies.id", "persons.id")
                    .through("persons_movies.movie_id", "persons_movies.person_id")
                    .extra(["character"]),
            ),
        )
}

pub fn test_schema() -> Arc<Schema> {
    schema_builder().build().unwrap()
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

/// Values of `prop` across an array of objects.
pub fn pluck<'a>(value: &'a Value, prop: &str) -> Vec<&'a Value> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|item| &item[prop])
        .collect()
}

pub fn names(value: &Value) -> Vec<String> {
    let mut names: Vec<String> = pluck(value, "name")
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    names.sort();
    names
}

/// Counts every statement passed to the wrapped connection.
pub struct CountingExecutor {
    pub db: DatabaseConnection,
    count: AtomicUsize,
}

impl CountingExecutor {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatementExecutor for CountingExecutor {
    fn backend(&self) -> DatabaseBackend {
        self.db.get_database_backend()
    }

    async fn fetch(&self, stmt: SelectStatement) -> Result<Vec<Record>, DbErr> {
        self.count.fetch_add(1, Ordering::SeqCst);
        StatementExecutor::fetch(&self.db, stmt).await
    }

    async fn insert(&self, stmt: InsertStatement, returning: bool) -> Result<InsertOutcome, DbErr> {
        self.count.fetch_add(1, Ordering::SeqCst);
        StatementExecutor::insert(&self.db, stmt, returning).await
    }

    async fn execute(&self, stmt: SqlStatement) -> Result<u64, DbErr> {
        self.count.fetch_add(1, Ordering::SeqCst);
        StatementExecutor::execute(&self.db, stmt).await
    }
}
