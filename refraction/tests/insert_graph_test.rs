mod helpers;

use refraction::{FieldRules, QueryOutput, RelationError};
use serde_json::{json, Value};

use helpers::{record, rows, schema_builder, seed, setup_test_db, test_schema, CountingExecutor};

#[tokio::test]
async fn nested_graph_is_written_parents_first() {
    let db = setup_test_db().await;
    let schema = test_schema();

    let inserted = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({
            "name": "Ann",
            "parent": {"name": "Old"},
            "pets": [{"name": "Kit"}]
        }))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    let ann = &inserted[0];
    assert_eq!(ann["id"], json!(2));
    assert_eq!(ann["parent_id"], json!(1));
    assert_eq!(ann["parent"]["id"], json!(1));
    assert_eq!(ann["pets"][0]["owner_id"], json!(2));
    assert_eq!(
        rows(&db, "SELECT id, name, parent_id FROM persons ORDER BY id").await,
        vec![
            json!({"id": 1, "name": "Old", "parent_id": null}),
            json!({"id": 2, "name": "Ann", "parent_id": 1}),
        ]
    );
    assert_eq!(
        rows(&db, "SELECT name, owner_id FROM animals").await,
        vec![json!({"name": "Kit", "owner_id": 2})]
    );
}

#[tokio::test]
async fn references_resolve_forward_across_siblings() {
    let db = setup_test_db().await;
    let schema = test_schema();

    let inserted = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!([
            {"name": "Bob", "mentor": {"#ref": "a"}},
            {"#id": "a", "name": "Ann"}
        ]))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    assert_eq!(inserted.len(), 2);
    assert_eq!(inserted[0]["name"], json!("Bob"));
    assert_eq!(inserted[0]["mentor_id"], json!(1));
    assert_eq!(inserted[0]["mentor"]["name"], json!("Ann"));
    assert!(inserted[1].get("#id").is_none());
    assert_eq!(
        rows(&db, "SELECT id, name, mentor_id FROM persons ORDER BY id").await,
        vec![
            json!({"id": 1, "name": "Ann", "mentor_id": null}),
            json!({"id": 2, "name": "Bob", "mentor_id": 1}),
        ]
    );
}

#[tokio::test]
async fn property_templates_take_inserted_values() {
    let db = setup_test_db().await;
    let schema = test_schema();

    schema
        .query("Person")
        .unwrap()
        .insert_graph(json!([
            {"name": "Copy of #ref{a.name}", "mentor_id": "#ref{a.id}"},
            {"#id": "a", "name": "Ann"}
        ]))
        .unwrap()
        .execute(&db)
        .await
        .unwrap();

    assert_eq!(
        rows(&db, "SELECT id, name, mentor_id FROM persons ORDER BY id").await,
        vec![
            json!({"id": 1, "name": "Ann", "mentor_id": null}),
            json!({"id": 2, "name": "Copy of Ann", "mentor_id": 1}),
        ]
    );
}

#[tokio::test]
async fn templates_on_earlier_nodes_are_patched_afterwards() {
    let db = setup_test_db().await;
    let schema = test_schema();

    let inserted = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({
            "name": "Parent of #ref{c.name}",
            "children": [{"#id": "c", "name": "Kid"}]
        }))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    assert_eq!(inserted[0]["name"], json!("Parent of Kid"));
    assert_eq!(
        rows(&db, "SELECT name, parent_id FROM persons ORDER BY id").await,
        vec![
            json!({"name": "Parent of Kid", "parent_id": null}),
            json!({"name": "Kid", "parent_id": 1}),
        ]
    );
}

#[tokio::test]
async fn dependency_cycles_fail_before_any_insert() {
    let db = setup_test_db().await;
    let schema = test_schema();
    let executor = CountingExecutor::new(db);

    let result = schema.query("Person").unwrap().insert_graph(json!({
        "#id": "p",
        "name": "Ann",
        "parent": {"name": "Bob", "mentor": {"#ref": "p"}}
    }));
    match result {
        Err(RelationError::CyclicGraph { nodes }) => assert_eq!(nodes.len(), 2),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("cyclic graph must be rejected"),
    }
    assert_eq!(executor.count(), 0);
}

#[tokio::test]
async fn many_to_many_extras_go_to_the_join_table() {
    let db = setup_test_db().await;
    let schema = test_schema();

    let inserted = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({
            "name": "Ann",
            "movies": [
                {"title": "Alien", "character": "Ripley"},
                {"title": "Heat", "character": "Eady"}
            ]
        }))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    assert_eq!(inserted[0]["movies"][0]["character"], json!("Ripley"));
    assert_eq!(
        rows(&db, "SELECT * FROM persons_movies ORDER BY movie_id").await,
        vec![
            json!({"person_id": 1, "movie_id": 1, "character": "Ripley"}),
            json!({"person_id": 1, "movie_id": 2, "character": "Eady"}),
        ]
    );
    assert_eq!(
        rows(&db, "SELECT * FROM movies ORDER BY id").await,
        vec![
            json!({"id": 1, "title": "Alien"}),
            json!({"id": 2, "title": "Heat"}),
        ]
    );
}

#[tokio::test]
async fn reference_objects_reuse_one_row() {
    let db = setup_test_db().await;
    let schema = test_schema();

    schema
        .query("Person")
        .unwrap()
        .insert_graph(json!([
            {"name": "Ann", "movies": [{"#id": "m", "title": "Up", "character": "A"}]},
            {"name": "Bob", "movies": [{"#ref": "m", "character": "B"}]}
        ]))
        .unwrap()
        .execute(&db)
        .await
        .unwrap();

    assert_eq!(
        rows(&db, "SELECT * FROM movies").await,
        vec![json!({"id": 1, "title": "Up"})]
    );
    assert_eq!(
        rows(&db, "SELECT * FROM persons_movies ORDER BY person_id").await,
        vec![
            json!({"person_id": 1, "movie_id": 1, "character": "A"}),
            json!({"person_id": 2, "movie_id": 1, "character": "B"}),
        ]
    );
}

#[tokio::test]
async fn database_references_link_existing_rows() {
    let db = setup_test_db().await;
    seed(&db).await;
    let schema = test_schema();

    let kit = schema
        .query("Animal")
        .unwrap()
        .insert_graph(json!({"name": "Kit", "owner": {"#dbRef": 2}}))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();
    assert_eq!(kit[0]["owner_id"], json!(2));

    let zed = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({
            "name": "Zed",
            "pets": [{"#dbRef": 1}],
            "movies": [{"#dbRef": 1, "character": "Ash"}]
        }))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();
    assert_eq!(zed[0]["id"], json!(5));

    assert_eq!(
        rows(&db, "SELECT owner_id FROM animals WHERE id = 1").await,
        vec![json!({"owner_id": 5})]
    );
    assert_eq!(
        rows(&db, "SELECT * FROM persons_movies WHERE person_id = 5").await,
        vec![json!({"person_id": 5, "movie_id": 1, "character": "Ash"})]
    );
    assert_eq!(
        rows(&db, "SELECT id FROM movies ORDER BY id").await,
        vec![json!({"id": 1}), json!({"id": 2})]
    );
}

#[tokio::test]
async fn allow_insert_limits_the_graph() {
    let db = setup_test_db().await;
    let schema = test_schema();
    let executor = CountingExecutor::new(db);

    let rejected = schema
        .query("Person")
        .unwrap()
        .allow_insert("pets")
        .unwrap()
        .insert_graph(json!({"name": "Ann", "movies": [{"title": "Up"}]}))
        .unwrap()
        .execute(&executor)
        .await;
    assert!(matches!(rejected, Err(RelationError::RelationNotAllowed { .. })));
    assert_eq!(executor.count(), 0);

    let accepted = schema
        .query("Person")
        .unwrap()
        .allow_insert("[pets, parent]")
        .unwrap()
        .insert_graph(json!({"name": "Ann", "pets": [{"name": "Kit"}]}))
        .unwrap()
        .execute(&executor)
        .await
        .unwrap();
    assert_eq!(accepted.into_rows().len(), 1);
    assert_eq!(executor.count(), 2);
}

#[tokio::test]
async fn failed_validation_rolls_back_the_transaction() {
    let db = setup_test_db().await;
    let schema = schema_builder()
        .validator(FieldRules::new().require("Animal", "name"))
        .build()
        .unwrap();

    let result = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({
            "name": "Ann",
            "pets": [{"name": "Kit"}, {"owner_id": null}]
        }))
        .unwrap()
        .execute_in_transaction(&db)
        .await;

    match result {
        Err(RelationError::Validation(errors)) => assert!(errors.contains("pets[1].name")),
        Err(other) => panic!("unexpected error {}", other),
        Ok(output) => panic!("unexpected output {:?}", output),
    }
    assert!(rows(&db, "SELECT * FROM persons").await.is_empty());
    assert!(rows(&db, "SELECT * FROM animals").await.is_empty());
}

#[tokio::test]
async fn insert_and_fetch_reloads_the_graph() {
    let db = setup_test_db().await;
    seed(&db).await;
    let schema = test_schema();

    let fetched = schema
        .query("Person")
        .unwrap()
        .insert_graph_and_fetch(json!({
            "name": "Ann",
            "pets": [{"name": "Kit"}],
            "movies": [{"#dbRef": 1, "character": "Ash"}]
        }))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    let ann = &fetched[0];
    assert_eq!(ann["id"], json!(5));
    assert_eq!(ann["mentor_id"], Value::Null);
    assert_eq!(ann["pets"][0]["name"], json!("Kit"));
    assert_eq!(ann["movies"][0]["title"], json!("Alien"));
    assert_eq!(ann["movies"][0]["character"], json!("Ash"));
}

#[tokio::test]
async fn malformed_references_are_rejected() {
    let schema = test_schema();

    let duplicate = schema.query("Person").unwrap().insert_graph(json!([
        {"#id": "a", "name": "Ann"},
        {"#id": "a", "name": "Bob"}
    ]));
    assert!(matches!(duplicate, Err(RelationError::DuplicateId { id }) if id == "a"));

    let dangling = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({"name": "Ann", "mentor": {"#ref": "nobody"}}));
    assert!(matches!(
        dangling,
        Err(RelationError::UnresolvedReference { reference }) if reference == "nobody"
    ));

    let template = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({"name": "#ref{nobody.name}"}));
    assert!(matches!(template, Err(RelationError::UnresolvedReference { .. })));

    let to_one_array = schema
        .query("Person")
        .unwrap()
        .insert_graph(json!({"name": "Ann", "parent": [{"name": "Old"}]}));
    match to_one_array {
        Err(RelationError::InvalidGraph { path, .. }) => assert_eq!(path, "parent"),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("array under a to-one relation must be rejected"),
    }
}

#[tokio::test]
async fn has_many_graph_hangs_off_the_bound_owner() {
    let db = setup_test_db().await;
    seed(&db).await;
    let schema = test_schema();
    let jen = record(json!({"id": 1, "name": "Jen"}));

    let inserted = schema
        .related_query("Person", "pets", vec![jen])
        .unwrap()
        .insert_graph(json!([{"name": "Kit"}, {"#dbRef": 2}]))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    assert_eq!(inserted[0]["id"], json!(4));
    assert_eq!(inserted[0]["owner_id"], json!(1));
    assert_eq!(
        rows(&db, "SELECT id, owner_id FROM animals ORDER BY id").await,
        vec![
            json!({"id": 1, "owner_id": 1}),
            json!({"id": 2, "owner_id": 1}),
            json!({"id": 3, "owner_id": 2}),
            json!({"id": 4, "owner_id": 1}),
        ]
    );
}

#[tokio::test]
async fn many_to_many_graph_writes_owner_join_rows_last() {
    let db = setup_test_db().await;
    seed(&db).await;
    let schema = test_schema();
    let kim = record(json!({"id": 3, "name": "Kim"}));

    let inserted = schema
        .related_query("Person", "movies", vec![kim])
        .unwrap()
        .insert_graph(json!([
            {"title": "Up", "character": "Russell", "actors": [{"name": "Pete"}]},
            {"#dbRef": 1, "character": "Ash"}
        ]))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    assert_eq!(inserted[0]["id"], json!(3));
    assert_eq!(inserted[0]["character"], json!("Russell"));
    assert_eq!(
        rows(&db, "SELECT * FROM movies ORDER BY id").await,
        vec![
            json!({"id": 1, "title": "Alien"}),
            json!({"id": 2, "title": "Heat"}),
            json!({"id": 3, "title": "Up"}),
        ]
    );
    assert_eq!(
        rows(&db, "SELECT * FROM persons_movies WHERE movie_id = 3 OR person_id = 3 ORDER BY rowid").await,
        vec![
            json!({"person_id": 5, "movie_id": 3, "character": null}),
            json!({"person_id": 3, "movie_id": 3, "character": "Russell"}),
            json!({"person_id": 3, "movie_id": 1, "character": "Ash"}),
        ]
    );
}

#[tokio::test]
async fn to_one_graph_patches_the_owner() {
    let db = setup_test_db().await;
    seed(&db).await;
    let schema = test_schema();
    let tom = record(json!({"id": 3, "name": "Tom", "owner_id": 2}));

    let inserted = schema
        .related_query("Animal", "owner", vec![tom.clone()])
        .unwrap()
        .insert_graph(json!({"name": "Neo", "pets": [{"name": "Bo"}]}))
        .unwrap()
        .execute(&db)
        .await
        .unwrap()
        .into_rows();

    assert_eq!(inserted[0]["id"], json!(5));
    assert_eq!(inserted[0]["pets"][0]["owner_id"], json!(5));
    assert_eq!(
        rows(&db, "SELECT id, name, owner_id FROM animals WHERE id >= 3 ORDER BY id").await,
        vec![
            json!({"id": 3, "name": "Tom", "owner_id": 5}),
            json!({"id": 4, "name": "Bo", "owner_id": 5}),
        ]
    );

    let two = schema
        .related_query("Animal", "owner", vec![tom])
        .unwrap()
        .insert_graph(json!([{"name": "A"}, {"name": "B"}]));
    assert!(matches!(two, Err(RelationError::Cardinality { .. })));
}

#[tokio::test]
async fn bound_graphs_need_one_owner_and_skip_empty_input() {
    let db = setup_test_db().await;
    let schema = test_schema();
    let executor = CountingExecutor::new(db);

    let owners = vec![record(json!({"id": 1})), record(json!({"id": 2}))];
    let many = schema
        .related_query("Person", "pets", owners)
        .unwrap()
        .insert_graph(json!({"name": "Kit"}));
    assert!(matches!(many, Err(RelationError::InvalidOperation { .. })));

    let empty = schema
        .related_query("Person", "pets", vec![record(json!({"id": 1}))])
        .unwrap()
        .insert_graph(json!([]))
        .unwrap()
        .execute(&executor)
        .await
        .unwrap();
    assert_eq!(empty, QueryOutput::Rows(Vec::new()));
    assert_eq!(executor.count(), 0);
}
