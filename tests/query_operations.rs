mod common;

use common::{backends, Fixture};
use objectdb::engine::console::{LogLevel, MemorySink};
use objectdb::engine::store::{CollectionOptions, IndexOptions, StoreError, TransactionMode};
use objectdb::{Connection, Key, MigrationRegistry, MigrationStep, QueryError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Admin {
    id: i64,
    name: String,
    email: String,
}

fn admin(id: i64, name: &str) -> Admin {
    Admin {
        id,
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
    }
}

fn registry() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();
    registry
        .register(
            "App",
            1,
            MigrationStep::create_collection("admins", CollectionOptions::key_path("id")),
        )
        .register(
            "App",
            1,
            MigrationStep::new("admins_by_email", |handle| {
                handle.create_index("admins", IndexOptions::new("by_email", "email").unique())
            }),
        )
        .register(
            "App",
            1,
            MigrationStep::create_collection(
                "events",
                CollectionOptions::key_path("meta.seq").auto_increment(),
            ),
        );
    registry
}

async fn open(fixture: &Fixture, sink: Arc<MemorySink>) -> Connection {
    let conn = Connection::with_sink(fixture.backend.clone(), "App", 1, sink).unwrap();
    conn.open_with_registry(&registry()).await.unwrap();
    conn
}

#[tokio::test]
async fn test_batch_insert_skips_duplicate_key() {
    for fixture in backends() {
        let sink = MemorySink::new();
        let conn = open(&fixture, sink.clone()).await;
        let admins = conn.prepare_query_as::<Admin>("admins", None);

        admins.insert(&admin(2, "Original")).await.unwrap();
        admins
            .insert_many(&[admin(1, "A"), admin(2, "Duplicate"), admin(3, "C")])
            .await
            .unwrap();

        let found = admins.where_in([1, 2, 3]).await.unwrap();
        assert_eq!(
            found,
            vec![admin(1, "A"), admin(2, "Original"), admin(3, "C")],
            "{}",
            fixture.label
        );
        assert!(sink.contains(LogLevel::Info, "skipping record"));
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_where_in_omits_missing_keys() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let admins = conn.prepare_query_as::<Admin>("admins", None);
        admins.insert_many(&[admin(1, "A"), admin(4, "D")]).await.unwrap();

        let found = admins.where_in([4, 5, 1, 6]).await.unwrap();
        assert_eq!(found, vec![admin(4, "D"), admin(1, "A")], "{}", fixture.label);
        assert!(admins.where_in(Vec::<Key>::new()).await.unwrap().is_empty());
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_find_update_delete_round_trip() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let admins = conn.prepare_query_as::<Admin>("admins", None);

        assert_eq!(admins.find(1).await.unwrap(), None, "{}", fixture.label);

        admins.insert(&admin(1, "A")).await.unwrap();
        assert_eq!(admins.find(1).await.unwrap(), Some(admin(1, "A")));

        let renamed = Admin {
            name: "Renamed".to_string(),
            ..admin(1, "A")
        };
        admins.update(&renamed).await.unwrap();
        assert_eq!(admins.find(1).await.unwrap(), Some(renamed));

        // Upsert of a new key
        admins.update(&admin(7, "G")).await.unwrap();
        assert_eq!(admins.find(7).await.unwrap(), Some(admin(7, "G")));

        admins.delete(1).await.unwrap();
        assert_eq!(admins.find(1).await.unwrap(), None);
        admins.delete(1).await.unwrap();

        admins.delete_many([7, 8]).await.unwrap();
        assert!(admins.where_in([1, 7]).await.unwrap().is_empty(), "{}", fixture.label);
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_unique_index_suppressed_on_insert_surfaced_on_update() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let admins = conn.prepare_query_as::<Admin>("admins", None);
        admins.insert(&admin(1, "A")).await.unwrap();

        let clash = Admin {
            email: "a@example.com".to_string(),
            ..admin(2, "B")
        };
        admins.insert(&clash).await.unwrap();
        assert_eq!(admins.find(2).await.unwrap(), None, "{}", fixture.label);

        let err = admins.update(&clash).await.unwrap_err();
        assert!(
            matches!(err, QueryError::Transaction(ref e) if e.is_constraint()),
            "{}: {:?}",
            fixture.label,
            err
        );
        assert_eq!(admins.find(2).await.unwrap(), None);
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_lookup_through_index() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        conn.prepare_query_as::<Admin>("admins", None)
            .insert_many(&[admin(1, "A"), admin(2, "B")])
            .await
            .unwrap();

        let by_email = conn.prepare_query_as::<Admin>("admins", Some("by_email"));
        assert_eq!(
            by_email.find("b@example.com").await.unwrap(),
            Some(admin(2, "B")),
            "{}",
            fixture.label
        );
        let found = by_email
            .where_in(["a@example.com", "nobody@example.com"])
            .await
            .unwrap();
        assert_eq!(found, vec![admin(1, "A")]);

        let missing = conn.prepare_query("admins", Some("by_name"));
        assert!(matches!(
            missing.find("A").await,
            Err(QueryError::Transaction(StoreError::NotFound(_)))
        ));
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_auto_increment_nested_key_path() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let events = conn.prepare_query("events", None);

        events
            .insert_many(&[json!({ "kind": "login" }), json!({ "kind": "logout" })])
            .await
            .unwrap();
        events
            .insert(&json!({ "kind": "manual", "meta": { "seq": 10 } }))
            .await
            .unwrap();
        events.insert(&json!({ "kind": "after" })).await.unwrap();

        assert_eq!(
            events.find(2).await.unwrap(),
            Some(json!({ "kind": "logout", "meta": { "seq": 2 } })),
            "{}",
            fixture.label
        );
        assert_eq!(
            events.find(11).await.unwrap(),
            Some(json!({ "kind": "after", "meta": { "seq": 11 } })),
            "{}",
            fixture.label
        );
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_exhausted_key_generator() {
    for fixture in backends() {
        let sink = MemorySink::new();
        let conn = open(&fixture, sink.clone()).await;
        let events = conn.prepare_query("events", None);

        let last = json!({ "kind": "max", "meta": { "seq": i64::MAX } });
        events.insert(&last).await.unwrap();
        assert_eq!(events.find(i64::MAX).await.unwrap(), Some(last), "{}", fixture.label);

        // Generated keys are refused as a constraint, so insert skips the record
        events.insert(&json!({ "kind": "late" })).await.unwrap();
        assert!(sink.contains(LogLevel::Info, "exhausted"), "{}", fixture.label);
        assert_eq!(events.find(1).await.unwrap(), None, "{}", fixture.label);

        let err = events.update(&json!({ "kind": "late" })).await.unwrap_err();
        assert!(
            matches!(err, QueryError::Transaction(ref e) if e.is_constraint()),
            "{}: {err}",
            fixture.label
        );

        // Explicit keys still work
        events
            .insert(&json!({ "kind": "explicit", "meta": { "seq": 5 } }))
            .await
            .unwrap();
        assert_eq!(
            events.find(5).await.unwrap(),
            Some(json!({ "kind": "explicit", "meta": { "seq": 5 } })),
            "{}",
            fixture.label
        );
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_writer_waits_for_open_transaction() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let other = open(&fixture, MemorySink::new()).await;
        let admins = other.prepare_query_as::<Admin>("admins", None);

        let handle = conn.handle().unwrap();
        let tx = handle
            .transaction(&["admins"], TransactionMode::ReadWrite)
            .await
            .unwrap();

        // The second writer has to yield until the first one commits
        let first = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.add("admins", serde_json::to_value(admin(1, "First")).unwrap())
                .await
                .unwrap();
            tx.commit().await.unwrap();
        };
        let second_admin = admin(2, "Second");
        let second = admins.insert(&second_admin);
        let ((), inserted) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(first, second)
        })
        .await
        .unwrap();
        inserted.unwrap();

        let found = admins.where_in([1, 2]).await.unwrap();
        assert_eq!(found, vec![admin(1, "First"), admin(2, "Second")], "{}", fixture.label);
        conn.close().unwrap();
        other.close().unwrap();
    }
}

#[tokio::test]
async fn test_text_and_numeric_keys_are_distinct() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let admins = conn.prepare_query("admins", None);
        admins
            .insert_many(&[
                json!({ "id": 1, "email": "one@example.com" }),
                json!({ "id": "1", "email": "text@example.com" }),
            ])
            .await
            .unwrap();

        let found = admins.where_in([Key::Int(1), Key::Text("1".into())]).await.unwrap();
        assert_eq!(found.len(), 2, "{}", fixture.label);
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_missing_key_fails_insert() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let admins = conn.prepare_query("admins", None);

        let err = admins
            .insert_many(&[json!({ "id": 1, "email": "a@x" }), json!({ "email": "b@x" })])
            .await
            .unwrap_err();
        assert!(
            matches!(err, QueryError::Transaction(StoreError::Data(_))),
            "{}: {:?}",
            fixture.label,
            err
        );

        // The aborted transaction keeps nothing
        assert_eq!(admins.find(1).await.unwrap(), None, "{}", fixture.label);
        conn.close().unwrap();
    }
}

#[tokio::test]
async fn test_query_bound_before_open_and_after_close() {
    for fixture in backends() {
        let conn = Connection::new(fixture.backend.clone(), "App", 1).unwrap();
        let early = conn.prepare_query("admins", None);
        assert!(matches!(early.find(1).await, Err(QueryError::NotOpen)));

        conn.open_with_registry(&registry()).await.unwrap();
        // Still bound to the absent handle
        assert!(matches!(early.find(1).await, Err(QueryError::NotOpen)));

        let late = conn.prepare_query("admins", None);
        conn.close().unwrap();
        assert!(
            matches!(late.find(1).await, Err(QueryError::Transaction(StoreError::InvalidState(_)))),
            "{}",
            fixture.label
        );
    }
}

#[tokio::test]
async fn test_unknown_collection() {
    for fixture in backends() {
        let conn = open(&fixture, MemorySink::new()).await;
        let ghosts = conn.prepare_query("ghosts", None);
        assert!(matches!(
            ghosts.find(1).await,
            Err(QueryError::Transaction(StoreError::NotFound(_)))
        ));
        conn.close().unwrap();
    }
}
